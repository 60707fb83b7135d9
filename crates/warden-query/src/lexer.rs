//! Tokenizer for key expressions.

use crate::QueryError;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Unquoted identifier.
    Ident(String),
    /// `"quoted"` identifier, for keys with unusual characters.
    QuotedIdent(String),
    /// `'raw'` string literal.
    RawString(String),
    /// Backtick-delimited JSON literal.
    Literal(Value),
    Number(i64),
    Dot,
    Star,
    At,
    LBracket,
    RBracket,
    /// `[?` opening a filter projection.
    LFilter,
    /// `[]` flatten.
    Flatten,
    LParen,
    RParen,
    Comma,
    Pipe,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Eof,
}

pub struct Lexer<'a> {
    src: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().peekable(),
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, QueryError> {
        let mut out = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            out.push(token);
            if done {
                return Ok(out);
            }
        }
    }

    fn error(&mut self, message: impl Into<String>) -> QueryError {
        let pos = self.chars.peek().map(|(i, _)| *i).unwrap_or(self.src.len());
        QueryError::Parse {
            pos,
            message: message.into(),
        }
    }

    fn next_token(&mut self) -> Result<Token, QueryError> {
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
            } else {
                break;
            }
        }
        let Some((start, c)) = self.chars.next() else {
            return Ok(Token::Eof);
        };
        match c {
            '.' => Ok(Token::Dot),
            '*' => Ok(Token::Star),
            '@' => Ok(Token::At),
            '(' => Ok(Token::LParen),
            ')' => Ok(Token::RParen),
            ']' => Ok(Token::RBracket),
            ',' => Ok(Token::Comma),
            '[' => match self.chars.peek() {
                Some(&(_, '?')) => {
                    self.chars.next();
                    Ok(Token::LFilter)
                }
                Some(&(_, ']')) => {
                    self.chars.next();
                    Ok(Token::Flatten)
                }
                _ => Ok(Token::LBracket),
            },
            '|' => {
                if let Some(&(_, '|')) = self.chars.peek() {
                    self.chars.next();
                    Ok(Token::Or)
                } else {
                    Ok(Token::Pipe)
                }
            }
            '=' => {
                if let Some(&(_, '=')) = self.chars.peek() {
                    self.chars.next();
                    Ok(Token::Eq)
                } else {
                    Err(self.error("expected '=='"))
                }
            }
            '!' => {
                if let Some(&(_, '=')) = self.chars.peek() {
                    self.chars.next();
                    Ok(Token::Ne)
                } else {
                    Err(self.error("expected '!='"))
                }
            }
            '<' => {
                if let Some(&(_, '=')) = self.chars.peek() {
                    self.chars.next();
                    Ok(Token::Le)
                } else {
                    Ok(Token::Lt)
                }
            }
            '>' => {
                if let Some(&(_, '=')) = self.chars.peek() {
                    self.chars.next();
                    Ok(Token::Ge)
                } else {
                    Ok(Token::Gt)
                }
            }
            '"' => self.delimited(start, '"').map(Token::QuotedIdent),
            '\'' => self.delimited(start, '\'').map(Token::RawString),
            '`' => {
                let raw = self.delimited(start, '`')?;
                let value = serde_json::from_str(&raw)
                    .map_err(|e| self.error(format!("invalid literal: {e}")))?;
                Ok(Token::Literal(value))
            }
            '-' | '0'..='9' => self.number(start),
            c if is_ident_start(c) => Ok(Token::Ident(self.ident(start))),
            c => Err(self.error(format!("unexpected character {c:?}"))),
        }
    }

    /// Consume up to the closing `delim`, handling backslash escapes.
    fn delimited(&mut self, start: usize, delim: char) -> Result<String, QueryError> {
        let mut out = String::new();
        while let Some((_, c)) = self.chars.next() {
            match c {
                c if c == delim => return Ok(out),
                '\\' => match self.chars.next() {
                    Some((_, escaped)) => {
                        if escaped != delim && escaped != '\\' {
                            out.push('\\');
                        }
                        out.push(escaped);
                    }
                    None => break,
                },
                c => out.push(c),
            }
        }
        Err(QueryError::Parse {
            pos: start,
            message: format!("unterminated {delim} delimiter"),
        })
    }

    fn number(&mut self, start: usize) -> Result<Token, QueryError> {
        let mut end = start + 1;
        while let Some(&(i, c)) = self.chars.peek() {
            if c.is_ascii_digit() {
                self.chars.next();
                end = i + 1;
            } else {
                break;
            }
        }
        self.src[start..end]
            .parse::<i64>()
            .map(Token::Number)
            .map_err(|_| QueryError::Parse {
                pos: start,
                message: "invalid number".to_string(),
            })
    }

    fn ident(&mut self, start: usize) -> String {
        let mut end = start + 1;
        while let Some(&(i, c)) = self.chars.peek() {
            if is_ident_continue(c) {
                self.chars.next();
                end = i + c.len_utf8();
            } else {
                break;
            }
        }
        self.src[start..end].to_string()
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lex(src: &str) -> Vec<Token> {
        Lexer::new(src).tokenize().unwrap()
    }

    #[test]
    fn path_tokens() {
        assert_eq!(
            lex("State.Name"),
            vec![
                Token::Ident("State".into()),
                Token::Dot,
                Token::Ident("Name".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn filter_projection_tokens() {
        assert_eq!(
            lex("Tags[?Key=='Env'].Value"),
            vec![
                Token::Ident("Tags".into()),
                Token::LFilter,
                Token::Ident("Key".into()),
                Token::Eq,
                Token::RawString("Env".into()),
                Token::RBracket,
                Token::Dot,
                Token::Ident("Value".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn flatten_pipe_and_literals() {
        assert_eq!(
            lex("Reservations[].Instances[] | [0] || `{\"a\": 1}`"),
            vec![
                Token::Ident("Reservations".into()),
                Token::Flatten,
                Token::Dot,
                Token::Ident("Instances".into()),
                Token::Flatten,
                Token::Pipe,
                Token::LBracket,
                Token::Number(0),
                Token::RBracket,
                Token::Or,
                Token::Literal(json!({"a": 1})),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn unterminated_string_errors() {
        assert!(Lexer::new("'abc").tokenize().is_err());
    }
}
