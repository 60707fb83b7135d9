//! Recursive-descent parser producing the expression AST.
//!
//! Precedence, loosest first: pipe, or, comparison, path postfixes.
//! Projections (`[*]`, `[]`, `[?...]`) bind the remainder of their path
//! segment as the projected right-hand side and stop at a pipe, matching
//! the conventional semantics for these expressions.

use serde_json::Value;

use crate::QueryError;
use crate::lexer::{Lexer, Token};

#[derive(Debug, Clone, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    /// `@` — the current value.
    Identity,
    Field(String),
    Literal(Value),
    /// `lhs.rhs`
    Subexpr(Box<Ast>, Box<Ast>),
    /// `lhs[n]`
    Index(Box<Ast>, i64),
    /// `lhs[*].rhs`
    Projection(Box<Ast>, Box<Ast>),
    /// `lhs[].rhs`
    FlattenProjection(Box<Ast>, Box<Ast>),
    /// `lhs[?cond].rhs`
    FilterProjection(Box<Ast>, Box<Ast>, Box<Ast>),
    Pipe(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    Comparison(Box<Ast>, CmpOp, Box<Ast>),
    Function(String, Vec<Ast>),
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn parse(src: &str) -> Result<Ast, QueryError> {
        let tokens = Lexer::new(src).tokenize()?;
        let mut parser = Parser { tokens, pos: 0 };
        let ast = parser.pipe_expr()?;
        parser.expect(Token::Eof)?;
        Ok(ast)
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens.get(self.pos).cloned().unwrap_or(Token::Eof);
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), QueryError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected {token:?}")))
        }
    }

    fn unexpected(&self, context: &str) -> QueryError {
        QueryError::Parse {
            pos: self.pos,
            message: format!("{context}, found {:?}", self.peek()),
        }
    }

    fn pipe_expr(&mut self) -> Result<Ast, QueryError> {
        let mut lhs = self.or_expr()?;
        while self.eat(&Token::Pipe) {
            let rhs = self.or_expr()?;
            lhs = Ast::Pipe(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn or_expr(&mut self) -> Result<Ast, QueryError> {
        let mut lhs = self.cmp_expr()?;
        while self.eat(&Token::Or) {
            let rhs = self.cmp_expr()?;
            lhs = Ast::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self) -> Result<Ast, QueryError> {
        let lhs = self.path_expr()?;
        let op = match self.peek() {
            Token::Eq => CmpOp::Eq,
            Token::Ne => CmpOp::Ne,
            Token::Lt => CmpOp::Lt,
            Token::Le => CmpOp::Le,
            Token::Gt => CmpOp::Gt,
            Token::Ge => CmpOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.path_expr()?;
        Ok(Ast::Comparison(Box::new(lhs), op, Box::new(rhs)))
    }

    /// A primary followed by its postfix chain.
    fn path_expr(&mut self) -> Result<Ast, QueryError> {
        let primary = self.primary()?;
        self.postfix_chain(primary)
    }

    fn primary(&mut self) -> Result<Ast, QueryError> {
        match self.advance() {
            Token::At => Ok(Ast::Identity),
            Token::Ident(name) => {
                if self.peek() == &Token::LParen {
                    self.function_call(name)
                } else {
                    Ok(Ast::Field(name))
                }
            }
            Token::QuotedIdent(name) => Ok(Ast::Field(name)),
            Token::RawString(s) => Ok(Ast::Literal(Value::String(s))),
            Token::Literal(v) => Ok(Ast::Literal(v)),
            Token::Number(n) => Ok(Ast::Literal(Value::from(n))),
            // A bare leading bracket indexes/projects the current value.
            Token::LBracket => {
                self.pos -= 1;
                self.postfix_once(Ast::Identity)
            }
            Token::Flatten | Token::LFilter => {
                self.pos -= 1;
                self.postfix_once(Ast::Identity)
            }
            _ => {
                self.pos -= 1;
                Err(self.unexpected("expected expression"))
            }
        }
    }

    fn function_call(&mut self, name: String) -> Result<Ast, QueryError> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() != &Token::RParen {
            loop {
                args.push(self.pipe_expr()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        Ok(Ast::Function(name, args))
    }

    fn postfix_chain(&mut self, mut current: Ast) -> Result<Ast, QueryError> {
        loop {
            match self.peek() {
                Token::Dot | Token::LBracket | Token::Flatten | Token::LFilter => {
                    current = self.postfix_once(current)?;
                }
                _ => return Ok(current),
            }
        }
    }

    /// Apply exactly one postfix operator to `current`. Projection
    /// operators recursively absorb the rest of the path segment as their
    /// right-hand side.
    fn postfix_once(&mut self, current: Ast) -> Result<Ast, QueryError> {
        match self.advance() {
            Token::Dot => {
                let rhs = match self.advance() {
                    Token::Ident(name) => {
                        if self.peek() == &Token::LParen {
                            self.function_call(name)?
                        } else {
                            Ast::Field(name)
                        }
                    }
                    Token::QuotedIdent(name) => Ast::Field(name),
                    Token::Star => {
                        // `lhs.*` — project over the object's values.
                        let rhs = self.projection_rhs()?;
                        return Ok(Ast::Projection(
                            Box::new(Ast::Function("values".to_string(), vec![current])),
                            Box::new(rhs),
                        ));
                    }
                    _ => {
                        self.pos -= 1;
                        return Err(self.unexpected("expected identifier after '.'"));
                    }
                };
                Ok(Ast::Subexpr(Box::new(current), Box::new(rhs)))
            }
            Token::Flatten => {
                let rhs = self.projection_rhs()?;
                Ok(Ast::FlattenProjection(Box::new(current), Box::new(rhs)))
            }
            Token::LFilter => {
                let cond = self.or_expr()?;
                self.expect(Token::RBracket)?;
                let rhs = self.projection_rhs()?;
                Ok(Ast::FilterProjection(
                    Box::new(current),
                    Box::new(cond),
                    Box::new(rhs),
                ))
            }
            Token::LBracket => match self.advance() {
                Token::Number(n) => {
                    self.expect(Token::RBracket)?;
                    Ok(Ast::Index(Box::new(current), n))
                }
                Token::Star => {
                    self.expect(Token::RBracket)?;
                    let rhs = self.projection_rhs()?;
                    Ok(Ast::Projection(Box::new(current), Box::new(rhs)))
                }
                _ => {
                    self.pos -= 1;
                    Err(self.unexpected("expected index or '*'"))
                }
            },
            _ => {
                self.pos -= 1;
                Err(self.unexpected("expected postfix operator"))
            }
        }
    }

    /// The remainder of a path segment after a projection operator. Stops
    /// before pipe / or / comparison tokens, and before `[]`: the flatten
    /// operator ends the current projection and applies to its whole
    /// result, so `a[].b[]` flattens left to right instead of nesting.
    fn projection_rhs(&mut self) -> Result<Ast, QueryError> {
        let mut current = Ast::Identity;
        loop {
            match self.peek() {
                Token::Dot | Token::LBracket | Token::LFilter => {
                    current = self.postfix_once(current)?;
                }
                _ => return Ok(current),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_path() {
        let ast = Parser::parse("State.Name").unwrap();
        assert_eq!(
            ast,
            Ast::Subexpr(
                Box::new(Ast::Field("State".into())),
                Box::new(Ast::Field("Name".into())),
            )
        );
    }

    #[test]
    fn projection_absorbs_segment() {
        let ast = Parser::parse("Instances[*].State.Name").unwrap();
        let Ast::Projection(lhs, rhs) = ast else {
            panic!("expected projection");
        };
        assert_eq!(*lhs, Ast::Field("Instances".into()));
        assert_eq!(
            *rhs,
            Ast::Subexpr(
                Box::new(Ast::Subexpr(
                    Box::new(Ast::Identity),
                    Box::new(Ast::Field("State".into())),
                )),
                Box::new(Ast::Field("Name".into())),
            )
        );
    }

    #[test]
    fn chained_flattens_are_left_associative() {
        let ast = Parser::parse("Reservations[].Instances[]").unwrap();
        let Ast::FlattenProjection(outer_lhs, outer_rhs) = ast else {
            panic!("expected outer flatten");
        };
        assert_eq!(*outer_rhs, Ast::Identity);
        let Ast::FlattenProjection(inner_lhs, inner_rhs) = *outer_lhs else {
            panic!("expected inner flatten");
        };
        assert_eq!(*inner_lhs, Ast::Field("Reservations".into()));
        assert_eq!(
            *inner_rhs,
            Ast::Subexpr(
                Box::new(Ast::Identity),
                Box::new(Ast::Field("Instances".into())),
            )
        );
    }

    #[test]
    fn filter_projection_with_pipe() {
        let ast = Parser::parse("Tags[?Key=='Env'].Value | [0]").unwrap();
        let Ast::Pipe(lhs, rhs) = ast else {
            panic!("expected pipe");
        };
        assert!(matches!(*lhs, Ast::FilterProjection(..)));
        assert_eq!(*rhs, Ast::Index(Box::new(Ast::Identity), 0));
    }

    #[test]
    fn function_calls_nest() {
        let ast = Parser::parse("length(split(Name, '-'))").unwrap();
        let Ast::Function(name, args) = ast else {
            panic!("expected function");
        };
        assert_eq!(name, "length");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn trailing_garbage_rejected() {
        assert!(Parser::parse("State.Name )").is_err());
    }
}
