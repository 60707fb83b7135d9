//! The cloud-client boundary.
//!
//! The engine's only view of a cloud is the `CloudClient` trait: a named,
//! synchronous operation call whose paginated results stream back through an
//! iterator of pages. Provider crates wrap their SDKs behind it; the engine
//! makes no assumption about which SDK that is. Credentials are likewise
//! hidden behind `SessionFactory`, which hands out clients per region and is
//! expected to construct them lazily and share them process-wide.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::CloudError;

/// Iterator of result pages. Each item is one raw response page.
pub type PageIter<'a> = Box<dyn Iterator<Item = Result<Value, CloudError>> + Send + 'a>;

/// Synchronous cloud API surface.
///
/// Conventions the engine relies on:
/// - `operation` is addressed as `(service, operation)`, e.g.
///   `("ec2", "DescribeInstances")`.
/// - Enumeration operations return one or more pages; mutation operations
///   return a single page (often empty).
/// - Universal tag resolution is addressed as
///   `("tagging", "GetResources")` with `{"ids": [...]}` params and yields
///   pages of `{"Id": ..., "Tags": [...]}` objects.
pub trait CloudClient: Send + Sync {
    fn operation(
        &self,
        service: &str,
        operation: &str,
        params: &Value,
    ) -> Result<PageIter<'_>, CloudError>;

    /// Release any underlying connections. Optional; defaults to a no-op.
    fn close(&self) {}
}

/// Process-wide credential and client source. Implementations cache clients
/// per region and must be thread-safe.
pub trait SessionFactory: Send + Sync {
    fn client(&self, region: &str) -> Result<Arc<dyn CloudClient>, CloudError>;

    /// Account (or project / subscription) identifier the session is bound
    /// to, used in cache keys and variable expansion.
    fn account_id(&self) -> String;
}

/// One recorded call against a [`StaticCloudClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub service: String,
    pub operation: String,
    pub params: Value,
}

/// Canned-response client used by tests, fixtures and the built-in static
/// provider. Responses are keyed by `service.operation`; every invocation
/// is recorded, which is what makes dry-run behavior assertable.
#[derive(Default)]
pub struct StaticCloudClient {
    responses: Mutex<BTreeMap<String, Vec<Value>>>,
    errors: Mutex<BTreeMap<String, Vec<CloudError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl StaticCloudClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `pages` for every call to `service.operation`.
    pub fn respond(&self, service: &str, operation: &str, pages: Vec<Value>) {
        self.responses
            .lock()
            .insert(format!("{service}.{operation}"), pages);
    }

    /// Queue errors for `service.operation`; each call consumes one before
    /// the canned responses apply again. Used to exercise retry paths.
    pub fn fail_next(&self, service: &str, operation: &str, errors: Vec<CloudError>) {
        self.errors
            .lock()
            .entry(format!("{service}.{operation}"))
            .or_default()
            .extend(errors);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Count of recorded calls for `service.operation`.
    pub fn call_count(&self, service: &str, operation: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.service == service && c.operation == operation)
            .count()
    }
}

impl CloudClient for StaticCloudClient {
    fn operation(
        &self,
        service: &str,
        operation: &str,
        params: &Value,
    ) -> Result<PageIter<'_>, CloudError> {
        let key = format!("{service}.{operation}");
        self.calls.lock().push(RecordedCall {
            service: service.to_string(),
            operation: operation.to_string(),
            params: params.clone(),
        });
        if let Some(queued) = self.errors.lock().get_mut(&key) {
            if !queued.is_empty() {
                return Err(queued.remove(0));
            }
        }
        let pages = self
            .responses
            .lock()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| vec![Value::Object(Map::new())]);
        Ok(Box::new(pages.into_iter().map(Ok)))
    }
}

/// Session factory serving one shared [`StaticCloudClient`] for every
/// region.
pub struct StaticSessionFactory {
    account_id: String,
    client: Arc<StaticCloudClient>,
}

impl StaticSessionFactory {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            client: Arc::new(StaticCloudClient::new()),
        }
    }

    pub fn client_handle(&self) -> Arc<StaticCloudClient> {
        self.client.clone()
    }
}

impl SessionFactory for StaticSessionFactory {
    fn client(&self, _region: &str) -> Result<Arc<dyn CloudClient>, CloudError> {
        Ok(self.client.clone())
    }

    fn account_id(&self) -> String {
        self.account_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn static_client_pages_and_records() {
        let client = StaticCloudClient::new();
        client.respond(
            "ec2",
            "DescribeInstances",
            vec![json!({"Reservations": [1]}), json!({"Reservations": [2]})],
        );
        let pages: Vec<_> = client
            .operation("ec2", "DescribeInstances", &json!({}))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(client.call_count("ec2", "DescribeInstances"), 1);
    }

    #[test]
    fn queued_errors_surface_before_responses() {
        let client = StaticCloudClient::new();
        client.respond("ec2", "StopInstances", vec![json!({})]);
        client.fail_next(
            "ec2",
            "StopInstances",
            vec![CloudError::transient("ec2.StopInstances", "throttled")],
        );
        assert!(client.operation("ec2", "StopInstances", &json!({})).is_err());
        assert!(client.operation("ec2", "StopInstances", &json!({})).is_ok());
        assert_eq!(client.call_count("ec2", "StopInstances"), 2);
    }
}
