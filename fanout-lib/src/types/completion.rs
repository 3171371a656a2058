use std::collections::HashMap;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use url::Url;

use crate::{DriverFault, StatsCollector, Timings, TransferError};

/// Result of a single drained request.
///
/// A request that failed at the transport still completes: it has no status,
/// an empty body and `error` set.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Caller supplied key
    pub key: String,
    /// Requested URL
    pub url: Url,
    /// URL of the final response after redirects; the requested URL on error
    pub effective_url: Url,
    /// Status of the final response
    pub status: Option<StatusCode>,
    /// Response headers, only when header collection is enabled
    pub headers: Option<HeaderMap>,
    /// Response body; empty when buffering is off or the transfer failed
    pub body: Bytes,
    /// Transport failure, if any
    pub error: Option<TransferError>,
    /// Timing marks reported by the transport
    pub timings: Timings,
    /// When the request was dispatched
    pub dispatched_at: Instant,
}

impl Completion {
    /// Whether a response was received
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Body as text, with invalid UTF-8 replaced
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserialize the body as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// Everything a client has recorded so far, across batches.
///
/// A key that is submitted again overwrites its earlier entries.
#[derive(Debug, Default)]
pub struct BatchResults {
    pub(crate) completed: HashMap<String, Completion>,
    pub(crate) errors: HashMap<String, TransferError>,
    pub(crate) driver_errors: Vec<DriverFault>,
    pub(crate) unresolved: Vec<String>,
    pub(crate) stats: StatsCollector,
}

impl BatchResults {
    /// Completion of `key`, failed transfers included
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Completion> {
        self.completed.get(key)
    }

    /// Transfer error of `key`
    #[must_use]
    pub fn error(&self, key: &str) -> Option<&TransferError> {
        self.errors.get(key)
    }

    /// All completions by key
    #[must_use]
    pub const fn completed(&self) -> &HashMap<String, Completion> {
        &self.completed
    }

    /// Completions that received a response
    pub fn succeeded(&self) -> impl Iterator<Item = (&String, &Completion)> {
        self.completed.iter().filter(|(_, c)| c.is_ok())
    }

    /// All transfer errors by key
    #[must_use]
    pub const fn errors(&self) -> &HashMap<String, TransferError> {
        &self.errors
    }

    /// Faults of the driver itself
    #[must_use]
    pub fn driver_errors(&self) -> &[DriverFault] {
        &self.driver_errors
    }

    /// Keys left queued or in flight by any driver fault so far. A key leaves
    /// the list when it is submitted again.
    #[must_use]
    pub fn unresolved(&self) -> &[String] {
        &self.unresolved
    }

    /// Timing breakdowns, recorded while stats are enabled
    #[must_use]
    pub const fn stats(&self) -> &StatsCollector {
        &self.stats
    }

    /// Forget everything recorded so far
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Store a completion, overwriting an earlier result of the same key
    pub(crate) fn record(&mut self, completion: Completion) {
        match &completion.error {
            Some(error) => {
                self.errors.insert(completion.key.clone(), error.clone());
            }
            None => {
                self.errors.remove(&completion.key);
            }
        }
        self.completed.insert(completion.key.clone(), completion);
    }

    /// A key left unresolved by a fault was submitted again
    pub(crate) fn requeue(&mut self, key: &str) {
        self.unresolved.retain(|k| k != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransferErrorKind;

    fn completion(key: &str, error: Option<TransferError>) -> Completion {
        let url = Url::parse("http://example.com/").unwrap();
        Completion {
            key: key.to_string(),
            url: url.clone(),
            effective_url: url,
            status: error.is_none().then_some(StatusCode::OK),
            headers: None,
            body: Bytes::from(r#"{"id": 7}"#),
            error,
            timings: Timings::default(),
            dispatched_at: Instant::now(),
        }
    }

    #[test]
    fn test_completion_body_helpers() {
        let c = completion("a", None);
        assert!(c.is_ok());
        assert_eq!(c.text(), r#"{"id": 7}"#);
        let value: serde_json::Value = c.json().unwrap();
        assert_eq!(value["id"], 7);
    }

    #[test]
    fn test_succeeded_skips_failures() {
        let mut results = BatchResults::default();
        let failure = TransferError::new(TransferErrorKind::Connect, "refused");
        results.record(completion("a", None));
        results.record(completion("b", Some(failure)));

        let succeeded: Vec<_> = results.succeeded().map(|(k, _)| k.as_str()).collect();
        assert_eq!(succeeded, vec!["a"]);
        assert_eq!(results.completed().len(), 2);
        assert!(results.error("b").is_some());
    }

    #[test]
    fn test_new_result_overwrites_old_error() {
        let mut results = BatchResults::default();
        let failure = TransferError::new(TransferErrorKind::Timeout, "slow");
        results.record(completion("a", Some(failure)));
        results.record(completion("a", None));

        assert!(results.get("a").unwrap().is_ok());
        assert!(results.error("a").is_none());
    }
}
