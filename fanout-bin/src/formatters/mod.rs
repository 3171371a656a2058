pub(crate) mod json;
pub(crate) mod log;
pub(crate) mod plain;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use fanout_lib::{BatchClient, Completion, TimingBreakdown, TransferError, Transport};
use http::HeaderMap;
use serde::Serialize;

/// How results are printed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// One line per request while the batch runs, then a summary
    #[default]
    Plain,
    /// A single JSON document once the batch is done
    Json,
}

pub(crate) trait ReportFormatter {
    /// Format the report of a finished batch
    fn format(&self, report: &Report<'_>) -> Result<String>;
}

pub(crate) fn get_report_formatter(format: OutputFormat) -> Box<dyn ReportFormatter> {
    match format {
        OutputFormat::Plain => Box::new(plain::Plain),
        OutputFormat::Json => Box::new(json::Json),
    }
}

/// A completion fails if no response arrived or the response has an error
/// status.
pub(crate) fn is_failure(completion: &Completion) -> bool {
    completion
        .status
        .is_none_or(|status| status.is_client_error() || status.is_server_error())
}

/// Millisecond precision is plenty for humans
pub(crate) fn format_elapsed(elapsed: Duration) -> String {
    let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    humantime::format_duration(Duration::from_millis(millis)).to_string()
}

/// Everything printed about a finished batch
#[derive(Debug, Serialize)]
pub(crate) struct Report<'a> {
    pub(crate) total: usize,
    pub(crate) successful: usize,
    pub(crate) failed: usize,
    pub(crate) results: Vec<ResultView<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) driver_errors: Vec<String>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    pub(crate) unresolved: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) stats: Option<StatsView<'a>>,
}

impl<'a> Report<'a> {
    pub(crate) fn new<T: Transport>(client: &'a BatchClient<T>) -> Self {
        let mut results: Vec<_> = client.completed().values().map(ResultView::from).collect();
        results.sort_by(|a, b| a.key.cmp(b.key));
        let failed = client.completed().values().filter(|c| is_failure(c)).count();

        let stats = client.stats();
        let stats = (!stats.is_empty()).then(|| StatsView {
            average_total: stats.average_total().map(format_elapsed),
            median_total: stats.median_total().map(format_elapsed),
            requests: stats.iter().map(|(k, b)| (k.as_str(), b)).collect(),
        });

        Self {
            total: results.len(),
            successful: results.len() - failed,
            failed,
            results,
            driver_errors: client.driver_errors().iter().map(ToString::to_string).collect(),
            unresolved: client.unresolved(),
            stats,
        }
    }

    /// Whether anything went wrong
    pub(crate) fn has_failures(&self) -> bool {
        self.failed > 0 || !self.unresolved.is_empty()
    }
}

/// A single completion as printed
#[derive(Debug, Serialize)]
pub(crate) struct ResultView<'a> {
    pub(crate) key: &'a str,
    pub(crate) url: &'a str,
    pub(crate) effective_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<&'a TransferError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) headers: Option<BTreeMap<&'a str, String>>,
    pub(crate) body: String,
    pub(crate) elapsed: String,
}

impl<'a> From<&'a Completion> for ResultView<'a> {
    fn from(completion: &'a Completion) -> Self {
        Self {
            key: &completion.key,
            url: completion.url.as_str(),
            effective_url: completion.effective_url.as_str(),
            status: completion.status.map(|s| s.as_u16()),
            error: completion.error.as_ref(),
            headers: completion.headers.as_ref().map(header_view),
            body: completion.text(),
            elapsed: format_elapsed(completion.timings.total),
        }
    }
}

/// Repeated headers are joined with a comma
fn header_view(headers: &HeaderMap) -> BTreeMap<&str, String> {
    let mut view: BTreeMap<&str, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        view.entry(name.as_str())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(&value);
            })
            .or_insert_with(|| value.to_string());
    }
    view
}

/// Timing breakdowns as printed
#[derive(Debug, Serialize)]
pub(crate) struct StatsView<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) average_total: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) median_total: Option<String>,
    pub(crate) requests: BTreeMap<&'a str, &'a TimingBreakdown>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderValue, StatusCode};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_micros(1_234_567)), "1s 234ms");
        assert_eq!(format_elapsed(Duration::from_micros(999)), "0s");
    }

    #[test]
    fn test_repeated_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        headers.insert("server", HeaderValue::from_static("mock"));

        let view = header_view(&headers);
        assert_eq!(view["set-cookie"], "a=1, b=2");
        assert_eq!(view["server"], "mock");
    }

    pub(crate) fn completion(status: Option<StatusCode>) -> Completion {
        let url = url::Url::parse("https://example.com/").unwrap();
        Completion {
            key: "home".to_string(),
            url: url.clone(),
            effective_url: url,
            status,
            headers: None,
            body: bytes::Bytes::from_static(b"hello"),
            error: status.is_none().then(|| {
                TransferError::new(fanout_lib::TransferErrorKind::Connect, "connection refused")
            }),
            timings: fanout_lib::Timings::default(),
            dispatched_at: tokio::time::Instant::now(),
        }
    }

    #[test]
    fn test_error_statuses_are_failures() {
        for (status, failed) in [
            (Some(StatusCode::OK), false),
            (Some(StatusCode::MOVED_PERMANENTLY), false),
            (Some(StatusCode::NOT_FOUND), true),
            (Some(StatusCode::BAD_GATEWAY), true),
            (None, true),
        ] {
            assert_eq!(is_failure(&completion(status)), failed, "{status:?}");
        }
    }

    #[test]
    fn test_result_view() {
        let created = completion(Some(StatusCode::CREATED));
        let view = ResultView::from(&created);
        assert_eq!(view.status, Some(201));
        assert_eq!(view.body, "hello");
        assert!(view.error.is_none());
        assert!(view.headers.is_none());

        let json = serde_json::to_value(ResultView::from(&completion(None))).unwrap();
        assert_eq!(json["error"]["kind"], "connect");
        assert!(json.get("status").is_none());
    }
}
