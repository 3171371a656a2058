//! Classification of reqwest errors into [`TransferError`]s.
//!
//! Walks the error chain and matches known error types first, then message
//! patterns. The patterns track reqwest, hyper and rustls wording and need
//! maintenance as those evolve.

use std::error::Error;

use super::{TransferError, TransferErrorKind};

/// Marker wrapped around errors of our DNS resolver so they can be told
/// apart from other I/O errors in the chain.
#[derive(Debug, thiserror::Error)]
#[error("DNS lookup failed: {0}")]
pub(crate) struct ResolveError(#[from] pub(crate) std::io::Error);

/// A rule for matching error message patterns
struct ErrorRule {
    patterns: &'static [&'static str],
    kind: TransferErrorKind,
    message: &'static str,
}

impl ErrorRule {
    fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|pattern| text.contains(pattern))
    }
}

/// An ordered list of rules, first match wins
struct ErrorRules {
    rules: Vec<ErrorRule>,
}

impl ErrorRules {
    const fn new() -> Self {
        Self { rules: Vec::new() }
    }

    fn rule(
        mut self,
        patterns: &'static [&'static str],
        kind: TransferErrorKind,
        message: &'static str,
    ) -> Self {
        self.rules.push(ErrorRule {
            patterns,
            kind,
            message,
        });
        self
    }

    fn match_error(&self, error_msg: &str) -> Option<TransferError> {
        self.rules
            .iter()
            .find(|rule| rule.matches(error_msg))
            .map(|rule| TransferError::new(rule.kind, rule.message))
    }
}

/// Turn a reqwest error into a [`TransferError`] with a concise message.
pub(crate) fn classify(error: &reqwest::Error) -> TransferError {
    log::trace!("Classifying transfer error: {error:?}");

    if error.is_timeout() {
        return TransferError::new(
            TransferErrorKind::Timeout,
            "Request timed out. Try increasing the timeout or check server status",
        );
    }
    if error.is_redirect() {
        return TransferError::new(
            TransferErrorKind::TooManyRedirects,
            "Too many redirects. Check for redirect loops or raise max_redirects",
        );
    }

    if let Some(classified) = classify_source_chain(error) {
        return classified;
    }

    if error.is_connect() {
        TransferError::new(
            TransferErrorKind::Connect,
            "Connection failed. Check network connectivity and firewall settings",
        )
    } else if error.is_body() || error.is_decode() {
        TransferError::new(
            TransferErrorKind::Body,
            "Response body could not be read. Server returned invalid data",
        )
    } else if error.is_builder() || error.is_request() {
        TransferError::new(TransferErrorKind::Request, format!("Request failed: {error}"))
    } else {
        TransferError::new(TransferErrorKind::Other, format!("Request failed: {error}"))
    }
}

/// Traverse the error chain for known error types and messages
fn classify_source_chain(error: &reqwest::Error) -> Option<TransferError> {
    let mut source = error.source();
    while let Some(err) = source {
        if let Some(resolve_error) = err.downcast_ref::<ResolveError>() {
            return Some(TransferError::new(
                TransferErrorKind::Dns,
                format!("DNS resolution failed. Check hostname spelling: {}", resolve_error.0),
            ));
        }

        if let Some(io_error) = err.downcast_ref::<std::io::Error>() {
            return Some(classify_io_error(io_error));
        }

        if let Some(hyper_error) = err.downcast_ref::<hyper::Error>() {
            return Some(classify_hyper_error(hyper_error));
        }

        if let Some(classified) = classify_message(&err.to_string()) {
            return Some(classified);
        }

        source = err.source();
    }
    None
}

fn classify_io_error(io_error: &std::io::Error) -> TransferError {
    use std::io::ErrorKind as Io;
    use TransferErrorKind::{Connect, Timeout};

    match io_error.kind() {
        Io::ConnectionRefused => TransferError::new(
            Connect,
            "Connection refused. Server may be down or the port blocked",
        ),
        Io::ConnectionReset | Io::ConnectionAborted | Io::BrokenPipe => TransferError::new(
            Connect,
            "Connection reset. Server closed the connection unexpectedly",
        ),
        Io::TimedOut => TransferError::new(
            Timeout,
            "Request timed out. Try increasing the timeout or check server status",
        ),
        Io::NetworkUnreachable | Io::HostUnreachable => TransferError::new(
            Connect,
            "Network unreachable. Check internet connection or VPN settings",
        ),
        Io::UnexpectedEof => TransferError::new(
            Connect,
            "Connection closed unexpectedly. Server terminated early",
        ),
        _ => {
            let text = io_error
                .get_ref()
                .map_or_else(|| io_error.to_string(), ToString::to_string);
            classify_message(&text).unwrap_or_else(|| {
                TransferError::new(Connect, format!("Network error: {text}"))
            })
        }
    }
}

fn classify_hyper_error(hyper_error: &hyper::Error) -> TransferError {
    use TransferErrorKind::{Body, Connect, Other, Request, Timeout};

    if hyper_error.is_parse() {
        return TransferError::new(
            Body,
            "Invalid HTTP response format. Server may be misconfigured",
        );
    }
    if hyper_error.is_timeout() {
        return TransferError::new(
            Timeout,
            "Request timed out. Try increasing the timeout or check server status",
        );
    }
    if hyper_error.is_user() {
        return TransferError::new(Request, "Invalid request format. Check request parameters");
    }
    if hyper_error.is_incomplete_message() || hyper_error.is_closed() {
        return TransferError::new(Connect, "Connection closed before response completed");
    }
    if hyper_error.is_canceled() {
        return TransferError::new(Other, "Request was canceled");
    }
    classify_message(&hyper_error.to_string())
        .unwrap_or_else(|| TransferError::new(Other, format!("HTTP protocol error: {hyper_error}")))
}

/// Rule-based matching on error descriptions
fn classify_message(error_msg: &str) -> Option<TransferError> {
    use TransferErrorKind::{Connect, Dns, Timeout, Tls};

    ErrorRules::new()
        .rule(
            &["expired", "NotValidAtThisTime"],
            Tls,
            "TLS certificate expired. Site needs to renew its certificate",
        )
        .rule(
            &["NotValidForName"],
            Tls,
            "TLS certificate hostname mismatch. Check URL spelling",
        )
        .rule(
            &["UnknownIssuer", "self signed", "not trusted"],
            Tls,
            "TLS certificate not trusted",
        )
        .rule(
            &["certificate", "handshake", "TLS", "SSL"],
            Tls,
            "TLS handshake failed. Check SSL/TLS configuration",
        )
        .rule(
            &[
                "dns error",
                "failed to lookup address",
                "nodename nor servname",
                "name resolution",
            ],
            Dns,
            "DNS resolution failed. Check hostname spelling",
        )
        .rule(
            &["Connection refused", "connection refused"],
            Connect,
            "Connection refused. Server may be down or the port blocked",
        )
        .rule(
            &["Connection reset", "connection reset"],
            Connect,
            "Connection reset. Server closed the connection unexpectedly",
        )
        .rule(
            &["No route to host", "Network is unreachable"],
            Connect,
            "Network unreachable. Check internet connection or VPN settings",
        )
        .rule(
            &["timed out", "timeout"],
            Timeout,
            "Request timed out. Try increasing the timeout or check server status",
        )
        .match_error(error_msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("invalid peer certificate: UnknownIssuer", TransferErrorKind::Tls)]
    #[case("received fatal alert: HandshakeFailure during handshake", TransferErrorKind::Tls)]
    #[case("dns error: failed to lookup address information", TransferErrorKind::Dns)]
    #[case("tcp connect error: Connection refused (os error 111)", TransferErrorKind::Connect)]
    #[case("operation timed out", TransferErrorKind::Timeout)]
    fn test_classify_message(#[case] text: &str, #[case] expected: TransferErrorKind) {
        assert_eq!(classify_message(text).unwrap().kind(), expected);
    }

    #[test]
    fn test_unknown_message_is_not_classified() {
        assert!(classify_message("something odd").is_none());
    }

    #[test]
    fn test_io_error_kinds() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(classify_io_error(&refused).kind(), TransferErrorKind::Connect);

        let timed_out = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert_eq!(classify_io_error(&timed_out).kind(), TransferErrorKind::Timeout);

        let other = std::io::Error::other("weird failure");
        let classified = classify_io_error(&other);
        assert_eq!(classified.kind(), TransferErrorKind::Connect);
        assert!(classified.message().contains("weird failure"));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let error = reqwest::Client::new()
            .get(format!("http://{addr}/"))
            .send()
            .await
            .unwrap_err();
        let classified = classify(&error);
        assert_eq!(classified.kind(), TransferErrorKind::Connect);
        assert!(!classified.message().is_empty());
    }
}
