//! Per-request option overlays and driver tuning.
//!
//! Options come in three layers: hard-coded defaults, client-wide options and
//! per-call overlays. [`RequestOptions::merge`] stacks two overlays and
//! [`RequestOptions::resolve`] fills the remaining gaps with the defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default connect phase timeout, 30 seconds.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default whole-transfer timeout, 30 seconds.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default number of redirects before a request is deemed as failed, 5.
pub const DEFAULT_MAX_REDIRECTS: usize = 5;
/// Default user agent, `fanout/<PKG_VERSION>`.
pub const DEFAULT_USER_AGENT: &str = concat!("fanout/", env!("CARGO_PKG_VERSION"));

/// Default number of requests in flight at once, 50.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 50;
/// Default number of busy connections per destination, 4.
pub const DEFAULT_MAX_HOST_CONNECTIONS: usize = 4;
/// Default number of busy connections across all destinations, 16.
pub const DEFAULT_MAX_TOTAL_CONNECTIONS: usize = 16;
/// Default bounded wait of a driver pass without completions, 1 second.
pub const DEFAULT_SELECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Overlay of per-request transfer options.
///
/// Every field is optional; unset fields fall through to the layer below.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestOptions {
    /// Timeout of the connect phase
    #[serde(default, with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,
    /// Timeout of the whole transfer, body included
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Follow `Location` headers of redirect responses
    pub follow_redirects: Option<bool>,
    /// Maximum number of redirects to follow
    pub max_redirects: Option<usize>,
    /// Send a `Referer` header when following redirects
    pub auto_referer: Option<bool>,
    /// Negotiate a compressed transfer encoding
    pub accept_encoding: Option<bool>,
    /// Keep the response body in the result
    pub buffer_body: Option<bool>,
    /// User agent to send
    pub user_agent: Option<String>,
}

impl RequestOptions {
    /// Stack `over` on top of `self`. Every field set in `over` wins.
    ///
    /// This is a pure function of its two inputs.
    #[must_use]
    pub fn merge(&self, over: &RequestOptions) -> RequestOptions {
        RequestOptions {
            connect_timeout: over.connect_timeout.or(self.connect_timeout),
            timeout: over.timeout.or(self.timeout),
            follow_redirects: over.follow_redirects.or(self.follow_redirects),
            max_redirects: over.max_redirects.or(self.max_redirects),
            auto_referer: over.auto_referer.or(self.auto_referer),
            accept_encoding: over.accept_encoding.or(self.accept_encoding),
            buffer_body: over.buffer_body.or(self.buffer_body),
            user_agent: over
                .user_agent
                .clone()
                .or_else(|| self.user_agent.clone()),
        }
    }

    /// Fill unset fields with the hard-coded defaults
    #[must_use]
    pub fn resolve(&self) -> TransferOptions {
        TransferOptions {
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            follow_redirects: self.follow_redirects.unwrap_or(true),
            max_redirects: self.max_redirects.unwrap_or(DEFAULT_MAX_REDIRECTS),
            auto_referer: self.auto_referer.unwrap_or(true),
            accept_encoding: self.accept_encoding.unwrap_or(true),
            buffer_body: self.buffer_body.unwrap_or(true),
            user_agent: self
                .user_agent
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        }
    }
}

/// Fully resolved transfer options of a single request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct TransferOptions {
    /// Timeout of the connect phase
    pub connect_timeout: Duration,
    /// Timeout of the whole transfer
    pub timeout: Duration,
    /// Follow redirects
    pub follow_redirects: bool,
    /// Redirect cap
    pub max_redirects: usize,
    /// Send `Referer` on redirects
    pub auto_referer: bool,
    /// Negotiate compression
    pub accept_encoding: bool,
    /// Keep the response body
    pub buffer_body: bool,
    /// User agent header
    pub user_agent: String,
}

impl Default for TransferOptions {
    fn default() -> Self {
        RequestOptions::default().resolve()
    }
}

/// Tuning of the multiplexed driver. A limit of `0` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DriverSettings {
    /// Requests in flight at once
    pub max_concurrent_streams: usize,
    /// Busy connections per destination
    pub max_host_connections: usize,
    /// Busy connections across all destinations. Idle connections do not
    /// count and are never evicted to make room.
    pub max_total_connections: usize,
    /// Idle connections kept in the pool, oldest evicted first; unset keeps
    /// every connection
    pub max_idle_connections: Option<usize>,
    /// Bounded wait for activity when a pass drained nothing
    #[serde(with = "humantime_serde")]
    pub select_timeout: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            max_host_connections: DEFAULT_MAX_HOST_CONNECTIONS,
            max_total_connections: DEFAULT_MAX_TOTAL_CONNECTIONS,
            max_idle_connections: None,
            select_timeout: DEFAULT_SELECT_TIMEOUT,
        }
    }
}

/// `0` means unlimited
pub(crate) const fn limit(value: usize) -> Option<usize> {
    if value == 0 { None } else { Some(value) }
}
