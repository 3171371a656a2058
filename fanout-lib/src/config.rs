//! Client configuration loaded from TOML.
//!
//! ```toml
//! base_url = "https://api.example.com/v1"
//! rate_limit = 25
//! collect_stats = true
//!
//! [headers]
//! Accept = "application/json"
//!
//! [options]
//! timeout = "10s"
//! max_redirects = 3
//!
//! [driver]
//! max_host_connections = 8
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::{ClientBuilder, DEFAULT_RATE_LIMIT, DriverSettings, RequestOptions, Result};

/// Everything a [`ClientBuilder`] can be configured with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClientConfig {
    /// Prefix of relative request paths
    pub base_url: Option<String>,
    /// Maximum number of dispatches per second
    pub rate_limit: u32,
    /// Share cookies and TLS sessions between connections
    pub share_session: bool,
    /// Keep response headers in the results
    pub collect_headers: bool,
    /// Record timing breakdowns
    pub collect_stats: bool,
    /// File the cookie jar is loaded from and saved to
    pub cookie_jar: Option<PathBuf>,
    /// Headers sent with every request
    #[serde(deserialize_with = "deserialize_headers")]
    #[serde(serialize_with = "serialize_headers")]
    pub headers: HeaderMap,
    /// Client-wide request options
    pub options: RequestOptions,
    /// Driver tuning
    pub driver: DriverSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            headers: HeaderMap::new(),
            rate_limit: DEFAULT_RATE_LIMIT,
            share_session: true,
            collect_headers: false,
            collect_stats: false,
            cookie_jar: None,
            options: RequestOptions::default(),
            driver: DriverSettings::default(),
        }
    }
}

impl ClientConfig {
    /// Load a configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid
    /// configuration.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| (path.to_path_buf(), e))?;
        Ok(toml::from_str(&contents)?)
    }
}

impl From<ClientConfig> for ClientBuilder {
    fn from(config: ClientConfig) -> Self {
        ClientBuilder::builder()
            .base_url(config.base_url)
            .default_headers(config.headers)
            .rate_limit(config.rate_limit)
            .share_session(config.share_session)
            .collect_headers(config.collect_headers)
            .collect_stats(config.collect_stats)
            .cookie_jar(config.cookie_jar)
            .options(config.options)
            .driver(config.driver)
            .build()
    }
}

/// Custom deserializer for headers from TOML config format
fn deserialize_headers<'de, D>(deserializer: D) -> std::result::Result<HeaderMap, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let map = HashMap::<String, String>::deserialize(deserializer)?;
    let mut header_map = HeaderMap::new();

    for (name, value) in map {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| serde::de::Error::custom(format!("Invalid header name '{name}': {e}")))?;
        let header_value = HeaderValue::from_str(&value).map_err(|e| {
            serde::de::Error::custom(format!("Invalid header value '{value}': {e}"))
        })?;
        header_map.insert(header_name, header_value);
    }

    Ok(header_map)
}

/// Custom serializer for headers to TOML config format
fn serialize_headers<S>(headers: &HeaderMap, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let map: HashMap<String, String> = headers
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or("").to_string()))
        .collect();
    map.serialize(serializer)
}
