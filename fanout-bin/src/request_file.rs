//! Batches described in a TOML file given with `--input`.
//!
//! ```toml
//! [[request]]
//! key = "user"
//! url = "users/1"
//!
//! [[request]]
//! url = "https://api.example.com/users"
//! method = "POST"
//! json = { name = "ada" }
//! headers = { Authorization = "Bearer secret" }
//! options = { timeout = "5s" }
//! ```

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use fanout_lib::{BatchClient, Payload, RequestDescriptor, RequestOptions, Transport};
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;

/// Parsed request file
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RequestFile {
    #[serde(default, rename = "request")]
    pub(crate) requests: Vec<RequestEntry>,
}

/// One `[[request]]` table
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RequestEntry {
    /// Defaults to the URL
    key: Option<String>,
    url: String,
    method: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    /// Sent as is
    body: Option<String>,
    /// Sent as JSON
    json: Option<toml::Value>,
    #[serde(default)]
    options: RequestOptions,
}

impl RequestFile {
    pub(crate) fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut contents = String::new();
        reader
            .read_to_string(&mut contents)
            .context("Cannot read request file")?;
        toml::from_str(&contents).context("Cannot parse request file")
    }

    /// Turn every entry into a keyed request. Relative URLs are resolved
    /// against the base URL of `client`.
    pub(crate) fn into_requests<T: Transport>(
        self,
        client: &BatchClient<T>,
    ) -> Result<Vec<(String, RequestDescriptor)>> {
        self.requests
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                entry
                    .into_request(client)
                    .with_context(|| format!("Invalid request #{} in request file", index + 1))
            })
            .collect()
    }
}

impl TryFrom<&Path> for RequestFile {
    type Error = anyhow::Error;

    fn try_from(path: &Path) -> Result<Self, Self::Error> {
        if path == Path::new("-") {
            Self::from_reader(std::io::stdin())
        } else {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Cannot open request file: {}", path.display()))?;
            Self::from_reader(file)
        }
    }
}

impl RequestEntry {
    fn into_request<T: Transport>(
        self,
        client: &BatchClient<T>,
    ) -> Result<(String, RequestDescriptor)> {
        let url = client.url_for(&self.url)?;
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            headers.append(
                HeaderName::from_bytes(name.as_bytes())
                    .with_context(|| format!("Invalid header name `{name}`"))?,
                HeaderValue::from_str(value)
                    .with_context(|| format!("Invalid value of header `{name}`"))?,
            );
        }

        let body = match (self.body, self.json) {
            (Some(_), Some(_)) => bail!("`body` and `json` are mutually exclusive"),
            (Some(raw), None) => Some(Payload::Raw(Bytes::from(raw))),
            (None, Some(json)) => {
                if !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
                Some(Payload::Json(serde_json::to_value(json)?))
            }
            (None, None) => None,
        };

        let mut descriptor = RequestDescriptor::new(url)
            .with_headers(headers)
            .with_options(self.options);
        if let Some(method) = self.method {
            descriptor = descriptor.with_method(fanout_lib::parse_method(&method)?);
        }
        if let Some(body) = body {
            descriptor = descriptor.with_body(body);
        }
        Ok((self.key.unwrap_or(self.url), descriptor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_lib::ClientBuilder;
    use http::Method;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;
    use std::time::Duration;

    fn client() -> BatchClient {
        ClientBuilder::builder()
            .base_url("https://api.example.com/v1".to_string())
            .build()
            .client()
            .unwrap()
    }

    #[test]
    fn test_parse_and_resolve() {
        let file = RequestFile::from_reader(Cursor::new(
            r#"
            [[request]]
            url = "users/1"

            [[request]]
            key = "create"
            url = "https://other.example.com/users"
            method = "post"
            json = { name = "ada", admin = false }
            headers = { X-Trace = "abc" }
            options = { timeout = "5s" }
            "#,
        ))
        .unwrap();
        let requests = file.into_requests(&client()).unwrap();

        assert_eq!(requests.len(), 2);
        let (key, get) = &requests[0];
        assert_eq!(key, "users/1");
        assert_eq!(get.url.as_str(), "https://api.example.com/v1/users/1");
        assert_eq!(get.method, Method::GET);
        assert!(get.body.is_none());

        let (key, post) = &requests[1];
        assert_eq!(key, "create");
        assert_eq!(post.url.as_str(), "https://other.example.com/users");
        assert_eq!(post.method, Method::POST);
        assert_eq!(post.headers["x-trace"], "abc");
        assert_eq!(post.headers[CONTENT_TYPE], "application/json");
        assert_eq!(
            post.body,
            Some(Payload::Json(serde_json::json!({"name": "ada", "admin": false})))
        );
        assert_eq!(post.options.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_raw_body_keeps_headers() {
        let file = RequestFile::from_reader(Cursor::new(
            r#"
            [[request]]
            url = "upload"
            method = "PUT"
            body = "a,b,c"
            headers = { Content-Type = "text/csv" }
            "#,
        ))
        .unwrap();
        let requests = file.into_requests(&client()).unwrap();
        let (_, put) = &requests[0];

        assert_eq!(put.headers[CONTENT_TYPE], "text/csv");
        assert_eq!(put.body, Some(Payload::Raw(Bytes::from_static(b"a,b,c"))));
    }

    #[test]
    fn test_invalid_entries() {
        let both = RequestFile::from_reader(Cursor::new(
            "[[request]]\nurl = \"a\"\nbody = \"x\"\njson = { a = 1 }",
        ))
        .unwrap();
        let error = both.into_requests(&client()).unwrap_err();
        assert!(format!("{error:#}").contains("mutually exclusive"));
        assert!(error.to_string().contains("#1"));

        assert!(RequestFile::from_reader(Cursor::new("[[request]]\nuri = \"a\"")).is_err());
        assert!(RequestFile::from_reader(Cursor::new("")).unwrap().requests.is_empty());
    }
}
