use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use fanout_lib::{ClientConfig, RequestOptions, merge_headers};
use http::{HeaderMap, Method, header::HeaderName, header::HeaderValue};

use crate::formatters::OutputFormat;
use crate::verbosity::Verbosity;

pub(crate) const FANOUT_CONFIG_FILE: &str = "fanout.toml";

const HELP_MSG_CONFIG_FILE: &str =
    "Configuration file to use\n\n[default: fanout.toml, if it exists]";

/// Parse a single `Name: value` header given on the command line
fn parse_single_header(header: &str) -> Result<(HeaderName, HeaderValue)> {
    fanout_lib::parse_header(header).map_err(|e| {
        anyhow!("{e}. Expected colon-separated string in the format 'HeaderName: HeaderValue'")
    })
}

fn parse_method(method: &str) -> Result<Method> {
    Ok(fanout_lib::parse_method(method)?)
}

/// Run a batch of HTTP requests concurrently
#[derive(Parser, Debug)]
#[command(version, about)]
pub(crate) struct FanoutOptions {
    /// URLs to request, each keyed by itself.
    /// Relative paths are appended to the base URL.
    #[arg(value_name = "URLS")]
    pub(crate) urls: Vec<String>,

    #[arg(short, long = "config", help = HELP_MSG_CONFIG_FILE)]
    pub(crate) config_file: Option<PathBuf>,

    /// TOML file with a `[[request]]` table per request
    #[arg(short, long, value_name = "FILE")]
    pub(crate) input: Option<PathBuf>,

    /// Request method of the URLs given as arguments
    #[arg(short = 'X', long, default_value = "GET", value_parser = parse_method)]
    pub(crate) method: Method,

    /// Set a header sent with every request
    #[arg(
        short = 'H',
        long = "header",
        action = clap::ArgAction::Append,
        value_parser = parse_single_header,
        value_name = "HEADER:VALUE",
        long_help = "Set a header sent with every request

Headers are given in the format 'Name: Value', e.g. 'Accept: application/json',
just like curl does. Multiple headers are set by passing the flag multiple times.
They replace headers of the same name from the configuration file."
    )]
    pub(crate) headers: Vec<(HeaderName, HeaderValue)>,

    /// Request body of the URLs given as arguments. Sent as JSON if it parses
    /// as JSON, as is otherwise.
    #[arg(short, long, value_name = "BODY")]
    pub(crate) data: Option<String>,

    /// Prefix of relative request paths
    #[arg(long, env = "FANOUT_BASE_URL")]
    pub(crate) base_url: Option<String>,

    /// Maximum number of requests dispatched per second
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub(crate) rate_limit: Option<u32>,

    /// Timeout of each request, e.g. `10s` or `500ms`
    #[arg(long, value_parser = humantime::parse_duration)]
    pub(crate) timeout: Option<Duration>,

    /// Maximum number of redirects to follow
    #[arg(long)]
    pub(crate) max_redirects: Option<usize>,

    /// Include response headers in the output
    #[arg(long)]
    pub(crate) include_headers: bool,

    /// Print a timing breakdown of every request
    #[arg(long)]
    pub(crate) stats: bool,

    /// Do not share cookies and TLS sessions between connections
    #[arg(long)]
    pub(crate) no_share: bool,

    /// Load cookies from this JSON file and save them back after the batch
    #[arg(long, value_name = "FILE")]
    pub(crate) cookie_jar: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t)]
    pub(crate) format: OutputFormat,

    #[command(flatten)]
    pub(crate) verbose: Verbosity,
}

impl FanoutOptions {
    /// Load the configuration file, if any, and apply the command line on top
    pub(crate) fn client_config(&self) -> Result<ClientConfig> {
        let config = match &self.config_file {
            Some(path) => ClientConfig::load_from_file(path).with_context(|| {
                format!("Cannot load configuration file `{}`", path.display())
            })?,
            None => {
                // A missing default file is fine, an invalid one is not
                let default_config = PathBuf::from(FANOUT_CONFIG_FILE);
                if default_config.is_file() {
                    ClientConfig::load_from_file(&default_config).with_context(|| {
                        format!(
                            "Cannot load default configuration file `{}`",
                            default_config.display()
                        )
                    })?
                } else {
                    ClientConfig::default()
                }
            }
        };
        Ok(self.apply(config))
    }

    /// Command line arguments win over the configuration file
    fn apply(&self, mut config: ClientConfig) -> ClientConfig {
        if let Some(base_url) = &self.base_url {
            config.base_url = Some(base_url.clone());
        }
        if let Some(rate_limit) = self.rate_limit {
            config.rate_limit = rate_limit;
        }
        if self.cookie_jar.is_some() {
            config.cookie_jar.clone_from(&self.cookie_jar);
        }
        config.collect_headers |= self.include_headers;
        config.collect_stats |= self.stats;
        config.share_session &= !self.no_share;

        let headers: HeaderMap = self.headers.iter().cloned().collect();
        config.headers = merge_headers(&config.headers, &headers);
        config.options = config.options.merge(&RequestOptions {
            timeout: self.timeout,
            max_redirects: self.max_redirects,
            ..RequestOptions::default()
        });
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn verify_app() {
        use clap::CommandFactory;
        FanoutOptions::command().debug_assert();
    }

    #[test]
    fn test_parse_single_header() {
        let (name, value) = parse_single_header("accept:text/html").unwrap();
        assert_eq!(name, HeaderName::from_static("accept"));
        assert_eq!(value, "text/html");

        let (name, value) = parse_single_header("key:x-test:check=this").unwrap();
        assert_eq!(name, HeaderName::from_static("key"));
        assert_eq!(value, "x-test:check=this");

        let error = parse_single_header("secret").unwrap_err();
        assert!(error.to_string().contains("HeaderName: HeaderValue"));
        assert!(parse_single_header("My-Header💣: secret").is_err());
    }

    #[test]
    fn test_defaults() {
        let opts = FanoutOptions::parse_from(["fanout", "https://example.com/"]);
        assert_eq!(opts.method, Method::GET);
        assert_eq!(opts.format, OutputFormat::Plain);
        assert_eq!(opts.apply(ClientConfig::default()), ClientConfig::default());
    }

    #[test]
    fn test_command_line_wins_over_config() {
        let config: ClientConfig = toml::from_str(
            r#"
            rate_limit = 5
            collect_stats = true

            [headers]
            Accept = "text/html"
            X-Team = "core"

            [options]
            timeout = "60s"
            follow_redirects = false
            "#,
        )
        .unwrap();
        let opts = FanoutOptions::parse_from([
            "fanout",
            "-X",
            "post",
            "-H",
            "Accept: application/json",
            "--rate-limit",
            "50",
            "--timeout",
            "2s",
            "--no-share",
        ]);
        let config = opts.apply(config);

        assert_eq!(opts.method, Method::POST);
        assert_eq!(config.rate_limit, 50);
        assert!(config.collect_stats);
        assert!(!config.share_session);
        assert_eq!(config.headers["accept"], "application/json");
        assert_eq!(config.headers["x-team"], "core");
        assert_eq!(config.options.timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.options.follow_redirects, Some(false));
    }

    #[test]
    fn test_zero_rate_limit_is_rejected() {
        assert!(FanoutOptions::try_parse_from(["fanout", "--rate-limit", "0"]).is_err());
    }
}
