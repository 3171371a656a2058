//! `fanout` runs batches of HTTP requests concurrently.
//!
//! Requests are dispatched at a bounded rate over pooled connections which
//! share cookies and TLS sessions. Every request is reported as soon as it
//! completes, followed by a summary.
//!
//! The fanout binary is a wrapper around fanout-lib, which provides
//! convenience functions for calling fanout from the command-line.
//!
//! Request a couple of URLs:
//! ```sh
//! fanout https://example.com/ https://example.org/
//! ```
//!
//! Request paths relative to a base URL, at most five per second:
//! ```sh
//! fanout --base-url https://api.example.com/v1 --rate-limit 5 users/1 users/2 users/3
//! ```
//!
//! Post JSON and print the results as JSON:
//! ```sh
//! fanout -X POST -d '{"name": "ada"}' -f json https://api.example.com/users
//! ```
//!
//! Run a batch described in a file:
//! ```sh
//! fanout --input requests.toml --stats
//! ```
#![warn(clippy::all, clippy::pedantic)]
#![warn(
    absolute_paths_not_starting_with_crate,
    rustdoc::invalid_html_tags,
    missing_copy_implementations,
    missing_debug_implementations,
    semicolon_in_expressions_from_macros,
    unreachable_pub,
    unused_extern_crates,
    variant_size_differences,
    clippy::missing_const_for_fn
)]
#![deny(anonymous_parameters, macro_use_extern_crate)]
#![deny(missing_docs)]

use std::io::{self, Write};

use anyhow::{Context, Error, Result};
use bytes::Bytes;
use clap::Parser;
use fanout_lib::{BatchClient, ClientBuilder, ClientConfig, Payload, RequestDescriptor, Transport};
use http::HeaderMap;
use log::{debug, error, warn};
use serde_json::Value;

mod formatters;
mod options;
mod request_file;
mod verbosity;

use crate::formatters::{OutputFormat, Report, get_report_formatter, log::init_logging, plain};
use crate::options::FanoutOptions;
use crate::request_file::RequestFile;

/// A C-like enum that can be cast to `i32` and used as process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitCode {
    Success = 0,
    // NOTE: exit code 1 is used for any `Result::Err` bubbled up to `main()`
    // using the `?` operator.
    #[allow(unused)]
    UnexpectedFailure = 1,
    RequestFailure = 2,
    DriverFault = 3,
    ConfigFile = 4,
}

fn main() -> Result<()> {
    // std::process::exit doesn't guarantee that all destructors will be run,
    // therefore we wrap the main code in another function to ensure that.
    let exit_code = run_main()?;
    std::process::exit(exit_code);
}

/// Merge the configuration file and the command line into one configuration
fn load_config() -> Result<(FanoutOptions, ClientConfig)> {
    let opts = FanoutOptions::parse();

    init_logging(&opts.verbose);

    let config = opts.client_config()?;
    Ok((opts, config))
}

/// Set up runtime and call fanout entrypoint
fn run_main() -> Result<i32> {
    use std::process::exit;

    let (opts, config) = match load_config() {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Error while loading config: {e:#}");
            exit(ExitCode::ConfigFile as i32);
        }
    };

    let runtime = tokio::runtime::Runtime::new()?;
    match runtime.block_on(run(&opts, config)) {
        Err(e) if Some(io::ErrorKind::BrokenPipe) == underlying_io_error_kind(&e) => {
            exit(ExitCode::Success as i32);
        }
        res => res,
    }
}

/// Check if the given error can be traced back to an `io::ErrorKind`
/// This is helpful for troubleshooting the root cause of an error.
/// Code is taken from the anyhow documentation.
fn underlying_io_error_kind(error: &Error) -> Option<io::ErrorKind> {
    for cause in error.chain() {
        if let Some(io_error) = cause.downcast_ref::<io::Error>() {
            return Some(io_error.kind());
        }
    }
    None
}

/// Run one batch
async fn run(opts: &FanoutOptions, config: ClientConfig) -> Result<i32> {
    let mut client = ClientBuilder::from(config)
        .client()
        .context("Cannot create client")?;

    queue_urls(&mut client, opts)?;
    if let Some(input) = &opts.input {
        let requests = RequestFile::try_from(input.as_path())?.into_requests(&client)?;
        client
            .add_requests(requests)
            .context("Cannot queue requests from request file")?;
    }
    if opts.urls.is_empty() && opts.input.is_none() {
        warn!("No requests given, pass URLs as arguments or use `--input`");
    }

    if opts.format == OutputFormat::Plain {
        client.on_completed(|_, completion| print_line(&plain::completion_line(completion)));
    }
    client.on_error(|key, error| debug!("Request `{key}` failed: {error}"));

    let fault = client.execute().await.err();
    if let Some(fault) = &fault {
        error!("Batch aborted: {fault}");
    }

    let report = Report::new(&client);
    let exit_code = if fault.is_some() {
        ExitCode::DriverFault
    } else if report.has_failures() {
        ExitCode::RequestFailure
    } else {
        ExitCode::Success
    };

    let formatted = get_report_formatter(opts.format).format(&report)?;
    let mut stdout = io::stdout().lock();
    if opts.format == OutputFormat::Plain && report.total > 0 {
        writeln!(stdout)?;
    }
    writeln!(stdout, "{}", formatted.trim_end())?;
    drop(report);

    client.close().context("Cannot save cookie jar")?;
    Ok(exit_code as i32)
}

/// Queue the URLs given as arguments, keyed by themselves
fn queue_urls<T: Transport>(client: &mut BatchClient<T>, opts: &FanoutOptions) -> Result<()> {
    for url in &opts.urls {
        let body = opts.data.as_deref().map(parse_body);
        let queued = match (opts.method.as_str(), body) {
            ("GET", None) => client.get(url, HeaderMap::new()),
            ("POST", body) => client.post(url, body, HeaderMap::new()),
            ("PUT", body) => client.put(url, body, HeaderMap::new()),
            ("PATCH", body) => client.patch(url, body, HeaderMap::new()),
            ("DELETE", body) => client.delete(url, body, HeaderMap::new()),
            (_, body) => {
                let mut descriptor =
                    RequestDescriptor::new(client.url_for(url)?).with_method(opts.method.clone());
                if let Some(body) = body {
                    descriptor = descriptor.with_body(body);
                }
                client.add_request(url, descriptor)
            }
        };
        queued.with_context(|| format!("Cannot queue request for `{url}`"))?;
    }
    Ok(())
}

/// Bodies that parse as JSON are sent as JSON, anything else as is
fn parse_body(data: &str) -> Payload {
    serde_json::from_str::<Value>(data)
        .map_or_else(|_| Payload::Raw(Bytes::from(data.to_owned())), Payload::Json)
}

/// Results are streamed from a hook, which cannot fail
fn print_line(line: &str) {
    if let Err(e) = writeln!(io::stdout().lock(), "{line}") {
        debug!("Cannot write to stdout: {e}");
    }
}
