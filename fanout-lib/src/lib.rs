//! `fanout` is a library for running batches of HTTP requests concurrently.
//!
//! Requests are queued under caller chosen keys, dispatched at a bounded rate
//! over pooled connections and reported back by key, in finish order:
//! ```no_run
//! use fanout_lib::{ClientBuilder, Result};
//! use http::HeaderMap;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!   let mut client = ClientBuilder::builder()
//!       .base_url("https://jsonplaceholder.typicode.com".to_string())
//!       .rate_limit(20u32)
//!       .build()
//!       .client()?;
//!   client.get("posts/1", HeaderMap::new())?.get("posts/2", HeaderMap::new())?;
//!   if let Err(fault) = client.execute().await {
//!       eprintln!("batch aborted: {fault}");
//!   }
//!   for (key, completion) in client.succeeded() {
//!       println!("{key}: {:?}", completion.status);
//!   }
//!   Ok(())
//! }
//! ```
//!
//! Requests with custom keys, per-request options and hooks go through
//! [`BatchClient::add_requests`]:
//!
//! ```no_run
//! use fanout_lib::{ClientBuilder, RequestDescriptor, RequestOptions, Result};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!   let mut client = ClientBuilder::default().client()?;
//!   client.on_completed(|key, completion| println!("{key} done: {:?}", completion.status));
//!   client.on_error(|key, error| eprintln!("{key} failed: {error}"));
//!   client.add_requests([
//!       ("home", RequestDescriptor::try_from("https://example.com/")?),
//!       (
//!           "slow",
//!           RequestDescriptor::try_from("https://example.org/")?.with_options(RequestOptions {
//!               timeout: Some(Duration::from_secs(60)),
//!               ..RequestOptions::default()
//!           }),
//!       ),
//!   ])?;
//!   let _ = client.execute().await;
//!   client.close()
//! }
//! ```
// #![deny(missing_docs)]

#[cfg(doctest)]
doc_comment::doctest!("../../README.md");

mod client;
mod config;
mod driver;
mod hooks;
mod options;
mod pool;
mod ratelimit;
mod registry;
mod session;
mod stats;
mod transport;
mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use client::{BatchClient, ClientBuilder};
pub use config::ClientConfig;
pub use driver::DriverFault;
pub use hooks::{CompletedHook, ErrorHook, Hooks, IdleHook, PreRequestHook};
pub use options::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_CONCURRENT_STREAMS, DEFAULT_MAX_HOST_CONNECTIONS,
    DEFAULT_MAX_REDIRECTS, DEFAULT_MAX_TOTAL_CONNECTIONS, DEFAULT_SELECT_TIMEOUT,
    DEFAULT_TIMEOUT, DEFAULT_USER_AGENT, DriverSettings, RequestOptions, TransferOptions,
};
pub use pool::{Connection, ConnectionId, ConnectionPool, Destination, PoolStats};
pub use ratelimit::{DEFAULT_RATE_LIMIT, RateLimiter};
pub use registry::{InFlight, RequestRegistry, SlotId};
pub use session::{SessionBinding, SharedSession};
pub use stats::{PhaseStat, StatsCollector, TimingBreakdown, Timings};
pub use transport::{
    Exchange, PreparedRequest, ReqwestTransport, TransferError, TransferErrorKind, Transport,
};
pub use types::*;
