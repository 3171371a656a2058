#![allow(unreachable_pub)]

mod completion;
mod cookies;
mod error;
mod request;

pub use completion::{BatchResults, Completion};
pub use cookies::CookieJar;
pub use error::ErrorKind;
pub use request::{Payload, RequestDescriptor, merge_headers, parse_header, parse_method};

/// The fanout `Result` type
pub type Result<T> = std::result::Result<T, crate::ErrorKind>;
