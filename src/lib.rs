#![forbid(unsafe_code)]

//! Compatibility shim that answers deprecated playurl requests.
//!
//! Legacy clients only know a stream id (`cid`) and a quality. The
//! [`resolver::Resolver`] maps the cid to its video, signs a request against
//! the current playurl API and reshapes the answer into the body old parsers
//! expect. The surrounding modules are its building blocks and can be used on
//! their own.

pub mod codec;
pub mod companion;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod identity;
pub mod legacy;
pub mod media;
pub mod query;
pub mod resolver;
pub mod session;
pub mod signer;
pub mod store;

pub use error::{Result, ShimError};
pub use resolver::{Resolver, is_legacy_playurl_url};
