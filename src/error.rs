//! Error types shared by the codec, the signer and the resolver.
//!
//! Infrastructure code (HTTP, SQLite, config parsing) reports failures as
//! `anyhow::Error` with context attached. The variants here are the domain
//! failures a caller may want to match on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShimError {
    /// The aid→bvid transform only accepts strictly positive ids.
    #[error("aid must be positive, got {0}")]
    InvalidAid(i64),

    /// The user-identity endpoint answered but one of the two image URLs had
    /// no usable filename stem.
    #[error("signing keys missing from user-identity response")]
    MissingSigningKeys,

    #[error("fetching signing keys: {0:#}")]
    KeyFetch(anyhow::Error),

    #[error("upstream returned HTTP {status} for {url}")]
    Upstream { status: u16, url: String },

    #[error("decoding upstream JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = ShimError> = std::result::Result<T, E>;
