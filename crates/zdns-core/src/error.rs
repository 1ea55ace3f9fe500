//! Shared error kinds for the resolver, policy engine, store and feed clients.
//!
//! Mirrors spec §7's error table. Every outbound call (store, HTTP client,
//! model load) maps its failure into one of these kinds so that callers have
//! a single place to decide fallback behavior instead of matching on
//! `sqlx::Error` / `reqwest::Error` ad hoc.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ZdnsError {
    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("missing or invalid authentication")]
    AuthMissing,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("external call timed out: {0}")]
    ExternalTimeout(String),

    #[error("external response malformed: {0}")]
    ExternalMalformed(String),

    #[error("classifier model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("rule pattern invalid: {0}")]
    PatternInvalid(String),

    #[error("store error: {0}")]
    StoreError(String),
}

impl From<sqlx::Error> for ZdnsError {
    fn from(e: sqlx::Error) -> Self {
        ZdnsError::StoreError(e.to_string())
    }
}

impl From<reqwest::Error> for ZdnsError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ZdnsError::ExternalTimeout(e.to_string())
        } else {
            ZdnsError::ExternalMalformed(e.to_string())
        }
    }
}

pub type ZdnsResult<T> = Result<T, ZdnsError>;
