use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Gateway error taxonomy.
///
/// Only `Config` and `DomainUnavailable` are fatal, and only at startup or
/// reload time. Everything else is recovered locally: a degraded domain is
/// surfaced as a synthesized response, a rate-limit denial is a boolean the
/// caller maps to an HTTP status.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    /// Ring construction or lookup against an empty bucket set.
    #[error("no backends available")]
    NoBackends,

    /// A domain ended up with zero reachable nodes during init or reload.
    #[error("no reachable nodes for domain {0}")]
    DomainUnavailable(String),

    /// Neither the exact domain nor the wildcard default is configured.
    #[error("domain not matched")]
    DomainNotMatched,

    /// Every backend of the domain is currently down.
    #[error("no service alive")]
    NoServiceAlive,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid configuration file: {0}")]
    Json(#[from] serde_json::Error),
}
