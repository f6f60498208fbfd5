//! Transport plumbing shared by the gridagent components: the persisted agent
//! configuration, the naming client that resolves head-node service locations,
//! the HTTP helper, and the generic periodic reporter engine.

pub mod config;
pub mod http;
pub mod naming;
pub mod reporter;

use url::Url;

/// Errors returned by functions and methods in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation was interrupted by cancellation.
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid URI \"{0}\": {1}")]
    InvalidUri(String, url::ParseError),
    #[error("no naming-service endpoints configured")]
    NoNamingServices,
    #[error("target {0} is missing a host or port")]
    InvalidTarget(Url),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0} from {1}")]
    HttpStatus(::http::StatusCode, Url),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(#[from] serde_yaml::Error),
}

/// Returns the given [`Url`], possibly modified to end with a slash.
///
/// Service locations are joined with service-relative paths using
/// [`Url::join`], which drops the last path component of a base URL that does
/// not end with a slash.
pub fn url_ensure_trailing_slash(mut url: Url) -> Url {
    if !url.as_str().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    url
}
