//! Error types for ESI requests.
//!
//! Every error carries enough context to act on it: errors produced by an
//! HTTP exchange keep the offending [`Response`] (status, headers, and raw
//! body), so callers can log or inspect exactly what the server sent.

use crate::response::Response;
use http::StatusCode;
use std::time::Duration;

/// The main error type for ESI requests.
///
/// # Examples
///
/// ```no_run
/// use esiflow::{Client, Error, RequestOptions};
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::builder().build()?;
///
/// match client.request("/v1/status/", RequestOptions::get()).await {
///     Ok(response) => println!("Success: {:?}", response.data),
///     Err(Error::Http { message, response }) => {
///         eprintln!("HTTP error {}: {}", response.status, message);
///     }
///     Err(Error::RetryLimit { response }) => {
///         eprintln!("Gave up after retries, last status {}", response.status);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid configuration, such as a path template placeholder with no
    /// matching parameter or an invalid header value.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A queued request aged out before the session became ready.
    ///
    /// Raised when the connection stayed down longer than
    /// `max_pending_time` while this request waited in the queue.
    #[error("Waited too long for a connection")]
    ConnectionTimeout {
        /// How long the request sat in the queue before rejection.
        waited: Duration,
    },

    /// The connection was closed while this request was queued, or the
    /// request was issued after `close()`.
    #[error("Connection closed")]
    ConnectionClosed,

    /// An HTTP/2 protocol or stream error from the transport.
    #[error("Transport error: {0}")]
    Transport(#[from] hyper::Error),

    /// A socket-level error while connecting or during the TLS handshake.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The response body failed to decompress.
    #[error("Failed to decode {encoding} response body")]
    Decompress {
        /// The `content-encoding` value the server sent.
        encoding: String,
        /// The underlying decoder error.
        source: std::io::Error,
    },

    /// The response declared `application/json` but the body did not parse.
    ///
    /// The raw body is preserved on the carried [`Response`].
    #[error("Failed to parse JSON response (status {}): {reason}", response.status)]
    ResponseFormat {
        /// The parser's error message.
        reason: String,
        /// The response whose body failed to parse; `body` holds the raw text.
        response: Box<Response>,
    },

    /// The server returned a non-retryable, non-2xx status.
    ///
    /// The message is taken from the response's `error` field when the body
    /// is JSON, otherwise it is `Response code <status>`.
    #[error("{message}")]
    Http {
        /// Human-readable description of the failure.
        message: String,
        /// The offending response.
        response: Box<Response>,
    },

    /// Retryable failures exhausted the attempt or time budget.
    #[error("Retry limit reached")]
    RetryLimit {
        /// The last response received before giving up.
        response: Box<Response>,
    },

    /// A paginated GET observed pages from different cache generations.
    ///
    /// Detected when the `expires` header does not survive the intersection
    /// of all page headers.
    #[error("Page split detected")]
    PageSplit {
        /// The per-page responses collected before the failure.
        responses: Vec<Response>,
    },

    /// An invalid base or request URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The assembled request was rejected by the HTTP layer.
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] http::Error),

    /// The request body could not be serialized to JSON.
    #[error("Failed to serialize request body: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Returns the HTTP status of the carried response, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.response().map(|r| r.status)
    }

    /// Returns the carried [`Response`] for errors that keep one.
    ///
    /// `Http`, `RetryLimit`, and `ResponseFormat` carry the single
    /// offending response; `PageSplit` exposes its pages through
    /// [`Error::responses`] instead.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Error::Http { response, .. }
            | Error::RetryLimit { response }
            | Error::ResponseFormat { response, .. } => Some(response),
            _ => None,
        }
    }

    /// Returns the per-page responses collected before a pagination failure.
    pub fn responses(&self) -> Option<&[Response]> {
        match self {
            Error::PageSplit { responses } => Some(responses),
            _ => None,
        }
    }
}

/// A specialized `Result` type for ESI requests.
pub type Result<T> = std::result::Result<T, Error>;
