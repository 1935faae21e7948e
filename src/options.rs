//! Per-request configuration.

use crate::error::{Error, Result};
use crate::response::Response;
use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Supplies a bearer token for authenticated requests.
///
/// The exchange resolves the provider immediately before header assembly,
/// so implementations may refresh expired tokens on demand.
///
/// # Examples
///
/// ```
/// use esiflow::options::TokenProvider;
/// use async_trait::async_trait;
///
/// struct FixedToken(String);
///
/// #[async_trait]
/// impl TokenProvider for FixedToken {
///     async fn token(&self) -> esiflow::Result<String> {
///         Ok(self.0.clone())
///     }
/// }
/// ```
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Resolves the current bearer token.
    async fn token(&self) -> Result<String>;
}

/// A bearer token: either a literal string or a pluggable provider.
#[derive(Clone)]
pub enum Token {
    /// A fixed token string.
    Literal(String),
    /// A provider invoked per request.
    Provider(Arc<dyn TokenProvider>),
}

impl Token {
    pub(crate) async fn resolve(&self) -> Result<String> {
        match self {
            Token::Literal(value) => Ok(value.clone()),
            Token::Provider(provider) => provider.token().await,
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print token material.
        match self {
            Token::Literal(_) => f.write_str("Token::Literal(..)"),
            Token::Provider(_) => f.write_str("Token::Provider(..)"),
        }
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Token::Literal(value.to_string())
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Token::Literal(value)
    }
}

impl From<Arc<dyn TokenProvider>> for Token {
    fn from(provider: Arc<dyn TokenProvider>) -> Self {
        Token::Provider(provider)
    }
}

/// Configuration for an individual request.
///
/// Defaults to a plain GET with no headers, parameters, or body.
///
/// # Examples
///
/// ```
/// use esiflow::RequestOptions;
///
/// # fn example() -> esiflow::Result<()> {
/// let options = RequestOptions::get()
///     .parameter("character_id", 2114794365u64)
///     .query("datasource", "tranquility")
///     .token("aaabbb...");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// The HTTP method.
    pub method: Method,

    /// Extra headers for this request, overlaid on the client defaults.
    pub headers: HeaderMap,

    /// Values substituted into `{name}` placeholders in the path template.
    pub parameters: HashMap<String, String>,

    /// Query parameters, merged over the client's default query.
    pub query: HashMap<String, String>,

    /// JSON request body.
    pub body: Option<Value>,

    /// Chunk size for POST pagination. When set with a POST method and an
    /// array body, the body is split into slices of this length and the
    /// slices are submitted concurrently.
    pub body_page_size: Option<NonZeroUsize>,

    /// Bearer token for this request.
    pub token: Option<Token>,

    /// A prior response to the same request, enabling a conditional
    /// request via its `etag`.
    pub previous_response: Option<Response>,
}

impl RequestOptions {
    /// Creates options for the given method.
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    /// Creates GET options.
    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    /// Creates POST options.
    pub fn post() -> Self {
        Self::new(Method::POST)
    }

    /// Creates PUT options.
    pub fn put() -> Self {
        Self::new(Method::PUT)
    }

    /// Creates DELETE options.
    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    /// Adds a header to the request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the header name or value is
    /// invalid.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::Configuration(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::Configuration(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Sets a path parameter, filling the `{name}` placeholder in the path
    /// template with the value's string form.
    pub fn parameter(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.parameters.insert(name.into(), value.to_string());
        self
    }

    /// Adds a query parameter. Overrides the client's default query on
    /// conflict.
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.insert(key.into(), value.to_string());
        self
    }

    /// Sets the JSON request body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the value cannot be serialized.
    pub fn body(mut self, body: &impl Serialize) -> Result<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    /// Enables POST pagination with the given chunk size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `size` is zero.
    pub fn body_page_size(mut self, size: usize) -> Result<Self> {
        let size = NonZeroUsize::new(size)
            .ok_or_else(|| Error::Configuration("body_page_size must be positive".to_string()))?;
        self.body_page_size = Some(size);
        Ok(self)
    }

    /// Sets the bearer token.
    pub fn token(mut self, token: impl Into<Token>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Attaches a prior response so the exchange can issue a conditional
    /// request with its `etag`. On a 304 the prior `data` is reused.
    pub fn previous_response(mut self, response: Response) -> Self {
        self.previous_response = Some(response);
        self
    }
}
