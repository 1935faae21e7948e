//! The ESI client: request facade, single exchange, and retry loop.
//!
//! [`Client`] is the main entry point. Use [`ClientBuilder`] to configure
//! and create clients; a client is cheap to clone and safe to share across
//! tasks.

use crate::backoff::{
    default_page_split_delay, default_retry_delay_high, default_retry_delay_low, DelaySchedule,
    DelayScheduleFactory, PageSplitDelay,
};
use crate::connection::{Connection, ConnectionPool, ConnectionSettings, H2Session};
use crate::error::{Error, Result};
use crate::options::RequestOptions;
use crate::paginate;
use crate::response::Response;
use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, DATE,
    ETAG, IF_NONE_MATCH, RETRY_AFTER,
};
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::{Position, Url};

/// Response headers removed before presentation.
const DEFAULT_STRIP_HEADERS: [&str; 7] = [
    "access-control-allow-credentials",
    "access-control-allow-headers",
    "access-control-allow-methods",
    "access-control-allow-origin",
    "access-control-expose-headers",
    "access-control-max-age",
    "strict-transport-security",
];

/// Marks a response whose endpoint has exhausted its error budget; such
/// failures back off on the slower schedule.
const ERROR_LIMIT_RESET: &str = "x-esi-error-limit-reset";

/// A client for EVE Online's ESI API.
///
/// The client multiplexes all requests over one or more managed HTTP/2
/// sessions, retries transient failures within a time budget, reuses prior
/// responses via ETags, and transparently fetches and merges paginated
/// results.
///
/// # Examples
///
/// ```no_run
/// use esiflow::{Client, RequestOptions};
///
/// #[tokio::main]
/// async fn main() -> Result<(), esiflow::Error> {
///     let client = Client::builder().build()?;
///
///     let status = client.request("/v1/status/", RequestOptions::get()).await?;
///     println!("{:?}", status.data);
///
///     let orders = client
///         .request(
///             "/v1/markets/{region_id}/orders/",
///             RequestOptions::get().parameter("region_id", 10000002),
///         )
///         .await?;
///     println!("{} orders", orders.responses.len());
///
///     client.close();
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    connector: Connector,
    esi_url: Url,
    default_headers: HeaderMap,
    default_query: HashMap<String, String>,
    max_time: Duration,
    max_retries: usize,
    retry_delay_low: DelayScheduleFactory,
    retry_delay_high: DelayScheduleFactory,
    pub(crate) page_split_delay: PageSplitDelay,
    strip_headers: Vec<HeaderName>,
}

enum Connector {
    Single(Connection),
    Pool(ConnectionPool),
}

impl Connector {
    async fn lease(&self) -> Result<H2Session> {
        match self {
            Connector::Single(connection) => connection.lease().await,
            Connector::Pool(pool) => pool.lease().await,
        }
    }

    fn close(&self) {
        match self {
            Connector::Single(connection) => connection.close(),
            Connector::Pool(pool) => pool.close(),
        }
    }

    fn esi_url(&self) -> &Url {
        match self {
            Connector::Single(connection) => connection.esi_url(),
            Connector::Pool(pool) => pool.esi_url(),
        }
    }
}

impl Client {
    /// Creates a new [`ClientBuilder`].
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Makes a request, dispatching on the method and options.
    ///
    /// GETs go through the paginator and come back merged when the endpoint
    /// reports multiple pages. POSTs with a `body_page_size` and an array
    /// body are chunked and submitted concurrently. Everything else is a
    /// single exchange under the retry policy.
    ///
    /// # Errors
    ///
    /// See [`Error`] for the full set; transient upstream failures
    /// (502/503/504) are retried internally until the attempt or time
    /// budget runs out.
    pub async fn request(&self, path: &str, options: RequestOptions) -> Result<Response> {
        match options.method {
            Method::GET => paginate::paginate_get(self, path, options).await,
            Method::POST
                if options.body_page_size.is_some()
                    && matches!(options.body, Some(Value::Array(_))) =>
            {
                paginate::paginate_post(self, path, options).await
            }
            _ => self.retry_request(path, &options).await,
        }
    }

    /// Releases the underlying connections.
    ///
    /// Idempotent; requests issued afterwards fail with
    /// [`Error::ConnectionClosed`].
    pub fn close(&self) {
        self.inner.connector.close();
    }

    /// Repeats the single exchange under the retry budget.
    ///
    /// Each call gets `max_retries + 1` attempts within `max_time`, with
    /// fresh delay schedules. 502/503/504 are retried; the delay honors
    /// `Retry-After` when present, otherwise it comes from the high
    /// schedule when the endpoint's error budget is exhausted and from the
    /// low schedule for ordinary hiccups.
    pub(crate) async fn retry_request(
        &self,
        path: &str,
        options: &RequestOptions,
    ) -> Result<Response> {
        let inner = &self.inner;
        let deadline = Instant::now() + inner.max_time;
        let attempts = inner.max_retries + 1;
        let mut low: DelaySchedule = (inner.retry_delay_low)();
        let mut high: DelaySchedule = (inner.retry_delay_high)();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = self.make_request(path, options).await?;

            if response.status.is_success() {
                return Ok(response);
            }

            match response.status.as_u16() {
                502 | 503 | 504 => {
                    tracing::warn!(
                        status = response.status.as_u16(),
                        attempt,
                        path,
                        "transient upstream failure"
                    );

                    if attempt < attempts {
                        let delay = if let Some(delay) = retry_after_delay(&response.headers) {
                            Some(delay)
                        } else if response.headers.contains_key(ERROR_LIMIT_RESET) {
                            high.next()
                        } else {
                            low.next()
                        };

                        if let Some(delay) = delay {
                            if Instant::now() + delay <= deadline {
                                tracing::info!(
                                    delay_ms = delay.as_millis() as u64,
                                    attempt,
                                    path,
                                    "retrying after delay"
                                );
                                tokio::time::sleep(delay).await;
                                continue;
                            }
                        }
                    }

                    return Err(Error::RetryLimit {
                        response: Box::new(response),
                    });
                }
                status => {
                    let message = response
                        .data
                        .as_deref()
                        .and_then(|data| data.get("error"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("Response code {status}"));
                    return Err(Error::Http {
                        message,
                        response: Box::new(response),
                    });
                }
            }
        }
    }

    /// Performs one HTTP exchange: build the request, open a stream on a
    /// leased session, read and decompress the body, decode the response.
    pub(crate) async fn make_request(
        &self,
        path: &str,
        options: &RequestOptions,
    ) -> Result<Response> {
        let inner = &self.inner;
        let path_and_query = build_path(
            path,
            &options.parameters,
            &inner.default_query,
            &options.query,
        )?;

        let mut headers = inner.default_headers.clone();
        for (name, value) in &options.headers {
            headers.insert(name.clone(), value.clone());
        }
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));

        if let Some(token) = &options.token {
            let token = token.resolve().await?;
            let value = HeaderValue::try_from(format!("Bearer {token}")).map_err(|_| {
                Error::Configuration("bearer token is not a valid header value".to_string())
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        if let Some(previous) = &options.previous_response {
            if let Some(etag) = previous.headers.get(ETAG) {
                headers.insert(IF_NONE_MATCH, etag.clone());
            }
        }

        let body = match &options.body {
            Some(value) => {
                headers
                    .entry(CONTENT_TYPE)
                    .or_insert(HeaderValue::from_static("application/json"));
                Bytes::from(serde_json::to_vec(value)?)
            }
            None => Bytes::new(),
        };

        let uri: Uri = format!("{}{}", &inner.esi_url[..Position::BeforePath], path_and_query)
            .parse()
            .map_err(http::Error::from)?;

        let mut request = http::Request::builder()
            .method(options.method.clone())
            .uri(uri)
            .body(Full::new(body))?;
        *request.headers_mut() = headers;

        tracing::debug!(method = %options.method, path = %path_and_query, "executing request");

        let mut session = inner.connector.lease().await?;
        session.ready().await?;
        let response = session.send_request(request).await?;

        let (parts, incoming) = response.into_parts();
        let raw = incoming.collect().await?.to_bytes();

        let mut headers = parts.headers;
        for name in &inner.strip_headers {
            headers.remove(name);
        }

        let body = decompress(&headers, raw)?;

        tracing::debug!(
            status = parts.status.as_u16(),
            bytes = body.len(),
            path = %path_and_query,
            "received response"
        );

        decode_response(
            parts.status,
            headers,
            body,
            options.previous_response.as_ref(),
        )
    }
}

/// Fills `{name}` placeholders from `parameters` and appends the merged
/// query string. Fails before any I/O if a placeholder has no value.
fn build_path(
    template: &str,
    parameters: &HashMap<String, String>,
    default_query: &HashMap<String, String>,
    query: &HashMap<String, String>,
) -> Result<String> {
    let mut path = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        path.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            Error::Configuration(format!("unterminated placeholder in path template {template:?}"))
        })?;
        let name = &after[..end];
        let value = parameters.get(name).ok_or_else(|| {
            Error::Configuration(format!("no value for path parameter {name:?}"))
        })?;
        path.push_str(value);
        rest = &after[end + 1..];
    }
    path.push_str(rest);

    // Request query wins over the client default on conflict.
    let mut merged: BTreeMap<&str, &str> = BTreeMap::new();
    for (key, value) in default_query {
        merged.insert(key, value);
    }
    for (key, value) in query {
        merged.insert(key, value);
    }
    if !merged.is_empty() {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in merged {
            serializer.append_pair(key, value);
        }
        path.push('?');
        path.push_str(&serializer.finish());
    }

    Ok(path)
}

/// Parses `Retry-After` into a delay.
///
/// Integer values are seconds. HTTP-date values are taken relative to the
/// response's own `date` header plus one second, so a skewed local clock
/// does not distort the wait.
fn retry_after_delay(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let target = httpdate::parse_http_date(value).ok()?;
    let date = headers
        .get(DATE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())?;
    Some(target.duration_since(date).unwrap_or_default() + Duration::from_secs(1))
}

/// Inflates the body according to `content-encoding`. Unknown or absent
/// encodings pass through untouched.
fn decompress(headers: &HeaderMap, raw: Bytes) -> Result<Vec<u8>> {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    let mut decoded = Vec::new();
    let result = match encoding.as_str() {
        "gzip" => flate2::read::GzDecoder::new(raw.as_ref()).read_to_end(&mut decoded),
        "deflate" => flate2::read::ZlibDecoder::new(raw.as_ref()).read_to_end(&mut decoded),
        "br" => brotli::Decompressor::new(raw.as_ref(), 4096).read_to_end(&mut decoded),
        _ => return Ok(raw.to_vec()),
    };

    match result {
        Ok(_) => Ok(decoded),
        Err(source) => Err(Error::Decompress { encoding, source }),
    }
}

/// Materializes a [`Response`] from the decoded exchange.
///
/// JSON bodies populate `data`; non-JSON bodies populate `body`; a JSON
/// body that fails to parse is an error carrying the raw text. An empty
/// 304 inherits `status` and `data` from the previous response.
fn decode_response(
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    previous: Option<&Response>,
) -> Result<Response> {
    let empty = Response {
        status,
        headers: HeaderMap::new(),
        data: None,
        body: None,
        responses: Vec::new(),
    };

    if !body.is_empty() {
        let is_json = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("application/json"));
        let text = String::from_utf8_lossy(&body).into_owned();

        if is_json {
            match serde_json::from_slice::<Value>(&body) {
                Ok(data) => Ok(Response {
                    headers,
                    data: Some(Arc::new(data)),
                    ..empty
                }),
                Err(e) => Err(Error::ResponseFormat {
                    reason: e.to_string(),
                    response: Box::new(Response {
                        headers,
                        body: Some(text),
                        ..empty
                    }),
                }),
            }
        } else {
            Ok(Response {
                headers,
                body: Some(text),
                ..empty
            })
        }
    } else if status == StatusCode::NOT_MODIFIED {
        match previous {
            Some(previous) => Ok(Response {
                status: previous.status,
                headers,
                data: previous.data.clone(),
                ..empty
            }),
            // A 304 without a prior response to inherit from; surface it.
            None => Ok(Response { headers, ..empty }),
        }
    } else {
        Ok(Response { headers, ..empty })
    }
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use esiflow::{Client, ConnectionSettings};
/// use std::time::Duration;
///
/// # fn example() -> esiflow::Result<()> {
/// let client = Client::builder()
///     .connection_settings(ConnectionSettings::default())
///     .pool_size(2)
///     .max_time(Duration::from_secs(30))
///     .max_retries(5)
///     .default_header("user-agent", "my-app/1.0 you@example.com")?
///     .default_query("datasource", "tranquility")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    connection: Option<Connection>,
    connection_settings: ConnectionSettings,
    pool_size: usize,
    default_headers: HeaderMap,
    default_query: HashMap<String, String>,
    max_time: Duration,
    max_retries: usize,
    retry_delay_low: DelayScheduleFactory,
    retry_delay_high: DelayScheduleFactory,
    page_split_delay: PageSplitDelay,
    strip_headers: Vec<HeaderName>,
}

impl ClientBuilder {
    /// Creates a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            connection: None,
            connection_settings: ConnectionSettings::default(),
            pool_size: 1,
            default_headers: HeaderMap::new(),
            default_query: HashMap::new(),
            max_time: Duration::from_millis(10_000),
            max_retries: 3,
            retry_delay_low: default_retry_delay_low(),
            retry_delay_high: default_retry_delay_high(),
            page_split_delay: default_page_split_delay(),
            strip_headers: DEFAULT_STRIP_HEADERS
                .into_iter()
                .map(HeaderName::from_static)
                .collect(),
        }
    }

    /// Uses a preconstructed connection instead of building one from
    /// settings. Takes precedence over [`connection_settings`] and
    /// [`pool_size`].
    ///
    /// [`connection_settings`]: ClientBuilder::connection_settings
    /// [`pool_size`]: ClientBuilder::pool_size
    #[must_use]
    pub fn connection(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Sets the settings used to construct the client's connections.
    #[must_use]
    pub fn connection_settings(mut self, settings: ConnectionSettings) -> Self {
        self.connection_settings = settings;
        self
    }

    /// Sets the number of connections to round-robin over. Default 1.
    ///
    /// Raise this to exceed the server's per-session concurrent stream
    /// limit.
    #[must_use]
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Adds a header sent with every request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the name or value is invalid.
    pub fn default_header(
        mut self,
        name: impl AsRef<str>,
        value: impl AsRef<str>,
    ) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::Configuration(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::Configuration(format!("Invalid header value: {}", e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Adds a query parameter sent with every request. Per-request query
    /// parameters override it on conflict.
    #[must_use]
    pub fn default_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.default_query.insert(key.into(), value.to_string());
        self
    }

    /// Sets the total time budget for one logical request across all retry
    /// attempts and delays. Default 10 s.
    #[must_use]
    pub fn max_time(mut self, max_time: Duration) -> Self {
        self.max_time = max_time;
        self
    }

    /// Sets how many times a transient failure is retried. Default 3, so a
    /// request gets at most four attempts; zero permits exactly one.
    #[must_use]
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the delay schedule for generic transient failures.
    #[must_use]
    pub fn retry_delay_low(mut self, factory: DelayScheduleFactory) -> Self {
        self.retry_delay_low = factory;
        self
    }

    /// Sets the delay schedule used when the endpoint's error budget is
    /// exhausted (`x-esi-error-limit-reset` present).
    #[must_use]
    pub fn retry_delay_high(mut self, factory: DelayScheduleFactory) -> Self {
        self.retry_delay_high = factory;
        self
    }

    /// Sets the page-count-to-budget function for the anti-page-split
    /// delay. Default `pages × 75 ms + 2500 ms`.
    #[must_use]
    pub fn page_split_delay(mut self, delay: PageSplitDelay) -> Self {
        self.page_split_delay = delay;
        self
    }

    /// Replaces the list of response headers removed before presentation.
    /// Names are matched case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a name is not a valid header
    /// name.
    pub fn strip_headers<I, S>(mut self, names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.strip_headers = names
            .into_iter()
            .map(|name| {
                HeaderName::try_from(name.as_ref())
                    .map_err(|e| Error::Configuration(format!("Invalid header name: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self)
    }

    /// Builds the configured [`Client`].
    ///
    /// Must be called within a tokio runtime; connections start dialing
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an invalid pool size or
    /// connection settings.
    pub fn build(self) -> Result<Client> {
        let connector = match self.connection {
            Some(connection) => Connector::Single(connection),
            None if self.pool_size == 1 => {
                Connector::Single(Connection::new(self.connection_settings)?)
            }
            None => Connector::Pool(ConnectionPool::new(
                self.connection_settings,
                self.pool_size,
            )?),
        };
        let esi_url = connector.esi_url().clone();

        Ok(Client {
            inner: Arc::new(ClientInner {
                connector,
                esi_url,
                default_headers: self.default_headers,
                default_query: self.default_query,
                max_time: self.max_time,
                max_retries: self.max_retries,
                retry_delay_low: self.retry_delay_low,
                retry_delay_high: self.retry_delay_high,
                page_split_delay: self.page_split_delay,
                strip_headers: self.strip_headers,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
