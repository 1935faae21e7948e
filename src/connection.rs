//! HTTP/2 connection management.
//!
//! A [`Connection`] owns one HTTP/2 session to the API host and hides its
//! lifecycle: a background task establishes the session, re-establishes it
//! with backoff whenever it drops, and drains a FIFO queue of requests that
//! arrived while the session was down. A [`ConnectionPool`] round-robins
//! several connections to exceed the per-session concurrent stream limit.

use crate::backoff::{default_reconnect_delay, DelayScheduleFactory, DelaySchedule};
use crate::error::{Error, Result};
use crate::tls;
use bytes::Bytes;
use http_body_util::Full;
use hyper::client::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use rustls_pki_types::ServerName;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Notify};
use tokio_rustls::TlsConnector;
use url::Url;

/// The default ESI endpoint.
pub const DEFAULT_ESI_URL: &str = "https://esi.evetech.net";

/// A handle for opening streams on the live HTTP/2 session.
pub(crate) type H2Session = http2::SendRequest<Full<Bytes>>;

/// Whether plaintext connections are permitted.
///
/// The default requires TLS. `AllowInsecureHttp` exists for tests against
/// local mock servers; the client then speaks HTTP/2 with prior knowledge
/// over plain TCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportSecurity {
    /// Only `https` URLs are accepted.
    #[default]
    RequireTls,
    /// `http` URLs are accepted. Traffic is NOT encrypted.
    AllowInsecureHttp,
}

/// HTTP/2 session tuning, passed through to the transport handshake.
#[derive(Debug, Clone, Default)]
pub struct Http2Options {
    /// Let the transport size flow-control windows from observed bandwidth.
    pub adaptive_window: bool,
    /// Initial stream-level flow control window, in bytes.
    pub initial_stream_window_size: Option<u32>,
    /// Initial connection-level flow control window, in bytes.
    pub initial_connection_window_size: Option<u32>,
    /// Interval for HTTP/2 PING keep-alives; `None` disables them.
    pub keep_alive_interval: Option<Duration>,
}

/// Configuration for a [`Connection`].
///
/// # Examples
///
/// ```
/// use esiflow::ConnectionSettings;
/// use std::time::Duration;
///
/// # fn example() -> esiflow::Result<()> {
/// let settings = ConnectionSettings::default()
///     .esi_url("https://esi.evetech.net")?
///     .max_pending_time(Duration::from_secs(5));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionSettings {
    pub(crate) esi_url: Url,
    pub(crate) http2: Http2Options,
    pub(crate) reconnect_delay: DelayScheduleFactory,
    pub(crate) max_pending_time: Duration,
    pub(crate) transport: TransportSecurity,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            esi_url: Url::parse(DEFAULT_ESI_URL).expect("default ESI URL is valid"),
            http2: Http2Options::default(),
            reconnect_delay: default_reconnect_delay(),
            max_pending_time: Duration::from_millis(10_000),
            transport: TransportSecurity::default(),
        }
    }
}

impl ConnectionSettings {
    /// Sets the API base URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the URL does not parse.
    pub fn esi_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.esi_url = Url::parse(url.as_ref())?;
        Ok(self)
    }

    /// Sets HTTP/2 session tuning options.
    #[must_use]
    pub fn http2_options(mut self, options: Http2Options) -> Self {
        self.http2 = options;
        self
    }

    /// Sets the reconnect backoff schedule. A fresh iterator is drawn from
    /// the factory each time the connection drops.
    #[must_use]
    pub fn reconnect_delay(mut self, factory: DelayScheduleFactory) -> Self {
        self.reconnect_delay = factory;
        self
    }

    /// Sets how long a request may wait in the queue for the session to
    /// come back before it is rejected. Default 10 s.
    #[must_use]
    pub fn max_pending_time(mut self, max_pending_time: Duration) -> Self {
        self.max_pending_time = max_pending_time;
        self
    }

    /// Permits plaintext `http` URLs.
    ///
    /// **WARNING**: only for testing against local mock servers. Traffic is
    /// not encrypted.
    #[must_use]
    pub fn allow_insecure_http(mut self) -> Self {
        tracing::warn!("allow_insecure_http() called - HTTP traffic will NOT be encrypted");
        self.transport = TransportSecurity::AllowInsecureHttp;
        self
    }
}

/// A request waiting for the session to become ready.
struct PendingRequest {
    enqueued_at: Instant,
    reply: oneshot::Sender<Result<H2Session>>,
}

/// Mutable connection state, guarded by a mutex. The lock is never held
/// across an await point.
struct ConnState {
    session: Option<H2Session>,
    queue: VecDeque<PendingRequest>,
    closed: bool,
}

/// One managed HTTP/2 session to the API host.
///
/// Constructed inside a tokio runtime; a background task connects
/// immediately and keeps reconnecting with backoff until [`close`] is
/// called. Requests issued while the session is down are queued FIFO and
/// resolved in order once it returns, except that entries older than
/// `max_pending_time` are rejected after each failed connection attempt.
///
/// [`close`]: Connection::close
pub struct Connection {
    esi_url: Url,
    state: Arc<Mutex<ConnState>>,
    shutdown: Arc<Notify>,
}

impl Connection {
    /// Creates a connection and starts its reconnect task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the URL has no host, or uses a
    /// scheme the transport security setting does not permit.
    pub fn new(settings: ConnectionSettings) -> Result<Self> {
        match settings.esi_url.scheme() {
            "https" => {}
            "http" if settings.transport == TransportSecurity::AllowInsecureHttp => {}
            scheme => {
                return Err(Error::Configuration(format!(
                    "scheme {scheme:?} is not allowed for {}",
                    settings.esi_url
                )))
            }
        }
        if settings.esi_url.host_str().is_none() {
            return Err(Error::Configuration(format!(
                "esi_url has no host: {}",
                settings.esi_url
            )));
        }

        let state = Arc::new(Mutex::new(ConnState {
            session: None,
            queue: VecDeque::new(),
            closed: false,
        }));
        let shutdown = Arc::new(Notify::new());
        let esi_url = settings.esi_url.clone();

        tokio::spawn(run_reconnect(
            Arc::new(settings),
            state.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            esi_url,
            state,
            shutdown,
        })
    }

    /// The base URL this connection dials.
    pub fn esi_url(&self) -> &Url {
        &self.esi_url
    }

    /// Returns a handle onto the live session, queueing if it is down.
    ///
    /// Requests queued here resolve in FIFO order when the session comes
    /// back. A request that outlives `max_pending_time` across failed
    /// connection attempts is rejected with [`Error::ConnectionTimeout`].
    pub(crate) async fn lease(&self) -> Result<H2Session> {
        let rx = {
            let mut state = self.state.lock().expect("connection state poisoned");
            if state.closed {
                return Err(Error::ConnectionClosed);
            }
            if let Some(session) = &state.session {
                return Ok(session.clone());
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(PendingRequest {
                enqueued_at: Instant::now(),
                reply: tx,
            });
            rx
        };

        match rx.await {
            Ok(result) => result,
            // Reconnect task dropped the sender; the connection is gone.
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Closes the connection. Idempotent.
    ///
    /// Rejects every queued request, drops the session, and stops the
    /// reconnect task. Subsequent requests fail with
    /// [`Error::ConnectionClosed`].
    pub fn close(&self) {
        let rejected: Vec<_> = {
            let mut state = self.state.lock().expect("connection state poisoned");
            state.closed = true;
            state.session = None;
            state.queue.drain(..).collect()
        };
        for pending in rejected {
            let _ = pending.reply.send(Err(Error::ConnectionClosed));
        }
        self.shutdown.notify_one();
    }
}

/// Reconnect task: one outer iteration per session lifetime.
///
/// The backoff iterator is re-instantiated for every reconnect invocation,
/// so delays start from the base again after a period of connectivity.
async fn run_reconnect(
    settings: Arc<ConnectionSettings>,
    state: Arc<Mutex<ConnState>>,
    shutdown: Arc<Notify>,
) {
    loop {
        let mut delays: DelaySchedule = (settings.reconnect_delay)();
        let mut last_delay = Duration::from_secs(30);

        let session_done = loop {
            if state.lock().expect("connection state poisoned").closed {
                return;
            }

            match establish(&settings).await {
                Ok((session, session_done)) => {
                    let drained: Vec<_> = {
                        let mut st = state.lock().expect("connection state poisoned");
                        if st.closed {
                            return;
                        }
                        st.session = Some(session.clone());
                        st.queue.drain(..).collect()
                    };
                    tracing::info!(
                        url = %settings.esi_url,
                        queued = drained.len(),
                        "established http2 session"
                    );
                    for pending in drained {
                        let _ = pending.reply.send(Ok(session.clone()));
                    }
                    break session_done;
                }
                Err(err) => {
                    tracing::warn!(
                        url = %settings.esi_url,
                        error = %err,
                        "failed to establish http2 session"
                    );
                    reject_old(&state, settings.max_pending_time);

                    let delay = delays.next().unwrap_or(last_delay);
                    last_delay = delay;
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = shutdown.notified() => return,
                    }
                }
            }
        };

        tokio::select! {
            _ = session_done => {}
            () = shutdown.notified() => return,
        }

        {
            let mut st = state.lock().expect("connection state poisoned");
            if st.closed {
                return;
            }
            st.session = None;
        }
        tracing::warn!(url = %settings.esi_url, "http2 session closed, reconnecting");
    }
}

/// Rejects the longest prefix of queue entries that have waited at least
/// `max_pending`. Survivors keep their FIFO order.
fn reject_old(state: &Mutex<ConnState>, max_pending: Duration) {
    let rejected: Vec<_> = {
        let mut st = state.lock().expect("connection state poisoned");
        let now = Instant::now();
        let keep_from = st
            .queue
            .iter()
            .position(|p| now.duration_since(p.enqueued_at) < max_pending)
            .unwrap_or(st.queue.len());
        st.queue.drain(..keep_from).collect()
    };
    for pending in rejected {
        let waited = pending.enqueued_at.elapsed();
        let _ = pending.reply.send(Err(Error::ConnectionTimeout { waited }));
    }
}

/// Dials the host and performs the HTTP/2 handshake.
///
/// Returns the send handle plus a receiver that fires when the session's
/// driver finishes. Session-level errors are logged and swallowed there;
/// they surface to callers through their individual streams.
async fn establish(
    settings: &ConnectionSettings,
) -> Result<(H2Session, oneshot::Receiver<()>)> {
    let host = settings
        .esi_url
        .host_str()
        .ok_or_else(|| Error::Configuration(format!("esi_url has no host: {}", settings.esi_url)))?
        .to_string();
    let port = settings.esi_url.port_or_known_default().unwrap_or(443);

    let tcp = TcpStream::connect((host.as_str(), port)).await?;

    if settings.esi_url.scheme() == "https" {
        let connector = TlsConnector::from(tls::client_config()?);
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| Error::Configuration(format!("invalid TLS server name: {host}")))?;
        let stream = connector.connect(server_name, tcp).await?;
        handshake(settings, TokioIo::new(stream)).await
    } else {
        handshake(settings, TokioIo::new(tcp)).await
    }
}

async fn handshake<T>(
    settings: &ConnectionSettings,
    io: T,
) -> Result<(H2Session, oneshot::Receiver<()>)>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let mut builder = http2::Builder::new(TokioExecutor::new());
    builder.timer(TokioTimer::new());
    builder.adaptive_window(settings.http2.adaptive_window);
    if let Some(size) = settings.http2.initial_stream_window_size {
        builder.initial_stream_window_size(size);
    }
    if let Some(size) = settings.http2.initial_connection_window_size {
        builder.initial_connection_window_size(size);
    }
    if let Some(interval) = settings.http2.keep_alive_interval {
        builder.keep_alive_interval(interval);
    }

    let (session, connection): (H2Session, _) = builder.handshake(io).await?;

    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::debug!(error = %err, "http2 session terminated");
        }
        let _ = done_tx.send(());
    });

    Ok((session, done_rx))
}

/// A fixed set of connections with round-robin dispatch.
///
/// Every connection is built from the same settings. Dispatch atomically
/// increments a cursor and picks `connections[cursor % len]`; there is no
/// health-aware routing.
pub struct ConnectionPool {
    connections: Vec<Connection>,
    next: AtomicUsize,
}

impl ConnectionPool {
    /// Creates `size` connections from the settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `size` is zero or the settings
    /// are invalid.
    pub fn new(settings: ConnectionSettings, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Configuration(
                "pool_size must be at least 1".to_string(),
            ));
        }
        let connections = (0..size)
            .map(|_| Connection::new(settings.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
        })
    }

    /// The base URL the pooled connections dial.
    pub fn esi_url(&self) -> &Url {
        self.connections[0].esi_url()
    }

    pub(crate) async fn lease(&self) -> Result<H2Session> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.connections[index % self.connections.len()]
            .lease()
            .await
    }

    /// Closes every connection in the pool.
    pub fn close(&self) {
        for connection in &self.connections {
            connection.close();
        }
    }
}
