//! # esiflow - a resilient client for EVE Online's ESI API
//!
//! esiflow hides the operational side of talking to ESI: it multiplexes all
//! requests over managed HTTP/2 sessions that reconnect with backoff,
//! queues requests across connection gaps, retries transient failures
//! within a time budget, reuses prior responses through ETags, and fetches
//! paginated endpoints transparently.
//!
//! ## Quick Start
//!
//! ```no_run
//! use esiflow::{Client, RequestOptions};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct ServerStatus {
//!     players: u64,
//!     server_version: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), esiflow::Error> {
//!     let client = Client::builder()
//!         .default_header("user-agent", "my-app/1.0 you@example.com")?
//!         .build()?;
//!
//!     // A single GET.
//!     let response = client.request("/v1/status/", RequestOptions::get()).await?;
//!     let status: ServerStatus = response.json()?;
//!     println!("{} players on {}", status.players, status.server_version);
//!
//!     // A paginated GET: every page is fetched and merged automatically.
//!     let orders = client
//!         .request(
//!             "/v1/markets/{region_id}/orders/",
//!             RequestOptions::get().parameter("region_id", 10000002),
//!         )
//!         .await?;
//!     println!("{} pages merged", orders.responses.len());
//!
//!     client.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Managed HTTP/2 transport** - one session multiplexes all requests;
//!   a dropped session reconnects with backoff while requests queue FIFO
//! - **Connection pooling** - round-robin over several sessions to exceed
//!   the per-session concurrent stream limit
//! - **Retry with budget** - 502/503/504 are retried under an attempt and
//!   time budget, honoring `Retry-After` and ESI's error-limit signal
//! - **Transparent pagination** - `x-pages` GETs fan out concurrently and
//!   merge in page order, with a guard against cache-boundary page splits;
//!   bulk POSTs chunk their body array
//! - **Conditional requests** - pass a prior [`Response`] back in and a
//!   304 reuses its data without a copy
//! - **Pluggable tokens** - bearer tokens as literals or async providers
//!
//! ## Conditional requests
//!
//! ```no_run
//! use esiflow::{Client, RequestOptions};
//!
//! # async fn example() -> Result<(), esiflow::Error> {
//! # let client = Client::builder().build()?;
//! let first = client.request("/v1/status/", RequestOptions::get()).await?;
//!
//! // Carries if-none-match; on a 304 the server sends no body and `data`
//! // is the same value the first response carried.
//! let second = client
//!     .request(
//!         "/v1/status/",
//!         RequestOptions::get().previous_response(first.clone()),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod connection;
mod error;
mod paginate;
mod response;
mod tls;

pub mod backoff;
pub mod options;

pub use client::{Client, ClientBuilder};
pub use connection::{
    Connection, ConnectionPool, ConnectionSettings, Http2Options, TransportSecurity,
    DEFAULT_ESI_URL,
};
pub use error::{Error, Result};
pub use options::{RequestOptions, Token, TokenProvider};
pub use response::Response;
