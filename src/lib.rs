//! Tenacious
//!
//! A long-lived streaming HTTP client which keeps its stream alive.
//!
//! A [`StreamClient`] opens one persistent request against a target, streams response
//! chunks to its subscribers, and recovers from idle sockets, abrupt closes, bad statuses
//! and server-ended streams by reconnecting with capped exponential backoff. At most one
//! connection attempt and one recovery sequence run at any time.
//!
//! ```no_run
//! # async fn run() -> Result<(), tenacious::client::Error> {
//! use tenacious::StreamClient;
//!
//! let client = StreamClient::new("http://stream.example.com/subscribe")?;
//! client.notifier().on_data(|chunk, status| {
//!     println!("{status}: {chunk:?}");
//! });
//! client.start().await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod backoff;
pub mod client;
pub use client::StreamClient;
pub mod config;
pub mod notify;
pub use notify::Notifier;
pub mod transport;

/// Boxed error type used at transport boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Boxed future type.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
