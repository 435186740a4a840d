//! Consumer-facing notifications.
//!
//! A [`Notifier`] holds ordered listener lists for each kind of notification a
//! [`StreamClient`](crate::StreamClient) emits. Listeners run synchronously, in the order
//! they were registered, on whichever task observed the underlying transport event.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::client::Error;

/// Why a connection was re-established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryReason {
    /// The server ended the response stream.
    ServerEnd,

    /// The socket was idle for longer than the socket timeout.
    Timeout,

    /// The socket closed with an error.
    ClosedWithError,
}

impl RecoveryReason {
    /// The reason as reported to listeners.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryReason::ServerEnd => "server end",
            RecoveryReason::Timeout => "timeout",
            RecoveryReason::ClosedWithError => "connection closed with error",
        }
    }
}

impl fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single notification, as delivered by [`Notifier::channel`].
#[derive(Debug, Clone)]
pub enum Notification {
    /// A chunk of the response body.
    Data {
        /// The chunk.
        chunk: Bytes,
        /// Status of the response the chunk belongs to.
        status: StatusCode,
    },

    /// The server ended the response.
    End {
        /// Status of the response which ended.
        status: StatusCode,
    },

    /// Recovery after a fault did not succeed.
    Error(Error),

    /// The connection was re-established.
    Recovered(RecoveryReason),
}

type DataListener = Arc<dyn Fn(&Bytes, StatusCode) + Send + Sync>;
type EndListener = Arc<dyn Fn(StatusCode) + Send + Sync>;
type ErrorListener = Arc<dyn Fn(&Error) + Send + Sync>;
type RecoveredListener = Arc<dyn Fn(RecoveryReason) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    data: Vec<DataListener>,
    end: Vec<EndListener>,
    error: Vec<ErrorListener>,
    recovered: Vec<RecoveredListener>,
}

/// Multi-subscriber notification points for a streaming client.
///
/// Cloning a notifier shares the listener lists.
#[derive(Clone, Default)]
pub struct Notifier {
    listeners: Arc<RwLock<Listeners>>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read();
        f.debug_struct("Notifier")
            .field("data", &listeners.data.len())
            .field("end", &listeners.end.len())
            .field("error", &listeners.error.len())
            .field("recovered", &listeners.recovered.len())
            .finish()
    }
}

impl Notifier {
    /// Create a notifier with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with every chunk of a successful response and its status.
    pub fn on_data<F>(&self, listener: F)
    where
        F: Fn(&Bytes, StatusCode) + Send + Sync + 'static,
    {
        self.listeners.write().data.push(Arc::new(listener));
    }

    /// Called when the server ends a successful response.
    pub fn on_end<F>(&self, listener: F)
    where
        F: Fn(StatusCode) + Send + Sync + 'static,
    {
        self.listeners.write().end.push(Arc::new(listener));
    }

    /// Called when recovery after a server-ended stream fails.
    pub fn on_error<F>(&self, listener: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.listeners.write().error.push(Arc::new(listener));
    }

    /// Called each time the connection is re-established after a fault.
    pub fn on_recovered<F>(&self, listener: F)
    where
        F: Fn(RecoveryReason) + Send + Sync + 'static,
    {
        self.listeners.write().recovered.push(Arc::new(listener));
    }

    /// Forward every notification into a channel, in emission order.
    ///
    /// Notifications are dropped once the receiver is closed.
    pub fn channel(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();

        let sender = tx.clone();
        self.on_data(move |chunk, status| {
            let _ = sender.send(Notification::Data {
                chunk: chunk.clone(),
                status,
            });
        });

        let sender = tx.clone();
        self.on_end(move |status| {
            let _ = sender.send(Notification::End { status });
        });

        let sender = tx.clone();
        self.on_error(move |error| {
            let _ = sender.send(Notification::Error(error.clone()));
        });

        self.on_recovered(move |reason| {
            let _ = tx.send(Notification::Recovered(reason));
        });

        rx
    }

    // Listener lists are cloned out of the lock so listeners may register more listeners.

    pub(crate) fn data(&self, chunk: &Bytes, status: StatusCode) {
        let listeners = self.listeners.read().data.clone();
        for listener in listeners {
            listener(chunk, status);
        }
    }

    pub(crate) fn end(&self, status: StatusCode) {
        let listeners = self.listeners.read().end.clone();
        for listener in listeners {
            listener(status);
        }
    }

    pub(crate) fn error(&self, error: &Error) {
        let listeners = self.listeners.read().error.clone();
        if listeners.is_empty() {
            tracing::warn!(%error, "recovery failed with no error listener");
        }
        for listener in listeners {
            listener(error);
        }
    }

    pub(crate) fn recovered(&self, reason: RecoveryReason) {
        let listeners = self.listeners.read().recovered.clone();
        for listener in listeners {
            listener(reason);
        }
    }
}
