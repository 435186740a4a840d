//! Transports carry a single streaming request for a [`StreamClient`](crate::StreamClient).
//!
//! A transport is created fresh for every connection attempt and is represented by a
//! [`TransportHandle`]: the [`Transport`] used to write to and end the request, paired with the
//! ordered stream of [`Event`]s the transport produces while the request is in flight.
//!
//! Every attempt produces events in this shape:
//!
//! 1. Optionally, [`Event::Socket`] once the underlying connection exists.
//! 2. Exactly one of [`Event::Response`] or [`Event::Error`].
//! 3. After a response, any number of [`Event::Data`] chunks, then a single [`Event::End`].
//!
//! [`Event::SocketTimeout`] and [`Event::SocketClosed`] may arrive at any point after the socket.
//!
//! The bundled [`HttpConnector`] implements this over HTTP/1.1. Custom transports (or the
//! mock transport, with the `mocks` feature) can be supplied through
//! [`Target::initializer`](crate::client::Target::initializer).

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::sync::mpsc;

use crate::BoxError;

mod body;
mod connector;
#[cfg(any(test, feature = "mocks"))]
pub mod mock;
mod options;
#[cfg(feature = "tls")]
pub mod tls;

pub use self::connector::HttpConnector;
pub use self::options::{ConnectOptions, UriError};

/// Write half of one in-flight request.
pub trait Transport: Send + 'static {
    /// Send part of the request body.
    fn write(&mut self, payload: Bytes);

    /// Finish the request, optionally sending one last payload first.
    fn end(&mut self, payload: Option<Bytes>);

    /// Called when the client stops listening to this transport's events.
    fn detach(&mut self);
}

/// Control over the socket carrying a request.
pub trait Socket: Send + 'static {
    /// Emit [`Event::SocketTimeout`] once the socket has been idle for `timeout`.
    fn set_timeout(&mut self, timeout: Duration);

    /// Tear down the socket immediately.
    fn destroy(&mut self);
}

/// Status line and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    status: StatusCode,
    headers: HeaderMap,
}

impl ResponseHead {
    /// A response head with no headers.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    /// Attach headers to the response head.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Something that happened to an in-flight request.
pub enum Event {
    /// The socket for this request is connected.
    Socket(Box<dyn Socket>),

    /// The socket was idle for longer than its timeout.
    SocketTimeout,

    /// The socket closed.
    SocketClosed {
        /// Whether the close was caused by an error.
        had_error: bool,
    },

    /// The response head arrived.
    Response(ResponseHead),

    /// A chunk of the response body arrived.
    Data(Bytes),

    /// The response body finished.
    End,

    /// The request failed before a response arrived.
    Error(BoxError),
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Socket(_) => f.write_str("Socket"),
            Event::SocketTimeout => f.write_str("SocketTimeout"),
            Event::SocketClosed { had_error } => f
                .debug_struct("SocketClosed")
                .field("had_error", had_error)
                .finish(),
            Event::Response(head) => f.debug_tuple("Response").field(&head.status).finish(),
            Event::Data(chunk) => f.debug_tuple("Data").field(&chunk.len()).finish(),
            Event::End => f.write_str("End"),
            Event::Error(error) => f.debug_tuple("Error").field(error).finish(),
        }
    }
}

/// Sending half of a transport's event stream.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Receiving half of a transport's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Create a new event stream for a transport.
pub fn events() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// One connection attempt: a transport and the events it produces.
pub struct TransportHandle {
    transport: Box<dyn Transport>,
    events: EventReceiver,
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle").finish_non_exhaustive()
    }
}

impl TransportHandle {
    /// Pair a transport with its event stream.
    pub fn new<T>(transport: T, events: EventReceiver) -> Self
    where
        T: Transport,
    {
        Self {
            transport: Box::new(transport),
            events,
        }
    }

    /// Split the handle into the transport and its events.
    pub fn into_parts(self) -> (Box<dyn Transport>, EventReceiver) {
        (self.transport, self.events)
    }
}
