//! An in-memory transport, suitable for testing behavior of transport-dependent code.
//!
//! [`MockTransport::pair`] returns a [`TransportHandle`] for the client and a [`MockRemote`]
//! which plays the part of the network: it emits events into the handle and records every call
//! the client makes on the transport and its socket.
//!
//! [`MockConnector`] hands out a fresh mock transport for every connection attempt.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::trace;

use super::{Event, EventSender, ResponseHead, Socket, Transport, TransportHandle};
use crate::BoxError;

static IDENT: AtomicUsize = AtomicUsize::new(1);

/// An error emitted by the mock transport.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("connection error")]
pub struct MockConnectionError;

/// A call made by the client on a mock transport or its socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// [`Transport::write`]
    Write(Bytes),
    /// [`Transport::end`]
    End(Option<Bytes>),
    /// [`Transport::detach`]
    Detach,
    /// [`Socket::set_timeout`]
    SetTimeout(Duration),
    /// [`Socket::destroy`]
    Destroy,
}

type CallLog = Arc<Mutex<Vec<Call>>>;

/// Client side of a mock transport.
#[derive(Debug)]
pub struct MockTransport {
    calls: CallLog,
}

impl MockTransport {
    /// Create a transport handle and the remote end which drives it.
    pub fn pair() -> (TransportHandle, MockRemote) {
        let (events, receiver) = super::events();
        let calls = CallLog::default();
        let remote = MockRemote {
            events,
            calls: calls.clone(),
            ident: IDENT.fetch_add(1, Ordering::SeqCst),
        };
        trace!(id = remote.ident, "creating mock transport");
        (
            TransportHandle::new(MockTransport { calls }, receiver),
            remote,
        )
    }
}

impl Transport for MockTransport {
    fn write(&mut self, payload: Bytes) {
        self.calls.lock().push(Call::Write(payload));
    }

    fn end(&mut self, payload: Option<Bytes>) {
        self.calls.lock().push(Call::End(payload));
    }

    fn detach(&mut self) {
        self.calls.lock().push(Call::Detach);
    }
}

#[derive(Debug)]
struct MockSocket {
    calls: CallLog,
}

impl Socket for MockSocket {
    fn set_timeout(&mut self, timeout: Duration) {
        self.calls.lock().push(Call::SetTimeout(timeout));
    }

    fn destroy(&mut self) {
        self.calls.lock().push(Call::Destroy);
    }
}

/// The network side of a mock transport.
///
/// Events sent after the client has dropped the transport are discarded.
#[derive(Debug, Clone)]
pub struct MockRemote {
    events: EventSender,
    calls: CallLog,
    ident: usize,
}

impl MockRemote {
    /// A unique identifier for this transport.
    pub fn id(&self) -> usize {
        self.ident
    }

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            trace!(id = self.ident, "mock transport is no longer listened to");
        }
    }

    /// Emit a socket for the request.
    pub fn socket(&self) {
        self.emit(Event::Socket(Box::new(MockSocket {
            calls: self.calls.clone(),
        })));
    }

    /// Emit a socket idle timeout.
    pub fn timeout(&self) {
        self.emit(Event::SocketTimeout);
    }

    /// Emit a socket close.
    pub fn close(&self, had_error: bool) {
        self.emit(Event::SocketClosed { had_error });
    }

    /// Emit a response head.
    pub fn respond(&self, status: StatusCode) {
        self.emit(Event::Response(ResponseHead::new(status)));
    }

    /// Emit a `200 OK` response head.
    pub fn ok(&self) {
        self.respond(StatusCode::OK);
    }

    /// Emit a chunk of the response body.
    pub fn data(&self, chunk: impl Into<Bytes>) {
        self.emit(Event::Data(chunk.into()));
    }

    /// End the response body.
    pub fn end(&self) {
        self.emit(Event::End);
    }

    /// Fail the request before a response.
    pub fn error(&self) {
        self.emit(Event::Error(Box::new(MockConnectionError)));
    }

    /// Drop the event stream without a terminal event.
    pub fn hang_up(self) {
        trace!(id = self.ident, "mock transport hung up");
    }

    /// Every call the client has made on this transport and its socket, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Whether the client has detached from this transport.
    pub fn is_detached(&self) -> bool {
        self.calls.lock().contains(&Call::Detach)
    }

    /// Whether the client no longer receives events from this transport.
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

#[derive(Debug, Default)]
struct ConnectorInner {
    remotes: Mutex<VecDeque<MockRemote>>,
    attempts: AtomicUsize,
    failures: AtomicUsize,
    notify: Notify,
}

/// Creates a new mock transport for each connection attempt.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    inner: Arc<ConnectorInner>,
}

impl MockConnector {
    /// Create a connector with no attempts made yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a new connection attempt.
    ///
    /// Usable as the initializer of a [`Target`](crate::client::Target).
    pub fn connect(&self) -> Result<TransportHandle, BoxError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .inner
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            trace!("mock connector failing attempt");
            return Err(Box::new(MockConnectionError));
        }

        let (handle, remote) = MockTransport::pair();
        self.inner.remotes.lock().push_back(remote);
        self.inner.notify.notify_waiters();
        Ok(handle)
    }

    /// Make the next `count` connection attempts fail synchronously.
    pub fn fail_next(&self, count: usize) {
        self.inner.failures.fetch_add(count, Ordering::SeqCst);
    }

    /// Number of connection attempts made so far, including failed ones.
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Take the oldest unclaimed remote end, if any.
    pub fn try_remote(&self) -> Option<MockRemote> {
        self.inner.remotes.lock().pop_front()
    }

    /// Wait for the next connection attempt and return its remote end.
    pub async fn remote(&self) -> MockRemote {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(remote) = self.try_remote() {
                return remote;
            }
            notified.await;
        }
    }
}
