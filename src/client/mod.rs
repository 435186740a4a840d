//! The streaming client.
//!
//! A [`StreamClient`] owns one logical streaming request. It moves through the states in
//! [`ConnectionState`]:
//!
//! ```text
//!            start()                200 OK
//!   Idle ─────────────▶ Connecting ─────────▶ Connected
//!    ▲                     ▲                      │
//!    │ stop()              └──── recovery ◀───────┘ timeout, abrupt close, server end
//!    └──────────── Stopping ◀── stop() from any state
//! ```
//!
//! Only one connection attempt is in flight at a time: calling [`StreamClient::start`] while an
//! attempt is pending returns the same [`StartFuture`]. Only one recovery sequence runs at a
//! time: [`StreamClient::recover`] rejects immediately while another is running or while the
//! client is stopping.
//!
//! Each attempt gets a fresh transport. Its events are processed by a task tied to the attempt's
//! generation; once an attempt is superseded or the client is stopped, events from the old
//! transport can no longer change the client's state.
//!
//! All operations must be called from within a Tokio runtime, since attempts and recovery run
//! on spawned tasks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

mod driver;
mod error;
mod future;
mod target;

pub use self::error::{Error, SharedError};
pub use self::future::{RecoverFuture, StartFuture};
pub use self::target::{Initializer, Target};

use self::target::Connector;
use crate::backoff::ReconnectCounter;
use crate::config::Config;
use crate::notify::{Notification, Notifier, RecoveryReason};
use crate::transport::Transport;

/// Lifecycle state of a [`StreamClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected, and not trying to connect.
    Idle,

    /// A connection attempt is in flight, or recovery is waiting to make one.
    Connecting,

    /// The response stream is open.
    Connected,

    /// [`StreamClient::stop`] is tearing the connection down.
    Stopping,
}

impl ConnectionState {
    /// Lowercase name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Pending {
    generation: u64,

    // Stop epoch of the recovery sequence waiting on this attempt, if any.
    recovery: Option<u64>,
    future: StartFuture,
    outcome: oneshot::Sender<Result<(), Error>>,
}

struct Attempt {
    generation: u64,
    transport: Box<dyn Transport>,
    driver: Option<AbortHandle>,
}

impl Attempt {
    fn detach(mut self) {
        self.transport.detach();
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

struct Inner {
    state: ConnectionState,

    // Bumped by every new attempt and every stop.
    generation: u64,

    // Bumped by every stop; recovery sequences only act within the epoch they began in.
    stops: u64,

    pending: Option<Pending>,
    attempt: Option<Attempt>,
    reconnect: ReconnectCounter,
    recovery: Option<AbortHandle>,
    pending_stop: bool,
}

impl Inner {
    fn new(config: &Config) -> Self {
        Self {
            state: ConnectionState::Idle,
            generation: 0,
            stops: 0,
            pending: None,
            attempt: None,
            reconnect: ReconnectCounter::new(config.backoff),
            recovery: None,
            pending_stop: false,
        }
    }

    fn is_writable(&self) -> bool {
        self.state == ConnectionState::Connected && !self.pending_stop
    }

    fn settle(&mut self, generation: u64, outcome: Result<(), Error>) {
        if self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.generation == generation)
        {
            if let Some(pending) = self.pending.take() {
                let _ = pending.outcome.send(outcome);
            }
        }
    }

    fn take_attempt(&mut self, generation: u64) -> Option<Attempt> {
        if self
            .attempt
            .as_ref()
            .is_some_and(|attempt| attempt.generation == generation)
        {
            self.attempt.take()
        } else {
            None
        }
    }
}

struct ClientRef {
    connector: Connector,
    config: Config,
    notifier: Notifier,
    inner: Mutex<Inner>,
}

/// A long-lived streaming request which reconnects on failure.
///
/// Cloning a client shares the connection.
#[derive(Clone)]
pub struct StreamClient {
    shared: Arc<ClientRef>,
}

impl fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("StreamClient")
            .field("connector", &self.shared.connector)
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("reconnect_attempts", &inner.reconnect.attempts())
            .finish()
    }
}

impl StreamClient {
    /// Create a client for `target` with the default configuration.
    ///
    /// No I/O happens until [`start`](Self::start) is called.
    pub fn new(target: impl Into<Target>) -> Result<Self, Error> {
        Self::with_config(target, Config::default())
    }

    /// Create a client for `target`.
    pub fn with_config(target: impl Into<Target>, config: Config) -> Result<Self, Error> {
        let connector = target.into().resolve()?;

        #[cfg(feature = "tls")]
        let connector = match config.tls.clone() {
            Some(tls) => connector.with_tls_config(tls),
            None => connector,
        };

        Ok(Self {
            shared: Arc::new(ClientRef {
                connector,
                inner: Mutex::new(Inner::new(&config)),
                config,
                notifier: Notifier::new(),
            }),
        })
    }

    /// Listener registration for this client's notifications.
    pub fn notifier(&self) -> &Notifier {
        &self.shared.notifier
    }

    /// Receive this client's notifications through a channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        self.shared.notifier.channel()
    }

    /// The configuration this client was created with.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Whether the response stream is open.
    pub fn started(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether [`write`](Self::write) would reach the transport.
    pub fn is_writable(&self) -> bool {
        self.shared.inner.lock().is_writable()
    }

    /// Attempts made by the running recovery sequence, or zero if none is running.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.inner.lock().reconnect.attempts()
    }

    /// Open the streaming request.
    ///
    /// The returned future resolves once a `200 OK` response arrives, and rejects when the
    /// attempt fails. While an attempt is in flight, every call returns the same future.
    pub fn start(&self) -> StartFuture {
        self.begin(None)
    }

    fn begin(&self, epoch: Option<u64>) -> StartFuture {
        let (future, generation, superseded) = {
            let mut inner = self.shared.inner.lock();

            if let Some(epoch) = epoch {
                if inner.stops != epoch || inner.pending_stop {
                    return StartFuture::ready(Err(Error::Stopped));
                }
            }

            if let Some(pending) = inner.pending.as_mut() {
                trace!(generation = pending.generation, "connection attempt already pending");
                if epoch.is_some() {
                    pending.recovery = epoch;
                }
                return pending.future.clone();
            }

            let (outcome, receiver) = oneshot::channel();
            let future = StartFuture::pending(receiver);

            inner.generation += 1;
            let generation = inner.generation;
            inner.state = ConnectionState::Connecting;
            inner.pending = Some(Pending {
                generation,
                recovery: epoch,
                future: future.clone(),
                outcome,
            });

            (future, generation, inner.attempt.take())
        };

        if let Some(attempt) = superseded {
            debug!(
                generation = attempt.generation,
                "detaching superseded transport"
            );
            attempt.detach();
        }

        debug!(generation, "connecting");
        let (mut transport, events) = match self.shared.connector.connect() {
            Ok(handle) => handle.into_parts(),
            Err(error) => {
                self.fail(generation, Error::construction(error));
                return future;
            }
        };

        {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                drop(inner);
                trace!(generation, "client stopped while connecting");
                transport.detach();
                return future;
            }

            inner.attempt = Some(Attempt {
                generation,
                transport,
                driver: None,
            });
        }

        let task = tokio::spawn(driver::drive(self.clone(), generation, events));

        let mut inner = self.shared.inner.lock();
        match inner.attempt.as_mut() {
            Some(attempt) if attempt.generation == generation => {
                attempt.driver = Some(task.abort_handle());
            }
            _ => task.abort(),
        }

        future
    }

    /// End the request and detach from its transport.
    ///
    /// Any pending start or running recovery is cancelled and rejects with [`Error::Stopped`].
    /// A later [`start`](Self::start) opens a fresh connection.
    pub async fn stop(&self, payload: Option<Bytes>) {
        let (attempt, pending, recovery) = {
            let mut inner = self.shared.inner.lock();
            inner.pending_stop = true;
            inner.state = ConnectionState::Stopping;
            inner.generation += 1;
            inner.stops += 1;
            inner.reconnect.reset();
            (
                inner.attempt.take(),
                inner.pending.take(),
                inner.recovery.take(),
            )
        };

        if let Some(recovery) = recovery {
            trace!("cancelling recovery");
            recovery.abort();
        }

        if let Some(mut attempt) = attempt {
            attempt.transport.end(payload);
            attempt.detach();
        }

        if let Some(pending) = pending {
            let _ = pending.outcome.send(Err(Error::Stopped));
        }

        let mut inner = self.shared.inner.lock();
        inner.state = ConnectionState::Idle;
        inner.pending_stop = false;
        debug!("stopped");
    }

    /// Send `payload` on the open request.
    ///
    /// Returns `false`, and drops the payload, unless the client [`is_writable`](Self::is_writable).
    pub fn write(&self, payload: impl Into<Bytes>) -> bool {
        let mut inner = self.shared.inner.lock();
        if !inner.is_writable() {
            trace!(state = %inner.state, "client is not writable, dropping payload");
            return false;
        }

        match inner.attempt.as_mut() {
            Some(attempt) => {
                attempt.transport.write(payload.into());
                true
            }
            None => false,
        }
    }

    /// Re-establish the connection, retrying with backoff until it succeeds.
    ///
    /// Rejects immediately with [`Error::RecoveryInProgress`] while another recovery sequence is
    /// running, and with [`Error::RecoveryBlockedByStop`] while the client is stopping. A
    /// sequence cancelled by [`stop`](Self::stop) resolves to [`Error::Stopped`].
    ///
    /// There is no reason to pass in: a sequence started here reports its outcome only through
    /// the returned future. Sequences started by a transport fault also emit
    /// [`Notification::Recovered`] with the fault's [`RecoveryReason`], or
    /// [`Notification::Error`] when they cannot begin.
    pub fn recover(&self) -> RecoverFuture {
        let (delay, epoch) = {
            let mut inner = self.shared.inner.lock();
            if inner.reconnect.is_active() {
                trace!(
                    attempts = inner.reconnect.attempts(),
                    "recovery already in progress"
                );
                return RecoverFuture::rejected(Error::RecoveryInProgress);
            }
            if inner.pending_stop {
                trace!("recovery blocked by pending stop");
                return RecoverFuture::rejected(Error::RecoveryBlockedByStop);
            }
            (inner.reconnect.next_delay(), inner.stops)
        };

        let task = tokio::spawn(self.clone().reconnect(epoch, delay));

        let mut inner = self.shared.inner.lock();
        if inner.stops == epoch {
            inner.recovery = Some(task.abort_handle());
        } else {
            task.abort();
        }

        RecoverFuture::running(task)
    }

    async fn reconnect(self, epoch: u64, mut delay: Duration) -> Result<(), Error> {
        loop {
            debug!(?delay, "waiting to reconnect");
            tokio::time::sleep(delay).await;

            // The counter is reset by `connected`, before the attempt's stream can fault again.
            match self.begin(Some(epoch)).await {
                Ok(()) => {
                    debug!("reconnected");
                    return Ok(());
                }
                Err(Error::Stopped) => return Err(Error::Stopped),
                Err(error) => {
                    let mut inner = self.shared.inner.lock();
                    if inner.stops != epoch || inner.pending_stop {
                        return Err(Error::Stopped);
                    }
                    warn!(
                        %error,
                        attempts = inner.reconnect.attempts(),
                        "reconnection attempt failed"
                    );
                    delay = inner.reconnect.next_delay();
                }
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.shared.inner.lock().generation == generation
    }

    /// The attempt received a `200 OK`. Returns `false` if the attempt is stale.
    fn connected(&self, generation: u64) -> bool {
        let mut inner = self.shared.inner.lock();
        if inner.generation != generation {
            return false;
        }

        let stops = inner.stops;
        let recovered = inner.pending.as_ref().is_some_and(|pending| {
            pending.generation == generation && pending.recovery == Some(stops)
        });
        if recovered {
            inner.reconnect.reset();
            inner.recovery = None;
        }

        inner.state = ConnectionState::Connected;
        inner.settle(generation, Ok(()));
        debug!(generation, recovered, "connected");
        true
    }

    /// The attempt failed before the stream opened.
    fn fail(&self, generation: u64, error: Error) {
        let attempt = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                return;
            }

            debug!(generation, %error, "connection attempt failed");
            inner.state = ConnectionState::Idle;
            inner.settle(generation, Err(error));
            inner.take_attempt(generation)
        };

        if let Some(mut attempt) = attempt {
            attempt.transport.detach();
        }
    }

    /// The attempt hit a fault which calls for recovery.
    fn fault(&self, generation: u64, reason: RecoveryReason) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                return;
            }

            debug!(generation, %reason, "connection fault");
            match reason {
                RecoveryReason::Timeout => inner.settle(generation, Err(Error::SocketTimeout)),
                RecoveryReason::ClosedWithError => {
                    inner.settle(generation, Err(Error::ConnectionClosed))
                }
                RecoveryReason::ServerEnd => {}
            }
            inner.state = ConnectionState::Connecting;
        }

        let recovery = self.recover();
        let notifier = self.shared.notifier.clone();
        tokio::spawn(async move {
            match recovery.await {
                Ok(()) => notifier.recovered(reason),
                Err(Error::Stopped) => debug!(%reason, "recovery cancelled by stop"),
                Err(error) => {
                    warn!(%error, %reason, "could not recover");
                    notifier.error(&error);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::transport::mock::{Call, MockConnector};

    use static_assertions::assert_impl_all;

    assert_impl_all!(StreamClient: Send, Sync, Clone);

    fn client() -> (StreamClient, MockConnector) {
        let connector = MockConnector::new();
        let initializer = connector.clone();
        let client = StreamClient::with_config(
            Target::initializer(move || initializer.connect()),
            Config::new().with_socket_timeout(Duration::from_millis(500)),
        )
        .unwrap();
        (client, connector)
    }

    #[test]
    fn created_idle() {
        let (client, connector) = client();
        assert_eq!(client.state(), ConnectionState::Idle);
        assert_eq!(client.reconnect_attempts(), 0);
        assert!(!client.started());
        assert!(!client.is_writable());
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn recover_rejects_while_recovering() {
        let (client, connector) = client();
        let _ = client.shared.inner.lock().reconnect.next_delay();

        let result = client.recover().await;
        assert!(matches!(result, Err(Error::RecoveryInProgress)));
        assert_eq!(client.reconnect_attempts(), 1);
        assert_eq!(client.state(), ConnectionState::Idle);
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn recover_rejects_while_stopping() {
        let (client, connector) = client();
        client.shared.inner.lock().pending_stop = true;

        let result = client.recover().await;
        assert!(matches!(result, Err(Error::RecoveryBlockedByStop)));
        assert_eq!(client.reconnect_attempts(), 0);
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn write_forwards_only_when_connected() {
        let (client, connector) = client();
        assert!(!client.write("early"));

        let started = client.start();
        let remote = connector.remote().await;
        assert!(!client.write("connecting"));

        remote.ok();
        started.await.unwrap();
        assert!(client.write("test"));

        client.shared.inner.lock().pending_stop = true;
        assert!(!client.write("stopping"));

        assert_eq!(remote.calls(), vec![Call::Write(Bytes::from_static(b"test"))]);
    }

    #[tokio::test]
    async fn stop_without_connection() {
        let (client, connector) = client();
        client.stop(Some(Bytes::from_static(b"bye"))).await;
        assert_eq!(client.state(), ConnectionState::Idle);
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn stop_ends_then_detaches() {
        let (client, connector) = client();
        let started = client.start();
        let remote = connector.remote().await;
        remote.ok();
        started.await.unwrap();
        assert!(client.started());

        client.stop(Some(Bytes::from_static(b"ending message"))).await;

        assert!(!client.started());
        assert_eq!(
            remote.calls(),
            vec![
                Call::End(Some(Bytes::from_static(b"ending message"))),
                Call::Detach
            ]
        );
    }

    #[tokio::test]
    async fn stop_rejects_pending_start() {
        let (client, connector) = client();
        let started = client.start();
        let remote = connector.remote().await;

        client.stop(None).await;
        assert!(matches!(started.await, Err(Error::Stopped)));
        assert_eq!(remote.calls(), vec![Call::End(None), Call::Detach]);

        // The detached transport can no longer move the client.
        remote.ok();
        tokio::task::yield_now().await;
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn socket_gets_configured_timeout() {
        let (client, connector) = client();
        let started = client.start();
        let remote = connector.remote().await;
        remote.socket();
        remote.ok();
        started.await.unwrap();

        assert_eq!(
            remote.calls(),
            vec![Call::SetTimeout(Duration::from_millis(500))]
        );
    }
}
