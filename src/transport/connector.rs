//! HTTP/1.1 transport over TCP, with optional TLS.
//!
//! Each call to [`HttpConnector::connect`] spawns a task which owns the connection for one
//! request. The task reports progress as [`Event`]s and exits once the response finishes, the
//! socket is destroyed, or nobody is listening to its events anymore.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HOST, USER_AGENT};
use http_body_util::BodyExt as _;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, trace};

use super::body::{BodyWriter, RequestBody};
use super::{ConnectOptions, Event, EventSender, ResponseHead, Socket, Transport, TransportHandle};
use crate::BoxError;

/// How long a detached request may keep its connection to flush a finished body.
const DETACH_FLUSH: Duration = Duration::from_secs(1);

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[cfg(feature = "tls")]
type TlsConfig = Option<Arc<rustls::ClientConfig>>;

#[cfg(not(feature = "tls"))]
type TlsConfig = ();

trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Opens streaming HTTP/1.1 requests described by [`ConnectOptions`].
#[derive(Debug, Clone)]
pub struct HttpConnector {
    options: Arc<ConnectOptions>,

    #[cfg(feature = "tls")]
    tls: Arc<std::sync::OnceLock<Arc<rustls::ClientConfig>>>,
}

impl HttpConnector {
    /// Create a connector for the given options.
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            options: Arc::new(options),
            #[cfg(feature = "tls")]
            tls: Default::default(),
        }
    }

    /// Use this TLS configuration instead of the platform default for `https` targets.
    #[cfg(feature = "tls")]
    pub fn with_tls_config(self, config: Arc<rustls::ClientConfig>) -> Self {
        let tls = std::sync::OnceLock::new();
        let _ = tls.set(config);
        Self {
            options: self.options,
            tls: Arc::new(tls),
        }
    }

    /// The options each request is opened with.
    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Start a new request and return its handle.
    ///
    /// The connection is made in the background; its outcome is reported through the handle's
    /// events. This fails immediately when called outside of a Tokio runtime, when the request
    /// cannot be built from the options, or when TLS is requested but unavailable.
    pub fn connect(&self) -> Result<TransportHandle, BoxError> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let request = self.request()?;
        let tls = self.tls_config()?;

        let (writer, body) = RequestBody::channel();
        let (events, receiver) = super::events();
        let (timeout, idle) = watch::channel(None);
        let destroyed = Arc::new(Notify::new());
        let (detach, detached) = oneshot::channel();

        let socket = HttpSocket {
            timeout,
            destroyed: destroyed.clone(),
        };

        let exchange = Exchange {
            options: self.options.clone(),
            tls,
            events,
            idle,
        };

        runtime.spawn(exchange.run(request.map(|()| body), socket, destroyed, detached));

        Ok(TransportHandle::new(
            HttpRequest {
                body: writer,
                detach: Some(detach),
            },
            receiver,
        ))
    }

    fn request(&self) -> Result<http::Request<()>, BoxError> {
        let mut request = http::Request::builder()
            .method(self.options.method.clone())
            .uri(self.options.path.as_str())
            .header(HOST, self.options.authority())
            .header(USER_AGENT, DEFAULT_USER_AGENT)
            .body(())?;

        request
            .headers_mut()
            .extend(self.options.request_headers()?);
        Ok(request)
    }

    #[cfg(feature = "tls")]
    fn tls_config(&self) -> Result<TlsConfig, BoxError> {
        if !self.options.tls {
            return Ok(None);
        }

        let config = self
            .tls
            .get_or_init(|| Arc::new(super::tls::default_tls_config()));
        Ok(Some(config.clone()))
    }

    #[cfg(not(feature = "tls"))]
    fn tls_config(&self) -> Result<TlsConfig, BoxError> {
        if self.options.tls {
            return Err("https targets require the `tls` feature".into());
        }
        Ok(())
    }
}

/// The write side of a request opened by [`HttpConnector`].
///
/// Detaching, or dropping, the request closes its connection.
#[derive(Debug)]
struct HttpRequest {
    body: BodyWriter,

    // Carries whether the request body was finished and should be flushed first.
    detach: Option<oneshot::Sender<bool>>,
}

impl Transport for HttpRequest {
    fn write(&mut self, payload: Bytes) {
        if !self.body.write(payload) {
            trace!("request body is closed, dropping write");
        }
    }

    fn end(&mut self, payload: Option<Bytes>) {
        self.body.finish(payload);
    }

    fn detach(&mut self) {
        let finished = self.body.is_finished();
        trace!(finished, "request detached");
        if let Some(detach) = self.detach.take() {
            let _ = detach.send(finished);
        }
    }
}

#[derive(Debug)]
struct HttpSocket {
    timeout: watch::Sender<Option<Duration>>,
    destroyed: Arc<Notify>,
}

impl Socket for HttpSocket {
    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout.send_replace(Some(timeout));
    }

    fn destroy(&mut self) {
        self.destroyed.notify_one();
    }
}

struct Exchange {
    options: Arc<ConnectOptions>,
    #[cfg_attr(not(feature = "tls"), allow(dead_code))]
    tls: TlsConfig,
    events: EventSender,
    idle: watch::Receiver<Option<Duration>>,
}

impl Exchange {
    #[cfg_attr(
        not(tarpaulin),
        tracing::instrument(
            name = "exchange",
            skip_all,
            fields(host = %self.options.host, port = self.options.port),
            level = "debug"
        )
    )]
    async fn run(
        self,
        request: http::Request<RequestBody>,
        socket: HttpSocket,
        destroyed: Arc<Notify>,
        detached: oneshot::Receiver<bool>,
    ) {
        let exchange = self.exchange(request, socket);
        tokio::pin!(exchange);

        tokio::select! {
            _ = destroyed.notified() => debug!("socket destroyed"),
            _ = &mut exchange => trace!("exchange finished"),
            finished = detached => {
                if finished.unwrap_or(false) {
                    trace!("flushing detached request");
                    if tokio::time::timeout(DETACH_FLUSH, &mut exchange).await.is_err() {
                        trace!("closing detached request");
                    }
                } else {
                    trace!("closing detached request");
                }
            }
        }
    }

    async fn exchange(mut self, request: http::Request<RequestBody>, socket: HttpSocket) {
        let stream = match self.connect().await {
            Ok(stream) => stream,
            Err(error) => {
                debug!(%error, "connection failed");
                let _ = self.events.send(Event::Error(error));
                return;
            }
        };

        if self.events.send(Event::Socket(Box::new(socket))).is_err() {
            return;
        }

        let (sender, conn) = match http1::handshake(TokioIo::new(stream)).await {
            Ok(parts) => parts,
            Err(error) => {
                debug!(%error, "handshake failed");
                let _ = self.events.send(Event::Error(error.into()));
                return;
            }
        };

        let exchange = self.stream_response(sender, request);
        tokio::pin!(exchange);
        tokio::pin!(conn);

        tokio::select! {
            _ = &mut exchange => return,
            result = &mut conn => {
                if let Err(error) = result {
                    debug!(%error, "connection error");
                }
            }
        }

        // Pending request and body futures resolve with errors once the connection is gone.
        exchange.await;
    }

    async fn connect(&self) -> Result<Box<dyn Io>, BoxError> {
        let tcp = TcpStream::connect((self.options.host.as_str(), self.options.port)).await?;
        if let Err(error) = tcp.set_nodelay(true) {
            trace!(%error, "could not set TCP_NODELAY");
        }
        trace!(peer = ?tcp.peer_addr().ok(), "connected");

        #[cfg(feature = "tls")]
        if let Some(config) = self.tls.clone() {
            let stream = super::tls::handshake(config, &self.options.host, tcp).await?;
            return Ok(Box::new(stream));
        }

        Ok(Box::new(tcp))
    }

    async fn stream_response(
        &mut self,
        mut sender: http1::SendRequest<RequestBody>,
        request: http::Request<RequestBody>,
    ) {
        let response = match self
            .idle(async move {
                match sender.ready().await {
                    Ok(()) => sender.send_request(request).await,
                    Err(error) => Err(error),
                }
            })
            .await
        {
            Some(Ok(response)) => response,
            Some(Err(error)) => {
                debug!(%error, "request failed");
                let _ = self.events.send(Event::Error(error.into()));
                return;
            }
            None => {
                let _ = self.events.send(Event::SocketTimeout);
                return;
            }
        };

        let (parts, mut body) = response.into_parts();
        trace!(status = %parts.status, "response");
        let head = ResponseHead::new(parts.status).with_headers(parts.headers);
        if self.events.send(Event::Response(head)).is_err() {
            return;
        }

        loop {
            let event = match self.idle(body.frame()).await {
                Some(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) if !data.is_empty() => Event::Data(data),
                    _ => continue,
                },
                Some(Some(Err(error))) => {
                    debug!(%error, "response body failed");
                    Event::SocketClosed { had_error: true }
                }
                Some(None) => Event::End,
                None => Event::SocketTimeout,
            };

            let terminal = !matches!(event, Event::Data(_));
            if self.events.send(event).is_err() || terminal {
                return;
            }
        }
    }

    /// Wait for `future`, or return `None` once the socket has been idle for its timeout.
    ///
    /// The timeout restarts whenever it is changed through [`Socket::set_timeout`].
    async fn idle<F>(&mut self, future: F) -> Option<F::Output>
    where
        F: Future,
    {
        tokio::pin!(future);
        loop {
            let limit = *self.idle.borrow_and_update();
            let expired = async move {
                match limit {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                output = &mut future => return Some(output),
                () = expired => {
                    debug!(?limit, "socket idle timeout");
                    return None;
                }
                Ok(()) = self.idle.changed() => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(HttpConnector: Send, Sync, Clone);

    #[test]
    fn connect_requires_runtime() {
        let connector = HttpConnector::new(ConnectOptions::new("localhost", 1333));
        assert!(connector.connect().is_err());
    }

    #[test]
    fn request_headers() {
        let connector = HttpConnector::new(
            ConnectOptions::new("localhost", 1333)
                .with_path("/subscribe")
                .with_auth("abc123:123"),
        );
        let request = connector.request().unwrap();
        assert_eq!(request.uri(), "/subscribe");
        assert_eq!(request.headers()[HOST], "localhost:1333");
        assert_eq!(request.headers()[USER_AGENT], DEFAULT_USER_AGENT);
        assert_eq!(
            request.headers()[http::header::AUTHORIZATION],
            "Basic YWJjMTIzOjEyMw=="
        );
    }

    #[test]
    fn caller_user_agent_wins() {
        let connector = HttpConnector::new(ConnectOptions::new("localhost", 80).with_header(
            USER_AGENT,
            http::HeaderValue::from_static("agent"),
        ));
        let request = connector.request().unwrap();
        assert_eq!(request.headers()[HOST], "localhost");
        assert_eq!(request.headers().get_all(USER_AGENT).iter().count(), 1);
        assert_eq!(request.headers()[USER_AGENT], "agent");
    }

    #[cfg(not(feature = "tls"))]
    #[tokio::test]
    async fn https_requires_tls_feature() {
        let connector = HttpConnector::new(ConnectOptions::new("localhost", 443).with_tls(true));
        assert!(connector.connect().is_err());
    }

    async fn wait_for_close(stream: &mut TcpStream) {
        use tokio::io::AsyncReadExt as _;

        let mut buf = [0u8; 1024];
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    }

    #[tokio::test]
    async fn detach_closes_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = HttpConnector::new(ConnectOptions::new("127.0.0.1", port));
        let (mut transport, mut events) = connector.connect().unwrap().into_parts();
        let (mut stream, _) = listener.accept().await.unwrap();

        // The socket is dropped without a timeout ever being set.
        assert!(matches!(events.recv().await, Some(Event::Socket(_))));
        transport.detach();

        tokio::time::timeout(Duration::from_secs(5), wait_for_close(&mut stream))
            .await
            .expect("connection closed after detach");
    }

    #[tokio::test]
    async fn dropped_request_closes_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = HttpConnector::new(ConnectOptions::new("127.0.0.1", port));
        let (transport, _events) = connector.connect().unwrap().into_parts();
        let (mut stream, _) = listener.accept().await.unwrap();
        drop(transport);

        tokio::time::timeout(Duration::from_secs(5), wait_for_close(&mut stream))
            .await
            .expect("connection closed after drop");
    }

    #[tokio::test]
    async fn refused_connection_reports_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = HttpConnector::new(ConnectOptions::new("127.0.0.1", port));
        let (_, mut events) = connector.connect().unwrap().into_parts();
        assert!(matches!(events.recv().await, Some(Event::Error(_))));
    }
}
