use std::fmt;
use std::sync::Arc;

use http::Uri;

use super::Error;
use crate::transport::{ConnectOptions, HttpConnector, TransportHandle};
use crate::BoxError;

/// A function which opens a new transport for each connection attempt.
pub type Initializer = Arc<dyn Fn() -> Result<TransportHandle, BoxError> + Send + Sync>;

/// What a [`StreamClient`](super::StreamClient) connects to.
#[derive(Clone)]
pub enum Target {
    /// An `http` or `https` URL.
    Url(String),

    /// Connection options passed to the bundled HTTP transport as-is.
    Options(ConnectOptions),

    /// A custom transport factory.
    Initializer(Initializer),
}

impl Target {
    /// Connect with a custom transport factory.
    pub fn initializer<F>(initializer: F) -> Self
    where
        F: Fn() -> Result<TransportHandle, BoxError> + Send + Sync + 'static,
    {
        Target::Initializer(Arc::new(initializer))
    }

    pub(crate) fn resolve(self) -> Result<Connector, Error> {
        match self {
            Target::Url(url) => {
                let options: ConnectOptions = url.parse()?;
                Ok(Connector::Http(HttpConnector::new(options)))
            }
            Target::Options(options) => Ok(Connector::Http(HttpConnector::new(options))),
            Target::Initializer(initializer) => Ok(Connector::Custom(initializer)),
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Target::Options(options) => f.debug_tuple("Options").field(options).finish(),
            Target::Initializer(_) => f.debug_tuple("Initializer").finish(),
        }
    }
}

impl From<&str> for Target {
    fn from(url: &str) -> Self {
        Target::Url(url.to_owned())
    }
}

impl From<String> for Target {
    fn from(url: String) -> Self {
        Target::Url(url)
    }
}

impl From<Uri> for Target {
    fn from(uri: Uri) -> Self {
        Target::Url(uri.to_string())
    }
}

impl From<ConnectOptions> for Target {
    fn from(options: ConnectOptions) -> Self {
        Target::Options(options)
    }
}

/// A target resolved into something which can open transports.
#[derive(Clone)]
pub(crate) enum Connector {
    Http(HttpConnector),
    Custom(Initializer),
}

impl Connector {
    pub(crate) fn connect(&self) -> Result<TransportHandle, BoxError> {
        match self {
            Connector::Http(connector) => connector.connect(),
            Connector::Custom(initializer) => initializer(),
        }
    }

    #[cfg(feature = "tls")]
    pub(crate) fn with_tls_config(self, config: Arc<rustls::ClientConfig>) -> Self {
        match self {
            Connector::Http(connector) => Connector::Http(connector.with_tls_config(config)),
            custom => custom,
        }
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connector::Http(connector) => f.debug_tuple("Http").field(connector.options()).finish(),
            Connector::Custom(_) => f.debug_tuple("Custom").finish(),
        }
    }
}
