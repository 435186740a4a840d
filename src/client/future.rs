//! Futures returned by [`StreamClient`](super::StreamClient).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_util::future::{FutureExt as _, Shared};
use pin_project::pin_project;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::Error;
use crate::BoxFuture;

type SharedStart = Shared<BoxFuture<'static, Result<(), Error>>>;

/// The outcome of a connection attempt.
///
/// Every call to [`start`](super::StreamClient::start) made while an attempt is in flight
/// returns a clone of the same future; [`StartFuture::ptr_eq`] tells whether two futures
/// belong to the same attempt.
#[derive(Clone)]
#[pin_project]
pub struct StartFuture {
    #[pin]
    inner: SharedStart,
}

impl StartFuture {
    pub(super) fn pending(outcome: oneshot::Receiver<Result<(), Error>>) -> Self {
        let future: BoxFuture<'static, Result<(), Error>> =
            Box::pin(async move { outcome.await.unwrap_or(Err(Error::Stopped)) });
        Self {
            inner: future.shared(),
        }
    }

    pub(super) fn ready(outcome: Result<(), Error>) -> Self {
        let future: BoxFuture<'static, Result<(), Error>> = Box::pin(std::future::ready(outcome));
        Self {
            inner: future.shared(),
        }
    }

    /// Whether both futures track the same connection attempt.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.inner.ptr_eq(&other.inner)
    }
}

impl fmt::Debug for StartFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartFuture")
            .field("settled", &self.inner.peek().is_some())
            .finish()
    }
}

impl Future for StartFuture {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().inner.poll(cx)
    }
}

/// The outcome of a recovery sequence.
///
/// The sequence runs in the background whether or not this future is polled.
#[derive(Debug)]
#[pin_project]
pub struct RecoverFuture {
    #[pin]
    inner: Recovery,
}

#[derive(Debug)]
#[pin_project(project = RecoveryProj)]
enum Recovery {
    Rejected(Option<Error>),
    Running(#[pin] JoinHandle<Result<(), Error>>),
}

impl RecoverFuture {
    pub(super) fn rejected(error: Error) -> Self {
        Self {
            inner: Recovery::Rejected(Some(error)),
        }
    }

    pub(super) fn running(task: JoinHandle<Result<(), Error>>) -> Self {
        Self {
            inner: Recovery::Running(task),
        }
    }
}

impl Future for RecoverFuture {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().inner.project() {
            RecoveryProj::Rejected(error) => Poll::Ready(Err(error
                .take()
                .expect("recover future polled after completion"))),
            RecoveryProj::Running(task) => match ready!(task.poll(cx)) {
                Ok(outcome) => Poll::Ready(outcome),
                Err(error) if error.is_cancelled() => Poll::Ready(Err(Error::Stopped)),
                Err(error) => std::panic::resume_unwind(error.into_panic()),
            },
        }
    }
}
