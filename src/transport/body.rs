//! Streaming request body fed by [`Transport::write`](super::Transport::write).

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame};
use tokio::sync::mpsc;

/// A request body which yields chunks as they are written, and ends when the writer is dropped.
#[derive(Debug)]
pub(crate) struct RequestBody {
    chunks: mpsc::UnboundedReceiver<Bytes>,
}

impl RequestBody {
    pub(crate) fn channel() -> (BodyWriter, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BodyWriter { chunks: Some(tx) }, Self { chunks: rx })
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.chunks
            .poll_recv(cx)
            .map(|chunk| chunk.map(|data| Ok(Frame::data(data))))
    }
}

/// Writing half of a [`RequestBody`].
#[derive(Debug)]
pub(crate) struct BodyWriter {
    chunks: Option<mpsc::UnboundedSender<Bytes>>,
}

impl BodyWriter {
    /// Queue a chunk. Returns `false` if the body is finished or the request is gone.
    pub(crate) fn write(&mut self, chunk: Bytes) -> bool {
        match &self.chunks {
            Some(tx) if !chunk.is_empty() => tx.send(chunk).is_ok(),
            Some(_) => true,
            None => false,
        }
    }

    /// Queue an optional last chunk, then finish the body.
    pub(crate) fn finish(&mut self, chunk: Option<Bytes>) {
        if let Some(chunk) = chunk {
            self.write(chunk);
        }
        self.chunks = None;
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.chunks.is_none()
    }
}
