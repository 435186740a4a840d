//! Processes the events of a single connection attempt.

use std::ops::ControlFlow;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tracing::{debug, trace};

use super::{Error, StreamClient};
use crate::notify::RecoveryReason;
use crate::transport::{Event, EventReceiver, ResponseHead, Socket};

enum Phase {
    /// No response yet.
    Waiting,

    /// A non-200 response, whose body is collected for the error.
    Rejected { status: StatusCode, body: BytesMut },

    /// A 200 response, whose body is delivered to listeners.
    Streaming { status: StatusCode },
}

struct Driver {
    client: StreamClient,
    generation: u64,
    socket: Option<Box<dyn Socket>>,
    phase: Phase,
}

/// Drive the attempt with `generation` until it settles or its transport goes quiet.
pub(super) async fn drive(client: StreamClient, generation: u64, mut events: EventReceiver) {
    let mut driver = Driver {
        client,
        generation,
        socket: None,
        phase: Phase::Waiting,
    };

    while let Some(event) = events.recv().await {
        trace!(generation, ?event, "transport event");
        if driver.handle(event).is_break() {
            return;
        }
    }

    driver.hang_up();
}

impl Driver {
    fn handle(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Socket(mut socket) => {
                socket.set_timeout(self.client.shared.config.effective_socket_timeout());
                self.socket = Some(socket);
                ControlFlow::Continue(())
            }
            Event::SocketTimeout => {
                if let Some(socket) = self.socket.as_mut() {
                    socket.destroy();
                }
                self.fault(RecoveryReason::Timeout)
            }
            Event::SocketClosed { had_error: true } => self.fault(RecoveryReason::ClosedWithError),
            Event::SocketClosed { had_error: false } => ControlFlow::Continue(()),
            Event::Response(head) => self.response(head),
            Event::Data(chunk) => self.data(chunk),
            Event::End => self.end(),
            Event::Error(error) => match self.phase {
                Phase::Streaming { .. } => {
                    debug!(generation = self.generation, %error, "transport error while streaming");
                    ControlFlow::Continue(())
                }
                Phase::Waiting | Phase::Rejected { .. } => {
                    self.client.fail(self.generation, Error::transport(error));
                    ControlFlow::Break(())
                }
            },
        }
    }

    fn response(&mut self, head: ResponseHead) -> ControlFlow<()> {
        if !matches!(self.phase, Phase::Waiting) {
            trace!(generation = self.generation, "ignoring repeated response");
            return ControlFlow::Continue(());
        }

        let status = head.status();
        if status == StatusCode::OK {
            if !self.client.connected(self.generation) {
                return ControlFlow::Break(());
            }
            self.phase = Phase::Streaming { status };
        } else {
            debug!(generation = self.generation, %status, "unexpected response status");
            self.phase = Phase::Rejected {
                status,
                body: BytesMut::new(),
            };
        }
        ControlFlow::Continue(())
    }

    fn data(&mut self, chunk: Bytes) -> ControlFlow<()> {
        match &mut self.phase {
            Phase::Streaming { status } => {
                if !self.client.is_current(self.generation) {
                    return ControlFlow::Break(());
                }
                self.client.shared.notifier.data(&chunk, *status);
            }
            Phase::Rejected { body, .. } => body.extend_from_slice(&chunk),
            Phase::Waiting => trace!(generation = self.generation, "ignoring data before response"),
        }
        ControlFlow::Continue(())
    }

    fn end(&mut self) -> ControlFlow<()> {
        match std::mem::replace(&mut self.phase, Phase::Waiting) {
            Phase::Streaming { status } => {
                if !self.client.is_current(self.generation) {
                    return ControlFlow::Break(());
                }
                self.client.shared.notifier.end(status);
                self.fault(RecoveryReason::ServerEnd)
            }
            Phase::Rejected { status, body } => {
                let body = String::from_utf8_lossy(&body).into_owned();
                self.client
                    .fail(self.generation, Error::BadStatus { status, body });
                ControlFlow::Break(())
            }
            Phase::Waiting => {
                trace!(generation = self.generation, "ignoring end before response");
                ControlFlow::Continue(())
            }
        }
    }

    fn fault(&mut self, reason: RecoveryReason) -> ControlFlow<()> {
        self.client.fault(self.generation, reason);
        ControlFlow::Break(())
    }

    /// The transport dropped its event stream without a terminal event.
    fn hang_up(mut self) {
        match self.phase {
            Phase::Streaming { .. } => {
                debug!(generation = self.generation, "transport hung up while streaming");
                let _ = self.fault(RecoveryReason::ClosedWithError);
            }
            Phase::Waiting | Phase::Rejected { .. } => {
                self.client.fail(self.generation, Error::TransportClosed);
            }
        }
    }
}
