//! Inbound message stream.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;

use crate::types::Message;

/// A reader attached to the client's inbound messages.
///
/// Each stream sees every matching message once, in the order the
/// handshakes completed. The stream ends when the client is dropped.
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl MessageStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { rx }
    }

    /// Wait for the next message. `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Take a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Receive a message with timeout.
    ///
    /// Returns `None` on timeout or when the client is gone.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Stream for MessageStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}
