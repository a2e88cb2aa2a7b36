//! Inbound control-message queue.
//!
//! Fed by the control receive loop, drained by the coordinator. Waiters take
//! the first message of the kind they want and leave everything else in
//! place, so a non-matching head never blocks anyone and per-kind arrival
//! order is preserved.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use dyad_core::wire::{ControlMessage, MessageKind};

/// A decoded control message as received.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub body: ControlMessage,
    /// Sender clock.
    pub timestamp: f64,
    pub sender_addr: SocketAddr,
    /// Local clock at receipt.
    pub receipt_time: f64,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

#[derive(Default)]
pub struct Inbox {
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, msg: Message) {
        self.lock().push_back(msg);
        self.notify.notify_waiters();
    }

    /// Remove and return the oldest message of `kind`, if any.
    pub fn take(&self, kind: MessageKind) -> Option<Message> {
        let mut q = self.lock();
        let idx = q.iter().position(|m| m.kind() == kind)?;
        q.remove(idx)
    }

    pub fn contains(&self, kind: MessageKind) -> bool {
        self.lock().iter().any(|m| m.kind() == kind)
    }

    /// Remove and return the oldest message of any kind.
    pub fn pop(&self) -> Option<Message> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait up to `timeout` for a message of `kind`.
    pub async fn wait_for(&self, kind: MessageKind, timeout: Duration) -> Option<Message> {
        self.wait_until(timeout, || self.take(kind)).await
    }

    /// Wait up to `timeout` for the next message of any kind.
    pub async fn poll(&self, timeout: Duration) -> Option<Message> {
        self.wait_until(timeout, || self.pop()).await
    }

    async fn wait_until<F>(&self, timeout: Duration, mut attempt: F) -> Option<Message>
    where
        F: FnMut() -> Option<Message>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            // Register before checking so a push between the check and the
            // await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(msg) = attempt() {
                return Some(msg);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return attempt();
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Message>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
