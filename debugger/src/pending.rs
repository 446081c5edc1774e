//! Tracks in-flight request/reply rendezvous.
//!
//! The wire protocol has no sequence numbers, so a reply is matched to its
//! request by method name alone. That only works if at most one request per
//! reply method is outstanding, which [`PendingReplies::add`] enforces.

use std::collections::HashMap;

use transport::{Message, Method};

use crate::error::SessionError;

#[derive(Default)]
pub(crate) struct PendingReplies {
    pending: HashMap<Method, oneshot::Sender<Message>>,
}

impl PendingReplies {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register interest in the next message carrying `method`.
    pub(crate) fn add(
        &mut self,
        method: Method,
    ) -> Result<oneshot::Receiver<Message>, SessionError> {
        if self.pending.contains_key(&method) {
            return Err(SessionError::RequestPending(method));
        }
        let (tx, rx) = oneshot::channel();
        self.pending.insert(method, tx);
        Ok(rx)
    }

    /// Hand an incoming message to its waiter, if there is one.
    ///
    /// Returns whether a waiter existed for this method.
    pub(crate) fn resolve(&mut self, message: &Message) -> bool {
        let Some(sender) = self.pending.remove(&message.method) else {
            return false;
        };
        if sender.send(message.clone()).is_err() {
            tracing::debug!(method = %message.method, "reply waiter gave up before the reply arrived");
        }
        true
    }

    /// Forget a registration, for waiters that timed out.
    pub(crate) fn discard(&mut self, method: &Method) -> bool {
        self.pending.remove(method).is_some()
    }

    /// Drop every registration. Outstanding waiters observe a closed channel.
    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }
}
