use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::oneshot;

use crate::{
    actor::Actor,
    error::SendError,
    mailbox::{MailboxSender, Signal},
    message::{Envelope, Message},
};

static ACTOR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A process-unique identifier for a spawned actor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(u64);

impl ActorId {
    pub(crate) fn generate() -> Self {
        ActorId(ACTOR_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the sequential number of this actor; the first spawned actor gets 0.
    pub fn sequence_id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({})", self.0)
    }
}

/// A reference to an actor, used for sending messages to it.
///
/// Cloning an `ActorRef` is cheap. The actor keeps running while its mailbox is open: until it is stopped, or
/// until every `ActorRef` to it has been dropped.
pub struct ActorRef<A: Actor> {
    id: ActorId,
    mailbox: MailboxSender<A>,
}

impl<A: Actor> ActorRef<A> {
    pub(crate) fn new(id: ActorId, mailbox: MailboxSender<A>) -> Self {
        ActorRef { id, mailbox }
    }

    /// Returns the unique identifier of the actor.
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Returns whether the actor is still accepting messages.
    pub fn is_alive(&self) -> bool {
        !self.mailbox.is_closed()
    }

    /// Sends a message without waiting for it to be handled.
    ///
    /// Waits only for mailbox capacity.
    pub async fn tell<M>(&self, msg: M) -> Result<(), SendError>
    where
        A: Message<M>,
        M: Send + 'static,
    {
        let envelope = Envelope::<M, A::Reply> { msg, reply: None };
        self.mailbox
            .send(Signal::Message(Box::new(envelope)))
            .await
            .map_err(|_| SendError::ActorNotRunning)
    }

    /// Sends a message and waits for the actor's reply.
    pub async fn ask<M>(&self, msg: M) -> Result<A::Reply, SendError>
    where
        A: Message<M>,
        M: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let envelope = Envelope {
            msg,
            reply: Some(tx),
        };
        self.mailbox
            .send(Signal::Message(Box::new(envelope)))
            .await
            .map_err(|_| SendError::ActorNotRunning)?;

        rx.await.map_err(|_| SendError::ActorStopped)
    }

    /// Signals the actor to stop after handling the messages already queued before this call.
    pub async fn stop_gracefully(&self) -> Result<(), SendError> {
        self.mailbox
            .send(Signal::Stop)
            .await
            .map_err(|_| SendError::ActorNotRunning)
    }

    /// Waits until the actor has stopped and dropped its mailbox.
    pub async fn wait_for_stop(&self) {
        self.mailbox.closed().await
    }
}

impl<A: Actor> Clone for ActorRef<A> {
    fn clone(&self) -> Self {
        ActorRef {
            id: self.id,
            mailbox: self.mailbox.clone(),
        }
    }
}

impl<A: Actor> fmt::Debug for ActorRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef")
            .field("id", &self.id)
            .field("name", &A::name())
            .field("alive", &self.is_alive())
            .finish()
    }
}
