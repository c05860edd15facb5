//! Messaging infrastructure for actor communication.
//!
//! An actor declares which messages it understands by implementing [`Message<T>`] once per message type `T`.
//! Messages are processed one at a time with exclusive mutable access to the actor's state, which is what makes
//! actors a serialization boundary.

use std::{future::Future, marker::PhantomData};

use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::actor::Actor;

/// A message that can modify an actor's state.
pub trait Message<T: Send + 'static>: Actor {
    /// The reply sent back to the caller of [`ask`](crate::actor::ActorRef::ask).
    type Reply: Send + 'static;

    /// Handler for this message.
    fn handle(
        &mut self,
        msg: T,
        ctx: Context<'_, Self>,
    ) -> impl Future<Output = Self::Reply> + Send;
}

/// A context provided to message handlers.
#[derive(Debug)]
pub struct Context<'a, A: Actor> {
    stop: &'a mut bool,
    _actor: PhantomData<fn() -> A>,
}

impl<'a, A: Actor> Context<'a, A> {
    pub(crate) fn new(stop: &'a mut bool) -> Self {
        Context {
            stop,
            _actor: PhantomData,
        }
    }

    /// Stops the actor once the current message has been handled.
    ///
    /// Messages still queued in the mailbox are dropped, and their callers see
    /// [`SendError::ActorStopped`](crate::error::SendError::ActorStopped).
    pub fn stop(&mut self) {
        *self.stop = true;
    }
}

/// An object safe message which can be handled by an actor `A`.
pub(crate) trait DynMessage<A: Actor>: Send {
    fn handle_dyn<'a>(self: Box<Self>, state: &'a mut A, stop: &'a mut bool) -> BoxFuture<'a, ()>;
}

pub(crate) type BoxMessage<A> = Box<dyn DynMessage<A>>;

/// A message paired with the channel its reply goes back on, if anyone is waiting.
pub(crate) struct Envelope<M, R> {
    pub(crate) msg: M,
    pub(crate) reply: Option<oneshot::Sender<R>>,
}

impl<A, M, R> DynMessage<A> for Envelope<M, R>
where
    A: Message<M, Reply = R>,
    M: Send + 'static,
    R: Send + 'static,
{
    fn handle_dyn<'a>(self: Box<Self>, state: &'a mut A, stop: &'a mut bool) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Envelope { msg, reply } = *self;
            let out = state.handle(msg, Context::new(stop)).await;
            if let Some(tx) = reply {
                // The asker may have given up waiting.
                let _ = tx.send(out);
            }
        })
    }
}
