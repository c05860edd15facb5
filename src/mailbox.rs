//! A multi-producer, single-consumer queue of signals for an actor to process sequentially.

use tokio::sync::mpsc;

use crate::{actor::Actor, message::BoxMessage};

/// A signal sent to an actor's mailbox.
pub(crate) enum Signal<A: Actor> {
    /// A message to be handled, optionally carrying a reply channel.
    Message(BoxMessage<A>),
    /// Stop after the signals queued before this one have been handled.
    Stop,
}

pub(crate) type MailboxSender<A> = mpsc::Sender<Signal<A>>;
pub(crate) type MailboxReceiver<A> = mpsc::Receiver<Signal<A>>;

/// Creates a bounded mailbox; senders wait for capacity, giving natural backpressure.
pub(crate) fn bounded<A: Actor>(capacity: usize) -> (MailboxSender<A>, MailboxReceiver<A>) {
    mpsc::channel(capacity)
}
