//! Single-writer state owners.
//!
//! Every piece of state that more than one concurrent task needs to mutate is owned by an actor: a value that
//! lives inside its own tokio task and is only ever touched by the messages it receives, one at a time. Other
//! tasks hold an [`ActorRef`] and either [`tell`](ActorRef::tell) it something (fire-and-forget) or
//! [`ask`](ActorRef::ask) it something (request/reply).
//!
//! Because an actor processes its mailbox sequentially, a reader can never observe a half-applied mutation, and
//! no lock is ever held across network I/O.
//!
//! # Example
//!
//! ```
//! use seedmesh::actor::{self, Actor};
//! use seedmesh::message::{Context, Message};
//!
//! struct Counter {
//!     count: u64,
//! }
//!
//! impl Actor for Counter {}
//!
//! struct Inc(u64);
//!
//! impl Message<Inc> for Counter {
//!     type Reply = u64;
//!
//!     async fn handle(&mut self, Inc(amount): Inc, _ctx: Context<'_, Self>) -> Self::Reply {
//!         self.count += amount;
//!         self.count
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let counter = actor::spawn(Counter { count: 0 });
//! counter.tell(Inc(1)).await?;
//! assert_eq!(counter.ask(Inc(2)).await?, 3);
//! # Ok::<(), seedmesh::error::SendError>(())
//! # });
//! ```

mod actor_ref;
mod spawn;

use std::{any, future::Future};

use crate::error::ActorStopReason;

pub use actor_ref::*;
pub use spawn::*;

const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// Core behavior of an actor, including its lifecycle hooks.
///
/// Both hooks have empty default implementations, so most actors are declared with a bare
/// `impl Actor for MyActor {}`.
pub trait Actor: Sized + Send + 'static {
    /// The name of the actor, used in log events.
    ///
    /// # Default Implementation
    /// By default, this returns the type name of the actor.
    #[inline]
    fn name() -> &'static str {
        any::type_name::<Self>()
    }

    /// Called once in the actor's task, before any message is processed.
    #[allow(unused_variables)]
    fn on_start(&mut self, actor_ref: ActorRef<Self>) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called once after the last message has been processed.
    #[allow(unused_variables)]
    fn on_stop(&mut self, reason: ActorStopReason) -> impl Future<Output = ()> + Send {
        async {}
    }
}
