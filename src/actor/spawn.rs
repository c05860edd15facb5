use tracing::trace;

use crate::{
    actor::{Actor, ActorId, ActorRef, DEFAULT_MAILBOX_CAPACITY},
    error::ActorStopReason,
    mailbox::{self, MailboxReceiver, Signal},
};

/// Spawns an actor in a Tokio task with the default mailbox capacity.
///
/// Must be called from within a Tokio runtime.
pub fn spawn<A>(actor: A) -> ActorRef<A>
where
    A: Actor,
{
    spawn_with_capacity(actor, DEFAULT_MAILBOX_CAPACITY)
}

/// Spawns an actor in a Tokio task with a bounded mailbox of `capacity` signals.
pub fn spawn_with_capacity<A>(actor: A, capacity: usize) -> ActorRef<A>
where
    A: Actor,
{
    let (mailbox, mailbox_rx) = mailbox::bounded(capacity.max(1));
    let actor_ref = ActorRef::new(ActorId::generate(), mailbox);

    tokio::spawn(run_actor_lifecycle(actor_ref.clone(), actor, mailbox_rx));

    actor_ref
}

async fn run_actor_lifecycle<A>(actor_ref: ActorRef<A>, mut actor: A, mut mailbox_rx: MailboxReceiver<A>)
where
    A: Actor,
{
    let id = actor_ref.id();
    let name = A::name();
    trace!(%id, %name, "actor started");

    actor.on_start(actor_ref).await;

    let reason = recv_mailbox_loop(&mut actor, &mut mailbox_rx).await;

    // Closing the receiver wakes `wait_for_stop` and fails every pending send.
    mailbox_rx.close();
    drop(mailbox_rx);

    actor.on_stop(reason).await;
    trace!(%id, %name, %reason, "actor stopped");
}

async fn recv_mailbox_loop<A>(actor: &mut A, mailbox_rx: &mut MailboxReceiver<A>) -> ActorStopReason
where
    A: Actor,
{
    loop {
        match mailbox_rx.recv().await {
            Some(Signal::Message(message)) => {
                let mut stop = false;
                message.handle_dyn(actor, &mut stop).await;
                if stop {
                    return ActorStopReason::Normal;
                }
            }
            Some(Signal::Stop) => return ActorStopReason::Normal,
            None => return ActorStopReason::MailboxClosed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use crate::{
        error::SendError,
        message::{Context, Message},
    };

    use super::*;

    struct Recorder {
        items: Vec<u32>,
        stopped: Arc<AtomicBool>,
    }

    impl Actor for Recorder {
        async fn on_stop(&mut self, _reason: ActorStopReason) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    struct Push(u32);
    struct Items;
    struct Halt;

    impl Message<Push> for Recorder {
        type Reply = ();

        async fn handle(&mut self, Push(n): Push, _ctx: Context<'_, Self>) {
            self.items.push(n);
        }
    }

    impl Message<Items> for Recorder {
        type Reply = Vec<u32>;

        async fn handle(&mut self, _: Items, _ctx: Context<'_, Self>) -> Vec<u32> {
            self.items.clone()
        }
    }

    impl Message<Halt> for Recorder {
        type Reply = ();

        async fn handle(&mut self, _: Halt, mut ctx: Context<'_, Self>) {
            ctx.stop();
        }
    }

    fn recorder() -> (Recorder, Arc<AtomicBool>) {
        let stopped = Arc::new(AtomicBool::new(false));
        (
            Recorder {
                items: Vec::new(),
                stopped: stopped.clone(),
            },
            stopped,
        )
    }

    #[tokio::test]
    async fn messages_are_handled_in_order() {
        let (actor, _) = recorder();
        let actor_ref = spawn(actor);
        for n in 0..10 {
            actor_ref.tell(Push(n)).await.unwrap();
        }
        assert_eq!(actor_ref.ask(Items).await.unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn stop_gracefully_runs_on_stop_and_rejects_later_sends() {
        let (actor, stopped) = recorder();
        let actor_ref = spawn(actor);
        actor_ref.tell(Push(1)).await.unwrap();
        actor_ref.stop_gracefully().await.unwrap();
        actor_ref.wait_for_stop().await;

        assert!(!actor_ref.is_alive());
        assert_eq!(actor_ref.tell(Push(2)).await, Err(SendError::ActorNotRunning));
        // on_stop runs right after the mailbox closes
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn handler_can_stop_the_actor() {
        let (actor, _) = recorder();
        let actor_ref = spawn(actor);
        actor_ref.ask(Halt).await.unwrap();
        actor_ref.wait_for_stop().await;
        assert_eq!(actor_ref.ask(Items).await, Err(SendError::ActorNotRunning));
    }
}
