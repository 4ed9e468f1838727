//! Minimal single-writer actor substrate.
//!
//! The coordinator is an actor: all registry mutations execute one at a
//! time against state the actor exclusively owns, with no internal locking.
//! Callers reach it only through an [`ActorHandle`], so every entry point
//! is serialized through one mailbox.

use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// Behavior of an actor.
///
/// Actors process messages one at a time, own mutable state not shared
/// with other tasks, and communicate only via message passing.
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on
    /// failure.
    async fn handle(&mut self, msg: Self::Message) -> Result<bool, ActorError>;

    /// Called when the actor starts.
    async fn on_start(&mut self) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self) {
        // Default: no cleanup
    }
}

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Handle for sending messages to an actor.
#[derive(Debug)]
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
}

// Manual impl avoids requiring `M: Clone`; the sender is always cloneable.
impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message to the actor.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }
}

/// Reference to a spawned actor task.
pub struct ActorRef {
    task_handle: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ActorRef {
    /// Signal the actor to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Check if the actor task is still running.
    pub fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    /// Wait for the actor task to finish.
    pub async fn join(self) {
        let _ = self.task_handle.await;
    }
}

/// Spawn an actor with a bounded mailbox.
pub fn spawn<A: Actor>(actor: A, mailbox_size: usize) -> (ActorHandle<A::Message>, ActorRef) {
    let (tx, rx) = mpsc::channel(mailbox_size);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let name = actor.name().to_string();

    let task_handle = tokio::spawn(async move {
        run_actor_loop(actor, rx, shutdown_rx, name).await;
    });

    (
        ActorHandle { tx },
        ActorRef {
            task_handle,
            shutdown_tx,
        },
    )
}

/// Run the main actor loop.
async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    name: String,
) {
    if let Err(e) = actor.on_start().await {
        error!(actor = %name, error = %e, "Actor failed to start");
        return;
    }

    debug!(actor = %name, "Actor started");
    let mut messages_processed = 0u64;

    loop {
        tokio::select! {
            biased;

            // Check shutdown first
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(actor = %name, "Actor received shutdown signal");
                    break;
                }
            }

            // Process messages
            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        messages_processed += 1;
                        match actor.handle(msg).await {
                            Ok(true) => {}
                            Ok(false) => {
                                info!(actor = %name, "Actor requested stop");
                                break;
                            }
                            Err(e) => {
                                error!(actor = %name, error = %e, "Actor error");
                                break;
                            }
                        }
                    }
                    None => {
                        debug!(actor = %name, "Actor mailbox closed");
                        break;
                    }
                }
            }
        }
    }

    actor.on_stop().await;
    info!(actor = %name, messages_processed, "Actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    /// Counter actor used to verify serialized message processing.
    struct Counter {
        count: u64,
    }

    #[derive(Debug)]
    enum CounterMessage {
        Increment,
        Get { reply_to: oneshot::Sender<u64> },
        Stop,
    }

    #[async_trait]
    impl Actor for Counter {
        type Message = CounterMessage;

        fn name(&self) -> &str {
            "counter"
        }

        async fn handle(&mut self, msg: CounterMessage) -> Result<bool, ActorError> {
            match msg {
                CounterMessage::Increment => {
                    self.count += 1;
                    Ok(true)
                }
                CounterMessage::Get { reply_to } => {
                    let _ = reply_to.send(self.count);
                    Ok(true)
                }
                CounterMessage::Stop => Ok(false),
            }
        }
    }

    #[tokio::test]
    async fn test_messages_are_serialized() {
        let (handle, actor_ref) = spawn(Counter { count: 0 }, 64);

        for _ in 0..10 {
            handle.send(CounterMessage::Increment).await.unwrap();
        }

        let (tx, rx) = oneshot::channel();
        handle.send(CounterMessage::Get { reply_to: tx }).await.unwrap();
        assert_eq!(rx.await.unwrap(), 10);

        handle.send(CounterMessage::Stop).await.unwrap();
        actor_ref.join().await;
    }

    #[tokio::test]
    async fn test_send_after_stop_fails() {
        let (handle, actor_ref) = spawn(Counter { count: 0 }, 4);

        handle.send(CounterMessage::Stop).await.unwrap();
        actor_ref.join().await;

        let result = handle.send(CounterMessage::Increment).await;
        assert!(matches!(result, Err(ActorError::ActorStopped)));
    }

    #[tokio::test]
    async fn test_stop_signal_breaks_loop() {
        let (_handle, actor_ref) = spawn(Counter { count: 0 }, 4);

        actor_ref.stop();
        actor_ref.join().await;
    }
}
