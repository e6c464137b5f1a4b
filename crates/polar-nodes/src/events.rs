//! At-least-once consumption of a daemon's pending event queue.
//!
//! The daemon owns the queue. This loop fetches the head with
//! [`EventSource::wait_next`], runs the handler, and only then acknowledges
//! it with [`EventSource::handled`]. A failed handler leaves the event
//! unacknowledged, so the next fetch returns it again after a fixed backoff.
//! Handlers must therefore tolerate seeing the same event twice.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use polar_core::{PendingEvent, Result};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// Default pause after a failed iteration.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

/// The fetch/acknowledge pair of a daemon's event queue.
///
/// Calls alternate strictly: `handled` is only called after a `wait_next`
/// that returned an event.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Wait for the event at the head of the queue.
    async fn wait_next(&self) -> Result<PendingEvent>;

    /// Acknowledge the event returned by the last `wait_next`.
    async fn handled(&self) -> Result<()>;
}

/// Host code run for every delivered event.
#[async_trait]
pub trait EventHandler: Send {
    /// Handle `event`. An error withholds the acknowledgment.
    async fn handle(&mut self, event: &PendingEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: FnMut(PendingEvent) -> Fut + Send,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&mut self, event: &PendingEvent) -> anyhow::Result<()> {
        (self)(event.clone()).await
    }
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Suspended on the daemon's next event.
    Waiting,
    /// Running the handler against a delivered event.
    Handling,
    /// Pausing after a failure.
    Backoff,
    /// Cancelled by the host.
    Stopped,
}

/// Sequential fetch, handle, acknowledge loop for one node.
pub struct EventLoop<S: ?Sized, H> {
    name: String,
    source: Arc<S>,
    handler: H,
    backoff: Duration,
}

impl<S, H> EventLoop<S, H>
where
    S: EventSource + ?Sized + 'static,
    H: EventHandler + 'static,
{
    /// Create a loop delivering events from `source` to `handler`.
    pub fn new(name: impl Into<String>, source: Arc<S>, handler: H) -> Self {
        Self {
            name: name.into(),
            source,
            handler,
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Set the pause after a failed iteration.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run the loop on a new task.
    pub fn spawn(self) -> EventLoopHandle {
        let (cancel, cancel_rx) = watch::channel(false);
        let (state_tx, state) = watch::channel(LoopState::Waiting);
        let task = tokio::spawn(self.run(cancel_rx, state_tx));
        EventLoopHandle {
            cancel,
            state,
            task,
        }
    }

    /// Run until `cancel` flips to `true` or its sender is dropped.
    ///
    /// Cancellation is only observed while waiting for an event or backing
    /// off. A delivered event is always handled and, on success,
    /// acknowledged before the loop looks at `cancel` again.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>, state: watch::Sender<LoopState>) {
        info!(node = %self.name, "event loop started");

        loop {
            state.send_replace(LoopState::Waiting);
            let next = tokio::select! {
                biased;
                () = cancelled(&mut cancel) => break,
                next = self.source.wait_next() => next,
            };

            let failure = match next {
                Ok(event) => {
                    state.send_replace(LoopState::Handling);
                    debug!(node = %self.name, ?event, "handling event");
                    match self.handler.handle(&event).await {
                        Ok(()) => match self.source.handled().await {
                            Ok(()) => continue,
                            Err(e) => format!("acknowledge failed: {e}"),
                        },
                        Err(e) => format!("handler failed: {e:#}"),
                    }
                }
                Err(e) => format!("fetching next event failed: {e}"),
            };

            warn!(node = %self.name, backoff = ?self.backoff, "{failure}");
            state.send_replace(LoopState::Backoff);
            tokio::select! {
                biased;
                () = cancelled(&mut cancel) => break,
                () = tokio::time::sleep(self.backoff) => {}
            }
        }

        state.send_replace(LoopState::Stopped);
        info!(node = %self.name, "event loop stopped");
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Control handle of a spawned [`EventLoop`].
///
/// Dropping the handle cancels the loop.
#[derive(Debug)]
pub struct EventLoopHandle {
    cancel: watch::Sender<bool>,
    state: watch::Receiver<LoopState>,
    task: JoinHandle<()>,
}

impl EventLoopHandle {
    /// Ask the loop to stop at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Current loop state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Receiver observing state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<LoopState> {
        self.state.clone()
    }

    /// Whether the loop task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to exit without cancelling it.
    pub async fn join(self) -> std::result::Result<(), JoinError> {
        let Self { cancel, task, .. } = self;
        let result = task.await;
        drop(cancel);
        result
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn stop(self) -> std::result::Result<(), JoinError> {
        self.cancel();
        self.join().await
    }
}
