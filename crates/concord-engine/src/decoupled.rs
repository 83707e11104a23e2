//! A streamed run whose live feed and final value are independent.
//!
//! ```text
//!              ┌──────────────┐   events   ┌────────────────┐
//!  provider ──>│   producer   │───────────>│  events()      │  (at most once)
//!   frames     │ (background) │            └────────────────┘
//!              │              │   done     ┌────────────────┐
//!              │  answer buf  │───────────>│  resolved()    │  (memoized)
//!              └──────────────┘            └────────────────┘
//! ```
//!
//! The producer accumulates unconditionally, so the resolved value is
//! available whether or not the feed is ever read.  `resolved()` waits for
//! the producer to finish and never looks at a partial buffer.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::{OnceCell, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::stream::{AnswerBuffer, EventStream, SpawnedRun};
use crate::types::StreamEvent;

/// Turns the final answer text into the run's resolved value.
pub(crate) type Resolver<T> = Arc<dyn Fn(String) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Handle to a background streamed run.
///
/// Created by [`Engine::begin_stream`](crate::Engine::begin_stream) and
/// [`Engine::begin_stream_structured`](crate::Engine::begin_stream_structured).
pub struct DecoupledRun<T> {
    run_id: Uuid,
    events: Mutex<Option<EventStream>>,
    done: tokio::sync::Mutex<oneshot::Receiver<Result<String>>>,
    value: OnceCell<Result<T>>,
    finished: Arc<AtomicBool>,
    buffer: AnswerBuffer,
    resolver: Resolver<T>,
    cancel: CancellationToken,
}

impl<T> fmt::Debug for DecoupledRun<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoupledRun")
            .field("run_id", &self.run_id)
            .field("finished", &self.finished.load(Ordering::Acquire))
            .field("resolved", &self.value.initialized())
            .finish()
    }
}

impl<T> DecoupledRun<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new(
        run_id: Uuid,
        spawned: SpawnedRun,
        resolver: Resolver<T>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            events: Mutex::new(Some(spawned.events)),
            done: tokio::sync::Mutex::new(spawned.done),
            value: OnceCell::new(),
            finished: spawned.finished,
            buffer: spawned.buffer,
            resolver,
            cancel,
        }
    }

    /// Identifier of the run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Take the live event feed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Usage`] if the feed was already taken.
    pub fn events(&self) -> Result<EventStream> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| EngineError::usage("the live event feed of this run was already drained"))
    }

    /// Take the live feed and drain it to its terminal event.
    pub async fn drain_events(&self) -> Result<Vec<StreamEvent>> {
        Ok(self.events()?.collect_all().await)
    }

    /// Whether the background producer has finished.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Answer text accumulated so far in the current round.
    ///
    /// This is a progress view only; use [`resolved`](Self::resolved) for
    /// the final value.
    pub fn buffered_text(&self) -> String {
        self.buffer.snapshot()
    }

    /// Request cancellation.  The run ends at its next await point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to finish and return its resolved value.
    ///
    /// The wait and the resolution happen once; later calls, including
    /// concurrent ones, observe the same outcome.
    pub async fn resolved(&self) -> std::result::Result<&T, &EngineError> {
        self.value.get_or_init(|| self.resolve_once()).await.as_ref()
    }

    /// Consume the handle and return the resolved value.
    pub async fn into_resolved(self) -> Result<T> {
        // Resolution is driven to completion first, so the cell is set.
        let _ = self.resolved().await;
        self.value
            .into_inner()
            .unwrap_or_else(|| Err(EngineError::Internal("run resolved without a value".into())))
    }

    async fn resolve_once(&self) -> Result<T> {
        let outcome = {
            let mut done = self.done.lock().await;
            (&mut *done).await
        };
        let text = match outcome {
            Ok(result) => result?,
            Err(_) => {
                return Err(EngineError::Internal(
                    "stream producer stopped before reporting a result".into(),
                ));
            }
        };
        tracing::debug!(run_id = %self.run_id, chars = text.len(), "resolving decoupled run");
        (self.resolver)(text).await
    }
}
