//! Tokio tasks utilities

use std::future::Future;

use monitoring::logging;
use tokio::task::{JoinError, JoinSet};

/// A wrapper around [`JoinSet`] that implements fail-fast semantics.
///
/// When any task fails (or panics), all remaining tasks are immediately aborted.
/// Chunk tasks only fail on errors that invalidate the whole collection, so the first
/// failure is the only one worth waiting for.
///
/// ## Behavior
/// - **Success**: Outputs are handed out one at a time, in completion order
/// - **Failure**: First error/panic aborts all remaining tasks
/// - **Cancellation**: Individual cancellations are logged but don't abort others
/// - **Drop**: Aborts all tasks if dropped
///
/// All the tasks must have the same return type `T`.
pub struct FailFastJoinSet<T>(JoinSet<T>);

impl<T> Default for FailFastJoinSet<T> {
    fn default() -> Self {
        Self(JoinSet::new())
    }
}

impl<T> FailFastJoinSet<T> {
    /// Creates a new empty fail-fast join set
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task in the set
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.0.spawn(task);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T, E> FailFastJoinSet<Result<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Waits for the next task to complete.
    ///
    /// Returns `None` once the set is empty. On the first failure the remaining tasks are
    /// aborted and awaited before the error is returned, so the set is empty afterwards.
    pub async fn join_next(&mut self) -> Option<Result<T, TaskError<E>>> {
        while let Some(result) = self.0.join_next().await {
            if let Some(output) = self.settle(result).await {
                return Some(output);
            }
        }
        None
    }

    /// Like [`join_next`](Self::join_next) but only looks at tasks that have already completed.
    pub async fn try_join_next(&mut self) -> Option<Result<T, TaskError<E>>> {
        while let Some(result) = self.0.try_join_next() {
            if let Some(output) = self.settle(result).await {
                return Some(output);
            }
        }
        None
    }

    async fn settle(
        &mut self,
        result: Result<Result<T, E>, JoinError>,
    ) -> Option<Result<T, TaskError<E>>> {
        match result {
            Ok(Ok(output)) => Some(Ok(output)),
            // One task returned an error, abort the rest of the tasks and
            // wait for them to stop, then return the error
            Ok(Err(err)) => {
                self.0.shutdown().await;
                Some(Err(TaskError::Error(err)))
            }
            // One of the tasks was cancelled, continue
            Err(err) if err.is_cancelled() => {
                tracing::trace!("task {} was cancelled", err.id());
                None
            }
            // One of the tasks panicked, abort the rest of the tasks and
            // wait for them to stop, then return the error
            Err(err) => {
                tracing::error!(error = %err, error_source = logging::error_source(&err), "task {} panicked", err.id());
                self.0.shutdown().await;
                Some(Err(TaskError::Panic(err)))
            }
        }
    }
}

/// The error type returned by [`FailFastJoinSet::join_next`]
///
/// This enum represents the two failure modes when waiting for parallel tasks:
/// either a task explicitly returned an error, or a task panicked unexpectedly.
/// In both cases, all remaining tasks are aborted before returning.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub enum TaskError<E> {
    /// A task returned an error through its Result type
    ///
    /// This occurs when one of the spawned tasks completes with `Err(e)`.
    /// The fail-fast behavior ensures remaining tasks are immediately aborted.
    ///
    /// The wrapped error `E` is the original error returned by the failed task,
    /// preserving full error context and source chain for debugging.
    Error(E),

    /// A task panicked during execution
    ///
    /// Panics indicate bugs rather than remote or filesystem failures. The wrapped
    /// `JoinError` contains the panic payload if available.
    Panic(JoinError),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn join_next_yields_outputs_until_empty() {
        //* Given
        let mut set = FailFastJoinSet::<Result<u32, String>>::new();
        for i in 0..3 {
            set.spawn(async move { Ok(i) });
        }

        //* When
        let mut outputs = Vec::new();
        while let Some(output) = set.join_next().await {
            outputs.push(output.expect("Failed to join task"));
        }
        outputs.sort();

        //* Then
        assert_eq!(outputs, vec![0, 1, 2]);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn first_error_aborts_the_remaining_tasks() {
        //* Given
        let mut set = FailFastJoinSet::<Result<u32, String>>::new();
        set.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(1)
        });
        set.spawn(async { Err("boom".to_string()) });

        //* When
        let result = set.join_next().await;

        //* Then
        assert!(matches!(result, Some(Err(TaskError::Error(err))) if err == "boom"));
        assert!(set.is_empty());
        assert!(set.join_next().await.is_none());
    }

    #[tokio::test]
    async fn panics_are_reported() {
        //* Given
        let mut set = FailFastJoinSet::<Result<u32, String>>::new();
        let buggy = true;
        set.spawn(async move {
            if buggy {
                panic!("chunk task bug");
            }
            Ok(0)
        });

        //* When
        let result = set.join_next().await;

        //* Then
        assert!(matches!(result, Some(Err(TaskError::Panic(_)))));
    }
}
