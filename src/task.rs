//! Background task handles.

use std::future::Future;

use tokio::task;

/// A handle to a spawned background task.
///
/// Dropping the handle aborts the task (unless [`Task::detach`] is used), so
/// owning a `Task` is owning the loop inside it; there is no way to leak a
/// poller by forgetting to cancel it.
#[derive(Debug)]
pub(crate) struct Task<T> {
    join_handle: task::JoinHandle<T>,
    detached: bool,
}

impl<T> Task<T> {
    pub(crate) fn spawn<Fut>(future: Fut) -> Task<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Task {
            join_handle: task::spawn(future),
            detached: false,
        }
    }

    /// Lets the task run to completion on its own.
    #[allow(dead_code)]
    pub(crate) fn detach(mut self) {
        self.detached = true;
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if !self.detached {
            self.join_handle.abort();
        }
    }
}
