//! Long-lived task plumbing shared across the gateway: cooperative shutdown
//! signaling, abort-on-drop task handles and a collector for joined teardown.

use std::future::Future;

use async_trait::async_trait;
use tokio::task::JoinHandle;

/// Broadcasts the shutdown order to every [`ShutdownSignal`] clone.
#[derive(Debug)]
pub struct ShutdownHandle(tokio::sync::watch::Sender<()>);

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = tokio::sync::watch::channel(());
        (Self(sender), ShutdownSignal(receiver))
    }

    pub fn signal(&self) {
        let _ = self.0.send(());
    }

    /// Resolves once every signal clone has been dropped, i.e. all tasks
    /// observed the order and returned.
    pub async fn all_closed(&self) {
        self.0.closed().await;
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal(tokio::sync::watch::Receiver<()>);

impl ShutdownSignal {
    pub async fn wait(&mut self) {
        let _ = self.0.changed().await;
    }
}

/// A handle that aborts the underlying tokio task when dropped.
///
/// See https://github.com/tokio-rs/tokio/issues/1830 for why detaching must
/// be explicit.
#[must_use]
#[derive(Debug)]
pub struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        ChildTask(tokio::task::spawn(future))
    }

    pub async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }

    pub fn abort(&self) {
        self.0.abort();
    }

    /// Let the task keep running after the handle is gone.
    pub fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> From<JoinHandle<T>> for ChildTask<T> {
    fn from(value: JoinHandle<T>) -> Self {
        Self(value)
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}

/// A named long-lived loop owned by the service.
#[async_trait]
pub trait Task {
    type Output: Send;

    const NAME: &'static str;

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output;
}

pub fn spawn_task<T>(task: T, shutdown_signal: ShutdownSignal) -> ChildTask<T::Output>
where
    T: Task + 'static,
{
    ChildTask(tokio::task::spawn(task.run(shutdown_signal)))
}

/// Collects the service's long-lived tasks so they can be signaled and
/// drained together at shutdown.
pub struct TaskSet<O> {
    children: Vec<ChildTask<O>>,
    shutdown_handle: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
}

impl<O: Send + 'static> TaskSet<O> {
    pub fn new() -> Self {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

        Self {
            children: Vec::new(),
            shutdown_handle,
            shutdown_signal,
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown_signal.clone()
    }

    pub fn register<T>(&mut self, task: T)
    where
        T: Task<Output = O> + 'static,
    {
        let child = spawn_task(task, self.shutdown_signal.clone());
        self.children.push(child);
    }

    pub fn into_parts(self) -> (Vec<ChildTask<O>>, ShutdownHandle) {
        (self.children, self.shutdown_handle)
    }
}

impl<O: Send + 'static> Default for TaskSet<O> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sleeper;

    #[async_trait]
    impl Task for Sleeper {
        type Output = &'static str;

        const NAME: &'static str = "sleeper";

        async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
            shutdown_signal.wait().await;
            "done"
        }
    }

    #[tokio::test]
    async fn task_observes_shutdown_signal() {
        let mut set = TaskSet::new();
        set.register(Sleeper);

        let (children, handle) = set.into_parts();
        handle.signal();

        for child in children {
            assert_eq!(child.join().await.expect("join"), "done");
        }
    }

    #[tokio::test]
    async fn dropping_child_aborts_task() {
        let (_handle, signal) = ShutdownHandle::new();
        let child = spawn_task(Sleeper, signal);
        drop(child);
        // The task was aborted; nothing to assert beyond not hanging.
    }
}
