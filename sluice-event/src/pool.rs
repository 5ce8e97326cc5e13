use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Spawns worker threads and hands out joinable tasks.
///
/// Socket pumps live on threads from a pool so that ownership of their
/// lifetime stays explicit: an [`AsyncTask`] joins on drop unless it has been
/// detached.
#[derive(Clone, Default)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    spawned: AtomicU64,
}

impl ThreadPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `f` on a new named thread.
    ///
    /// Failure to create the thread is returned to the caller; nothing is
    /// retried.
    pub fn spawn<F>(&self, name: &str, f: F) -> io::Result<AsyncTask>
    where
        F: FnOnce() + Send + 'static,
    {
        let n = self.inner.spawned.fetch_add(1, Ordering::Relaxed);
        let handle = thread::Builder::new().name(format!("{name}-{n}")).spawn(f)?;
        Ok(AsyncTask {
            handle: Some(handle),
        })
    }
}

/// Handle to a spawned worker. Joins on drop.
pub struct AsyncTask {
    handle: Option<thread::JoinHandle<()>>,
}

impl AsyncTask {
    /// Waits for the worker to finish.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Lets the worker run to completion on its own.
    pub fn detach(mut self) {
        self.handle.take();
    }
}

impl Drop for AsyncTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn join_waits_for_completion() {
        let pool = ThreadPool::new();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let task = pool
            .spawn("worker", move || {
                thread::sleep(std::time::Duration::from_millis(20));
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();
        task.join();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn detach_does_not_block() {
        let pool = ThreadPool::new();
        let task = pool.spawn("worker", || {}).unwrap();
        task.detach();
    }
}
