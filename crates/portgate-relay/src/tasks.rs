//! Per-session task tracking
//!
//! Every task spawned on behalf of a session (public listener, metrics
//! flusher, TCP pumps) is registered here so teardown can stop them all
//! without leaving strays behind.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

pub struct SessionTasks {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SessionTasks {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Track a task under `key`, aborting any previous task with that key.
    pub fn register(&self, key: impl Into<String>, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(old) = tasks.insert(key.into(), handle) {
                old.abort();
            }
        }
    }

    /// Forget a task that finished on its own. Does not abort.
    pub fn remove(&self, key: &str) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.remove(key);
        }
    }

    /// Abort everything still tracked.
    pub fn abort_all(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
    }

    /// Abort everything still tracked and wait until each task has
    /// actually finished, so sockets and listeners the tasks hold are
    /// released by the time this returns.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain().map(|(_, handle)| handle).collect(),
            Err(_) => return,
        };
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn count(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }
}

impl Default for SessionTasks {
    fn default() -> Self {
        Self::new()
    }
}
