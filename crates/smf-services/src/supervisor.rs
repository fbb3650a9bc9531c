//! Long-lived task supervision.
//!
//! Every background task (pipeline workers, pool printer, status server) is
//! spawned through a `Supervisor`, which owns the shutdown broadcast and
//! reports how each task ended, including panics.

use std::any::Any;
use std::future::Future;

use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExit {
    Completed { name: String },
    Panicked { name: String, message: String },
    /// Aborted before completion; the name is lost with the task.
    Aborted,
}

impl TaskExit {
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked { .. })
    }
}

pub struct Supervisor {
    tasks: JoinSet<TaskExit>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: JoinSet::new(),
            shutdown_tx,
        }
    }

    /// A receiver that fires once `shutdown` is called.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!(task = %name, "spawning supervised task");
        let handle = tokio::spawn(task);
        self.tasks.spawn(async move {
            let _abort = AbortOnDrop(handle.abort_handle());
            match handle.await {
                Ok(()) => TaskExit::Completed { name },
                Err(e) if e.is_panic() => TaskExit::Panicked {
                    message: panic_message(e.into_panic().as_ref()),
                    name,
                },
                Err(_) => TaskExit::Aborted,
            }
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for the next task to end and log how it ended. `None` once no
    /// tasks remain.
    pub async fn next_exit(&mut self) -> Option<TaskExit> {
        let exit = match self.tasks.join_next().await? {
            Ok(exit) => exit,
            Err(_) => TaskExit::Aborted,
        };
        match &exit {
            TaskExit::Completed { name } => tracing::info!(task = %name, "task exited"),
            TaskExit::Panicked { name, message } => {
                tracing::error!(task = %name, panic = %message, "task panicked")
            }
            TaskExit::Aborted => tracing::warn!("task aborted"),
        }
        Some(exit)
    }

    /// Signal shutdown and wait for every task to end.
    pub async fn shutdown(mut self) -> Vec<TaskExit> {
        let _ = self.shutdown_tx.send(());
        let mut exits = Vec::with_capacity(self.tasks.len());
        while let Some(exit) = self.next_exit().await {
            exits.push(exit);
        }
        exits
    }
}

/// Aborting the watcher aborts the task it watches.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
