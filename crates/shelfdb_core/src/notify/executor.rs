//! Execution contexts for listener callbacks.

use parking_lot::Mutex;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, warn};

/// A unit of work handed to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs listener deliveries.
///
/// A serial executor (one that runs tasks one at a time in submission
/// order) sees the commits of a database in commit order.
pub trait Executor: Send + Sync {
    /// Runs or schedules `task`.
    fn execute(&self, task: Task);
}

/// Runs every task immediately on the committing thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}

/// A serial queue backed by one worker thread.
///
/// `shutdown` stops accepting tasks, lets the worker finish what is queued
/// and joins it.
#[derive(Debug)]
pub struct DispatchQueue {
    sender: Mutex<Option<Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl DispatchQueue {
    /// Starts a queue whose worker thread is called `name`.
    ///
    /// # Errors
    ///
    /// Fails if the thread cannot be spawned.
    pub fn new(name: &str) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Task>();
        let worker = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        warn!("dispatch queue task panicked");
                    }
                }
            })?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// True when called from the queue's own worker.
    #[must_use]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Drains queued tasks and stops the worker.
    ///
    /// From the worker itself the queue is closed but not joined.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        if self.is_current() {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("dispatch queue worker panicked");
            }
        }
    }
}

impl Executor for DispatchQueue {
    fn execute(&self, task: Task) {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => {
                if tx.send(task).is_err() {
                    debug!("dispatch queue worker gone; task dropped");
                }
            }
            None => debug!("dispatch queue shut down; task dropped"),
        }
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
