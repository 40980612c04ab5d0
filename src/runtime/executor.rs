//! Executors: where invocations actually run.
//!
//! The scheduler only ever sees `submit`. The thread pool is the production
//! choice; the inline executor runs work on the calling thread when polled,
//! which makes tests deterministic and suits environments without threads.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender};

use crate::config::ExecutorConfig;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Executor: Send + Sync {
    fn submit(&self, task: Task);
}

/// N workers draining one fair FIFO queue.
pub struct ThreadPoolExecutor {
    tx: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPoolExecutor {
    pub fn new(name: &str, config: &ExecutorConfig) -> std::io::Result<ThreadPoolExecutor> {
        let workers = match config.workers {
            0 => std::thread::available_parallelism().map_or(1, usize::from),
            n => n,
        };
        let (tx, rx) = crossbeam::channel::unbounded::<Task>();
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx: Receiver<Task> = rx.clone();
            let mut builder = std::thread::Builder::new().name(format!("{name}-{i}"));
            if let Some(stack_size) = config.stack_size {
                builder = builder.stack_size(stack_size);
            }
            handles.push(builder.spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
            })?);
        }
        Ok(ThreadPoolExecutor {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        })
    }
}

impl Executor for ThreadPoolExecutor {
    fn submit(&self, task: Task) {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            // Send fails only after shutdown; the task is then dropped,
            // which is the contract during teardown.
            let _ = tx.send(task);
        }
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(tx);
        let handles = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        // The last reference can be released from a worker's own task;
        // that worker must not join itself.
        let current = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

/// Cooperative single-threaded executor: queued tasks run on whichever
/// thread calls `poll`.
#[derive(Default)]
pub struct InlineExecutor {
    queue: Mutex<VecDeque<Task>>,
}

impl InlineExecutor {
    pub fn new() -> InlineExecutor {
        InlineExecutor::default()
    }

    /// Run one queued task. Returns whether one ran.
    pub fn poll(&self) -> bool {
        let task = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run until the queue is empty, including tasks enqueued while running.
    pub fn run_until_idle(&self) {
        while self.poll() {}
    }

    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Executor for InlineExecutor {
    fn submit(&self, task: Task) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(task);
    }
}
