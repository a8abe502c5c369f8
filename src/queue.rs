//! Single-consumer task queue that serializes all mutation of a state value.
//!
//! A [`SerialTaskQueue`] owns a state `S` on one dedicated worker thread and
//! runs submitted closures against it strictly in submission order. Callers
//! on any thread (including async I/O tasks reporting results) hand work to
//! the worker through an unbounded tokio mpsc channel, so `submit` never
//! blocks. A panicking closure is caught and logged; the worker moves on to
//! the next one.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tracing::{debug, error, trace};

/// A unit of work executed on the worker thread.
pub type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

enum Command<S> {
    Run(Job<S>),
    Close,
}

/// Cloneable handle for submitting work to a [`SerialTaskQueue`].
pub struct TaskSubmitter<S> {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Command<S>>,
    closed: Arc<AtomicBool>,
}

impl<S> Clone for TaskSubmitter<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<S> TaskSubmitter<S> {
    /// Enqueue `job`. Returns `false` if the queue no longer accepts work.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            trace!(queue = %self.name, "Dropping job submitted after close");
            return false;
        }
        self.tx.send(Command::Run(Box::new(job))).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// FIFO executor bound to one worker thread.
///
/// # Example
///
/// ```
/// use telemetry_shipper::queue::SerialTaskQueue;
///
/// let mut queue = SerialTaskQueue::<Vec<i32>>::start("counter", |_submitter| Vec::new()).unwrap();
/// for i in 0..3 {
///     queue.submit(move |seen: &mut Vec<i32>| seen.push(i));
/// }
/// queue.submit(|seen: &mut Vec<i32>| assert_eq!(*seen, vec![0, 1, 2]));
/// queue.close();
/// ```
pub struct SerialTaskQueue<S> {
    submitter: TaskSubmitter<S>,
    worker: Option<JoinHandle<()>>,
}

impl<S: 'static> SerialTaskQueue<S> {
    /// Spawn the worker thread named `name`.
    ///
    /// `init` runs on the worker before any job and builds the state; it
    /// receives a submitter so the state can schedule follow-up work on
    /// itself.
    pub fn start<F>(name: &str, init: F) -> std::io::Result<Self>
    where
        F: FnOnce(TaskSubmitter<S>) -> S + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let submitter = TaskSubmitter {
            name: Arc::from(name),
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };

        let worker_submitter = submitter.clone();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let name = worker_submitter.name.clone();
                let mut state = init(worker_submitter);
                run_worker(&name, &mut state, rx);
            })?;

        debug!(queue = name, "Serial task queue started");

        Ok(Self {
            submitter,
            worker: Some(worker),
        })
    }

    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.submitter.submit(job)
    }

    pub fn submitter(&self) -> TaskSubmitter<S> {
        self.submitter.clone()
    }

    pub fn name(&self) -> &str {
        self.submitter.name()
    }

    /// Stop accepting work, run everything already queued, and join the
    /// worker. Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.submitter.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.submitter.tx.send(Command::Close);

        if let Some(worker) = self.worker.take() {
            // Joining from inside a job would wait on ourselves
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                error!(queue = %self.submitter.name, "Worker thread panicked");
            }
        }
        debug!(queue = %self.submitter.name, "Serial task queue closed");
    }
}

impl<S> Drop for SerialTaskQueue<S> {
    fn drop(&mut self) {
        if self.submitter.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.submitter.tx.send(Command::Close);
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn run_worker<S>(name: &str, state: &mut S, mut rx: mpsc::UnboundedReceiver<Command<S>>) {
    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Run(job) => execute(name, state, job),
            Command::Close => {
                rx.close();
                // Drain whatever made it in before the close
                while let Ok(command) = rx.try_recv() {
                    if let Command::Run(job) = command {
                        execute(name, state, job);
                    }
                }
                break;
            }
        }
    }
    trace!(queue = name, "Worker exiting");
}

fn execute<S>(name: &str, state: &mut S, job: Job<S>) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| job(state))) {
        error!(
            queue = name,
            error = %panic_message(panic.as_ref()),
            "Queued action panicked"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
