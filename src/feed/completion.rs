//! Execution contexts for delivering fetch completions.
//!
//! A UI host usually needs results on its own loop (the "main thread"), while
//! a daemon is happy to run them anywhere on the runtime. The fetch task hands
//! its callback to a [`CompletionContext`], which decides where it runs.
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// A boxed completion callback.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where completion callbacks execute.
#[derive(Clone, Debug)]
pub enum CompletionContext {
    /// Run on the task that performed the fetch.
    Inline,
    /// Spawn onto the given runtime.
    Runtime(Handle),
    /// Queue for a host loop that drains a [`CompletionQueue`].
    Queue(mpsc::UnboundedSender<Job>),
}

impl CompletionContext {
    /// Runs `job` in this context.
    ///
    /// If the queue's receiver is gone the job runs inline instead, so every
    /// dispatched callback still runs exactly once.
    pub fn dispatch(&self, job: Job) {
        match self {
            Self::Inline => job(),
            Self::Runtime(handle) => {
                handle.spawn(async move { job() });
            }
            Self::Queue(tx) => {
                if let Err(mpsc::error::SendError(job)) = tx.send(job) {
                    tracing::warn!("Completion queue closed, running callback inline");
                    job();
                }
            }
        }
    }
}

/// Receiving side of [`CompletionContext::Queue`], owned by the host loop.
pub struct CompletionQueue {
    tx: mpsc::UnboundedSender<Job>,
    rx: mpsc::UnboundedReceiver<Job>,
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// A context that delivers into this queue.
    pub fn context(&self) -> CompletionContext {
        CompletionContext::Queue(self.tx.clone())
    }

    /// Runs every callback that is already queued, returning how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Waits for the next callback and runs it.
    pub async fn run_next(&mut self) {
        // The queue holds a sender itself, so recv() only yields None after close.
        if let Some(job) = self.rx.recv().await {
            job();
        }
    }
}
