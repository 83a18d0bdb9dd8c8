//! Host streams: one worker thread draining an ordered command queue.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use super::event::HostEvent;
use super::exec;
use crate::error::RuntimeError;
use crate::runtime::KernelLaunch;

pub(crate) enum Command {
    Kernel(Box<KernelLaunch>),
    /// Complete `generation` of the event.
    Record(HostEvent, u64),
    /// Stall this stream until `generation` of the event completes.
    Wait(HostEvent, u64),
    HostFn(Box<dyn FnOnce() + Send + 'static>),
}

#[derive(Default)]
struct StreamState {
    submitted: u64,
    completed: u64,
    /// Sticky failure of the first kernel that failed on this stream.
    error: Option<RuntimeError>,
}

struct StreamCore {
    id: u64,
    state: Mutex<StreamState>,
    idle: Condvar,
}

struct StreamHandle {
    core: Arc<StreamCore>,
    priority: i32,
    sender: Mutex<Option<Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a host stream. Clones refer to the same queue.
#[derive(Clone)]
pub struct HostStream {
    inner: Arc<StreamHandle>,
}

impl HostStream {
    pub(crate) fn spawn(id: u64, priority: i32) -> Result<Self, RuntimeError> {
        let (tx, rx) = mpsc::channel();
        let core = Arc::new(StreamCore {
            id,
            state: Mutex::new(StreamState::default()),
            idle: Condvar::new(),
        });
        let worker_core = Arc::clone(&core);
        let worker = thread::Builder::new()
            .name(format!("qcast-stream-{id}"))
            .spawn(move || worker_loop(worker_core, rx))
            .map_err(|e| RuntimeError::Driver {
                op: "create_stream",
                msg: e.to_string(),
            })?;
        Ok(Self {
            inner: Arc::new(StreamHandle {
                core,
                priority,
                sender: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.core.id
    }

    pub fn priority(&self) -> i32 {
        self.inner.priority
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.sender.lock().is_none()
    }

    /// Sticky error left by a failed kernel, if any.
    pub fn error(&self) -> Option<RuntimeError> {
        self.inner.core.state.lock().error.clone()
    }

    /// Commands enqueued but not yet executed.
    pub fn pending(&self) -> u64 {
        let st = self.inner.core.state.lock();
        st.submitted - st.completed
    }

    pub(crate) fn submit(&self, cmd: Command) -> Result<(), RuntimeError> {
        let sender = self.inner.sender.lock();
        let tx = sender
            .as_ref()
            .ok_or(RuntimeError::StreamDestroyed(self.id()))?;
        self.inner.core.state.lock().submitted += 1;
        if tx.send(cmd).is_err() {
            self.inner.core.state.lock().submitted -= 1;
            return Err(RuntimeError::StreamDestroyed(self.id()));
        }
        Ok(())
    }

    pub(crate) fn synchronize(&self) -> Result<(), RuntimeError> {
        let core = &self.inner.core;
        let mut st = core.state.lock();
        let target = st.submitted;
        while st.completed < target {
            core.idle.wait(&mut st);
        }
        match &st.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Close the queue, let the worker drain what was already enqueued and
    /// join it.
    pub(crate) fn shutdown(&self) -> Result<(), RuntimeError> {
        let tx = self
            .inner
            .sender
            .lock()
            .take()
            .ok_or(RuntimeError::StreamDestroyed(self.id()))?;
        drop(tx);
        if let Some(worker) = self.inner.worker.lock().take() {
            worker.join().map_err(|_| RuntimeError::Driver {
                op: "destroy_stream",
                msg: format!("worker of stream {} panicked", self.id()),
            })?;
        }
        Ok(())
    }
}

impl fmt::Debug for HostStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostStream(id={}, priority={})", self.id(), self.priority())
    }
}

fn worker_loop(core: Arc<StreamCore>, rx: Receiver<Command>) {
    for cmd in rx {
        match cmd {
            Command::Kernel(launch) => run_kernel(&core, &launch),
            Command::Record(event, generation) => {
                trace!(stream = core.id, event = event.id(), generation, "record");
                event.complete(generation);
            }
            Command::Wait(event, generation) => {
                trace!(stream = core.id, event = event.id(), generation, "wait");
                event.wait_for(generation);
            }
            Command::HostFn(f) => {
                if catch_unwind(AssertUnwindSafe(f)).is_err() {
                    poison(&core, "host_fn".to_string(), "host function panicked".to_string());
                }
            }
        }
        let mut st = core.state.lock();
        st.completed += 1;
        core.idle.notify_all();
    }
    trace!(stream = core.id, "worker exit");
}

fn run_kernel(core: &StreamCore, launch: &KernelLaunch) {
    if core.state.lock().error.is_some() {
        trace!(stream = core.id, kernel = %launch, "skipped on poisoned stream");
        return;
    }
    trace!(stream = core.id, kernel = %launch, "execute");
    match catch_unwind(AssertUnwindSafe(|| exec::execute(launch))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => poison(core, launch.name(), e.to_string()),
        Err(_) => poison(core, launch.name(), "kernel panicked".to_string()),
    }
}

fn poison(core: &StreamCore, op: String, msg: String) {
    warn!(stream = core.id, kernel = %op, error = %msg, "stream poisoned");
    let mut st = core.state.lock();
    if st.error.is_none() {
        st.error = Some(RuntimeError::Poisoned { op, msg });
    }
}
