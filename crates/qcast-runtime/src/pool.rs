//! Compute stream pool and multi-tensor fan-out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use qcast_core::{QcastError, Result};

use crate::error::RuntimeError;
use crate::runtime::DeviceRuntime;

/// A pool stream and the event used to join it back.
pub struct PoolEntry<R: DeviceRuntime> {
    pub stream: R::Stream,
    pub event: R::Event,
}

/// Fixed set of auxiliary streams used to spread independent per-tensor
/// work issued from one caller stream.
///
/// Streams are created at the device's greatest priority (when requested)
/// and live until [`StreamPool::shutdown`] or drop.
pub struct StreamPool<R: DeviceRuntime> {
    runtime: Arc<R>,
    entries: Vec<PoolEntry<R>>,
    /// Serializes the enqueue steps of concurrent fan-outs; no device work
    /// is waited on while it is held.
    fan_out_lock: Mutex<()>,
    shut_down: AtomicBool,
}

impl<R: DeviceRuntime> std::fmt::Debug for StreamPool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPool")
            .field("size", &self.entries.len())
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<R: DeviceRuntime> StreamPool<R> {
    pub fn new(runtime: Arc<R>, size: usize, high_priority: bool) -> Result<Self> {
        const OP: &str = "stream_pool_create";
        if size == 0 {
            return Err(QcastError::invalid(OP, "pool size must be at least 1"));
        }
        let priority = high_priority.then(|| runtime.properties().stream_priority_range().1);
        let mut entries = Vec::with_capacity(size);
        for _ in 0..size {
            let stream = runtime.create_stream(priority).map_err(|e| e.into_qcast(OP))?;
            let event = runtime.create_event().map_err(|e| e.into_qcast(OP))?;
            entries.push(PoolEntry { stream, event });
        }
        info!(runtime = runtime.name(), size, ?priority, "compute stream pool created");
        Ok(Self {
            runtime,
            entries,
            fan_out_lock: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Entry for `index mod size`.
    pub fn lease(&self, index: usize) -> std::result::Result<&PoolEntry<R>, RuntimeError> {
        if self.is_shut_down() {
            return Err(RuntimeError::PoolShutDown);
        }
        Ok(&self.entries[index % self.entries.len()])
    }

    /// Run `launch(i, stream)` for `i in 0..n` across the pool, ordered
    /// strictly after prior work on `caller` and strictly before anything
    /// enqueued on `caller` afterwards.
    ///
    /// Tensor `i` goes to pool stream `i mod size`. The host never blocks;
    /// the ordering is carried entirely by event record/wait pairs. Any
    /// failure is returned as soon as it happens.
    pub fn fan_out<F>(&self, op: &'static str, caller: &R::Stream, n: usize, mut launch: F) -> Result<()>
    where
        F: FnMut(usize, &R::Stream) -> Result<()>,
    {
        if n == 0 {
            return Ok(());
        }
        let _guard = self.fan_out_lock.lock();
        let rt = &*self.runtime;
        let used = n.min(self.size());
        debug!(op, n, streams = used, "fan-out");

        let fork = self.lease(0).map_err(|e| e.into_qcast(op))?;
        rt.record_event(&fork.event, caller).map_err(|e| e.into_qcast(op))?;
        for s in 0..used {
            let entry = self.lease(s).map_err(|e| e.into_qcast(op))?;
            rt.stream_wait_event(&entry.stream, &fork.event)
                .map_err(|e| e.into_qcast(op))?;
        }

        for i in 0..n {
            let entry = self.lease(i).map_err(|e| e.into_qcast(op))?;
            launch(i, &entry.stream)?;
        }

        for s in 0..used {
            let entry = self.lease(s).map_err(|e| e.into_qcast(op))?;
            rt.record_event(&entry.event, &entry.stream)
                .map_err(|e| e.into_qcast(op))?;
        }
        for s in 0..used {
            let entry = self.lease(s).map_err(|e| e.into_qcast(op))?;
            rt.stream_wait_event(caller, &entry.event)
                .map_err(|e| e.into_qcast(op))?;
        }
        Ok(())
    }

    /// Destroy every stream and event. Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        const OP: &str = "stream_pool_shutdown";
        let _guard = self.fan_out_lock.lock();
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for entry in &self.entries {
            self.runtime
                .destroy_stream(&entry.stream)
                .map_err(|e| e.into_qcast(OP))?;
            self.runtime
                .destroy_event(&entry.event)
                .map_err(|e| e.into_qcast(OP))?;
        }
        info!(runtime = self.runtime.name(), size = self.size(), "compute stream pool shut down");
        Ok(())
    }
}

impl<R: DeviceRuntime> Drop for StreamPool<R> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(runtime = self.runtime.name(), error = %e, "compute stream pool teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostRuntime;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn pool(size: usize) -> StreamPool<HostRuntime> {
        StreamPool::new(Arc::new(HostRuntime::new().unwrap()), size, true).unwrap()
    }

    #[test]
    fn test_lease_wraps_modulo_size() {
        let p = pool(4);
        assert_eq!(p.size(), 4);
        let a = p.lease(1).unwrap().stream.id();
        let b = p.lease(5).unwrap().stream.id();
        let c = p.lease(2).unwrap().stream.id();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(p.lease(0).unwrap().stream.priority(), -5);
    }

    #[test]
    fn test_zero_size_rejected() {
        let rt = Arc::new(HostRuntime::new().unwrap());
        assert!(StreamPool::new(rt, 0, false).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let p = pool(2);
        p.shutdown().unwrap();
        p.shutdown().unwrap();
        assert!(p.is_shut_down());
        assert!(matches!(p.lease(0), Err(RuntimeError::PoolShutDown)));
        let caller = p.runtime().default_stream();
        let err = p.fan_out("test", &caller, 1, |_, _| Ok(())).unwrap_err();
        assert!(err.is_runtime());
    }

    #[test]
    fn test_fan_out_joins_back_to_caller() {
        let p = pool(4);
        let rt = Arc::clone(p.runtime());
        let caller = rt.default_stream();
        let done = Arc::new(AtomicUsize::new(0));

        p.fan_out("test", &caller, 10, |i, stream| {
            let done = Arc::clone(&done);
            rt.launch_host_fn(stream, move || {
                thread::sleep(Duration::from_millis((10 - i as u64) * 2));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .map_err(|e| e.into_qcast("test"))
        })
        .unwrap();

        let observed = Arc::new(AtomicUsize::new(0));
        let (d, o) = (Arc::clone(&done), Arc::clone(&observed));
        rt.launch_host_fn(&caller, move || o.store(d.load(Ordering::SeqCst), Ordering::SeqCst))
            .unwrap();
        rt.synchronize(&caller).unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_fan_out_waits_for_prior_caller_work() {
        let p = pool(3);
        let rt = Arc::clone(p.runtime());
        let caller = rt.create_stream(None).unwrap();
        let ready = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ready);
        rt.launch_host_fn(&caller, move || {
            thread::sleep(Duration::from_millis(30));
            r.store(1, Ordering::SeqCst);
        })
        .unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        p.fan_out("test", &caller, 5, |_, stream| {
            let (r, s) = (Arc::clone(&ready), Arc::clone(&seen));
            rt.launch_host_fn(stream, move || s.lock().push(r.load(Ordering::SeqCst)))
                .map_err(|e| e.into_qcast("test"))
        })
        .unwrap();
        rt.synchronize(&caller).unwrap();
        assert_eq!(*seen.lock(), vec![1; 5]);
    }

    #[test]
    fn test_second_caller_fork_does_not_release_first_join() {
        let p = pool(1);
        let rt = Arc::clone(p.runtime());
        let caller_a = rt.create_stream(None).unwrap();
        let caller_b = rt.create_stream(None).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        p.fan_out("test", &caller_a, 1, |_, stream| {
            let d = Arc::clone(&done);
            rt.launch_host_fn(stream, move || {
                thread::sleep(Duration::from_millis(200));
                d.store(1, Ordering::SeqCst);
            })
            .map_err(|e| e.into_qcast("test"))
        })
        .unwrap();
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let (d, s) = (Arc::clone(&done), Arc::clone(&seen));
        rt.launch_host_fn(&caller_a, move || s.store(d.load(Ordering::SeqCst), Ordering::SeqCst))
            .unwrap();

        // B forks on the shared entry 0 event while A's work is still running
        p.fan_out("test", &caller_b, 1, |_, stream| {
            rt.launch_host_fn(stream, || {}).map_err(|e| e.into_qcast("test"))
        })
        .unwrap();

        rt.synchronize(&caller_a).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        rt.synchronize(&caller_b).unwrap();
    }

    #[test]
    fn test_fan_out_error_propagates() {
        let p = pool(2);
        let caller = p.runtime().default_stream();
        let mut calls = 0;
        let err = p
            .fan_out("test", &caller, 5, |i, _| {
                calls += 1;
                if i == 2 {
                    Err(QcastError::Runtime {
                        op: "test",
                        msg: "launch failed".into(),
                    })
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(err.is_runtime());
        assert_eq!(calls, 3);
    }
}
