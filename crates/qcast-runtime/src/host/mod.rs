//! Host-emulated device runtime.
//!
//! Every stream is an ordered command queue drained by its own worker
//! thread, events are generation counters, and kernels run the reference
//! implementations from `qcast-kernels`. Ordering follows a real device:
//! FIFO per stream, record/wait snapshots taken at enqueue time, and sticky
//! kernel errors.

mod event;
mod exec;
mod stream;

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use qcast_core::Device;

use crate::config::RuntimeConfig;
use crate::device::DeviceProperties;
use crate::error::RuntimeError;
use crate::runtime::{DeviceRuntime, KernelLaunch};

pub use event::HostEvent;
pub use stream::HostStream;
use stream::Command;

/// Priority range reported by the host runtime, matching current GPUs.
pub const HOST_STREAM_PRIORITY_RANGE: (i32, i32) = (0, -5);

#[derive(Debug, Clone)]
pub struct HostProperties {
    sm_count: usize,
    sm_arch: u32,
}

impl DeviceProperties for HostProperties {
    fn num_devices(&self) -> usize {
        1
    }

    fn current_device(&self) -> usize {
        0
    }

    fn sm_arch(&self) -> u32 {
        self.sm_arch
    }

    fn sm_count(&self) -> usize {
        self.sm_count
    }

    fn stream_priority_range(&self) -> (i32, i32) {
        HOST_STREAM_PRIORITY_RANGE
    }

    fn supports_multicast(&self) -> bool {
        false
    }
}

pub struct HostRuntime {
    props: HostProperties,
    default_stream: HostStream,
    next_id: AtomicU64,
}

impl HostRuntime {
    /// Host runtime with default configuration.
    pub fn new() -> Result<Self, RuntimeError> {
        Self::with_config(&RuntimeConfig::default())
    }

    pub fn with_config(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let default_stream = HostStream::spawn(0, HOST_STREAM_PRIORITY_RANGE.0)?;
        info!(
            sm_count = config.host_sm_count,
            sm_arch = config.host_sm_arch,
            "host runtime created"
        );
        Ok(Self {
            props: HostProperties {
                sm_count: config.host_sm_count,
                sm_arch: config.host_sm_arch,
            },
            default_stream,
            next_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Enqueue a host callback on `stream`; it runs in stream order.
    pub fn launch_host_fn<F>(&self, stream: &HostStream, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        stream.submit(Command::HostFn(Box::new(f)))
    }
}

impl DeviceRuntime for HostRuntime {
    type Stream = HostStream;
    type Event = HostEvent;

    fn name(&self) -> &'static str {
        "host"
    }

    fn device(&self) -> Device {
        Device::Host
    }

    fn properties(&self) -> &dyn DeviceProperties {
        &self.props
    }

    fn default_stream(&self) -> HostStream {
        self.default_stream.clone()
    }

    fn create_stream(&self, priority: Option<i32>) -> Result<HostStream, RuntimeError> {
        let (least, greatest) = HOST_STREAM_PRIORITY_RANGE;
        let priority = priority.unwrap_or(least).clamp(greatest, least);
        let stream = HostStream::spawn(self.next_id(), priority)?;
        debug!(stream = stream.id(), priority, "stream created");
        Ok(stream)
    }

    fn create_event(&self) -> Result<HostEvent, RuntimeError> {
        Ok(HostEvent::new(self.next_id()))
    }

    fn record_event(&self, event: &HostEvent, stream: &HostStream) -> Result<(), RuntimeError> {
        if event.is_destroyed() {
            return Err(RuntimeError::EventDestroyed(event.id()));
        }
        if stream.is_destroyed() {
            return Err(RuntimeError::StreamDestroyed(stream.id()));
        }
        let generation = event.next_generation();
        let submitted = stream.submit(Command::Record(event.clone(), generation));
        if submitted.is_err() {
            // never enqueued, so nothing would ever complete it
            event.complete(generation);
        }
        submitted
    }

    fn stream_wait_event(&self, stream: &HostStream, event: &HostEvent) -> Result<(), RuntimeError> {
        if event.is_destroyed() {
            return Err(RuntimeError::EventDestroyed(event.id()));
        }
        let generation = event.recorded_generation();
        if generation == 0 {
            return Ok(());
        }
        stream.submit(Command::Wait(event.clone(), generation))
    }

    fn synchronize(&self, stream: &HostStream) -> Result<(), RuntimeError> {
        stream.synchronize()
    }

    fn destroy_stream(&self, stream: &HostStream) -> Result<(), RuntimeError> {
        if stream.id() == self.default_stream.id() {
            return Err(RuntimeError::Driver {
                op: "destroy_stream",
                msg: "the default stream cannot be destroyed".into(),
            });
        }
        stream.shutdown()?;
        debug!(stream = stream.id(), "stream destroyed");
        Ok(())
    }

    fn destroy_event(&self, event: &HostEvent) -> Result<(), RuntimeError> {
        if event.is_destroyed() {
            return Err(RuntimeError::EventDestroyed(event.id()));
        }
        event.mark_destroyed();
        Ok(())
    }

    fn launch(&self, stream: &HostStream, launch: KernelLaunch) -> Result<(), RuntimeError> {
        if let Some(err) = stream.error() {
            return Err(err);
        }
        stream.submit(Command::Kernel(Box::new(launch)))
    }
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        match self.default_stream.shutdown() {
            Ok(()) | Err(RuntimeError::StreamDestroyed(_)) => {}
            Err(e) => warn!(error = %e, "default host stream teardown failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_stream_fifo_order() {
        let rt = HostRuntime::new().unwrap();
        let s = rt.create_stream(None).unwrap();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..20 {
            let log = Arc::clone(&log);
            rt.launch_host_fn(&s, move || {
                if i % 3 == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
                log.lock().push(i);
            })
            .unwrap();
        }
        rt.synchronize(&s).unwrap();
        assert_eq!(*log.lock(), (0..20).collect::<Vec<_>>());
        rt.destroy_stream(&s).unwrap();
    }

    #[test]
    fn test_cross_stream_wait() {
        let rt = HostRuntime::new().unwrap();
        let a = rt.create_stream(None).unwrap();
        let b = rt.create_stream(None).unwrap();
        let ev = rt.create_event().unwrap();
        let flag = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&flag);
        rt.launch_host_fn(&a, move || {
            thread::sleep(Duration::from_millis(30));
            f.store(1, Ordering::SeqCst);
        })
        .unwrap();
        rt.record_event(&ev, &a).unwrap();
        rt.stream_wait_event(&b, &ev).unwrap();
        let f = Arc::clone(&flag);
        let seen = Arc::new(AtomicUsize::new(99));
        let s2 = Arc::clone(&seen);
        rt.launch_host_fn(&b, move || s2.store(f.load(Ordering::SeqCst), Ordering::SeqCst))
            .unwrap();
        rt.synchronize(&b).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_on_unrecorded_event_is_noop() {
        let rt = HostRuntime::new().unwrap();
        let s = rt.create_stream(None).unwrap();
        let ev = rt.create_event().unwrap();
        rt.stream_wait_event(&s, &ev).unwrap();
        assert_eq!(s.pending(), 0);
        rt.synchronize(&s).unwrap();
    }

    #[test]
    fn test_destroyed_handles() {
        let rt = HostRuntime::new().unwrap();
        let s = rt.create_stream(Some(-100)).unwrap();
        assert_eq!(s.priority(), -5);
        rt.destroy_stream(&s).unwrap();
        assert!(matches!(
            rt.destroy_stream(&s),
            Err(RuntimeError::StreamDestroyed(_))
        ));
        assert!(rt.launch_host_fn(&s, || {}).is_err());

        let ev = rt.create_event().unwrap();
        rt.destroy_event(&ev).unwrap();
        assert!(rt.record_event(&ev, &rt.default_stream()).is_err());
        assert!(rt.destroy_stream(&rt.default_stream()).is_err());
    }

    #[test]
    fn test_panicking_host_fn_poisons_stream() {
        let rt = HostRuntime::new().unwrap();
        let s = rt.create_stream(None).unwrap();
        let ev = rt.create_event().unwrap();
        rt.launch_host_fn(&s, || panic!("boom")).unwrap();
        rt.record_event(&ev, &s).unwrap();
        assert!(matches!(rt.synchronize(&s), Err(RuntimeError::Poisoned { .. })));
        // the record marker still completed
        assert!(ev.query());
    }
}
