//! Process-wide host engine.
//!
//! Created on first use from [`RuntimeConfig::from_env`]; torn down only by
//! an explicit [`shutdown`]. A later [`engine`] call builds a fresh one.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::info;

use qcast_core::Result;

use crate::config::RuntimeConfig;
use crate::dispatch::Engine;
use crate::host::HostRuntime;

pub type HostEngine = Engine<HostRuntime>;

static ENGINE: OnceLock<Mutex<Option<Arc<HostEngine>>>> = OnceLock::new();

fn slot() -> &'static Mutex<Option<Arc<HostEngine>>> {
    ENGINE.get_or_init(|| Mutex::new(None))
}

/// The process-wide engine, creating it if needed.
pub fn engine() -> Result<Arc<HostEngine>> {
    let mut slot = slot().lock();
    if let Some(engine) = slot.as_ref() {
        return Ok(Arc::clone(engine));
    }
    let engine = Arc::new(Engine::host(RuntimeConfig::from_env()?)?);
    *slot = Some(Arc::clone(&engine));
    Ok(engine)
}

/// Install an engine built from `config`, replacing any existing one.
pub fn init(config: RuntimeConfig) -> Result<Arc<HostEngine>> {
    let engine = Arc::new(Engine::host(config)?);
    let previous = slot().lock().replace(Arc::clone(&engine));
    if let Some(previous) = previous {
        previous.shutdown()?;
    }
    Ok(engine)
}

pub fn is_initialized() -> bool {
    slot().lock().is_some()
}

/// Shut the process-wide engine's pool down and release it.
pub fn shutdown() -> Result<()> {
    let engine = slot().lock().take();
    match engine {
        Some(engine) => {
            engine.shutdown()?;
            info!("process-wide engine shut down");
            Ok(())
        }
        None => Ok(()),
    }
}
