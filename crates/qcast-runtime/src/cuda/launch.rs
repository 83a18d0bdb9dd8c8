//! Kernel module cache and grid helpers.
//!
//! Sources are compiled with NVRTC on first use and kept per
//! `(ordinal, module)`.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use cudarc::driver::{CudaContext, CudaFunction, CudaModule, LaunchConfig};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::RuntimeError;

static LOADED: OnceLock<Mutex<HashMap<(usize, &'static str), Arc<CudaModule>>>> = OnceLock::new();

fn loaded() -> &'static Mutex<HashMap<(usize, &'static str), Arc<CudaModule>>> {
    LOADED.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Compile and load `source` as `module_name` unless already loaded.
pub fn ensure_module(
    ctx: &Arc<CudaContext>,
    ordinal: usize,
    module_name: &'static str,
    source: &str,
) -> Result<Arc<CudaModule>, RuntimeError> {
    let key = (ordinal, module_name);
    if let Some(m) = loaded().lock().get(&key) {
        return Ok(Arc::clone(m));
    }

    let ptx = cudarc::nvrtc::compile_ptx(source).map_err(|e| RuntimeError::PtxCompile {
        module: module_name.to_string(),
        msg: e.to_string(),
    })?;
    let module = ctx.load_module(ptx).map_err(|e| RuntimeError::PtxCompile {
        module: module_name.to_string(),
        msg: e.to_string(),
    })?;
    debug!(ordinal, module = module_name, "kernel module loaded");

    let mut map = loaded().lock();
    let module = map.entry(key).or_insert(module);
    Ok(Arc::clone(module))
}

pub fn get_or_load_func(
    ctx: &Arc<CudaContext>,
    ordinal: usize,
    module_name: &'static str,
    func_name: &str,
    source: &str,
) -> Result<CudaFunction, RuntimeError> {
    let module = ensure_module(ctx, ordinal, module_name, source)?;
    module
        .load_function(func_name)
        .map_err(|_| RuntimeError::FuncNotFound {
            module: module_name.to_string(),
            func: func_name.to_string(),
        })
}

pub fn grid_1d(n: usize, block_size: u32) -> LaunchConfig {
    let grid = n.div_ceil(block_size as usize).max(1);
    LaunchConfig {
        grid_dim: (grid as u32, 1, 1),
        block_dim: (block_size, 1, 1),
        shared_mem_bytes: 0,
    }
}

/// One thread per column, one block row per `chunk_rows` rows.
pub fn grid_cols_chunks(rows: usize, cols: usize, block_size: u32, chunk_rows: usize) -> LaunchConfig {
    LaunchConfig {
        grid_dim: (
            cols.div_ceil(block_size as usize).max(1) as u32,
            rows.div_ceil(chunk_rows).max(1) as u32,
            1,
        ),
        block_dim: (block_size, 1, 1),
        shared_mem_bytes: 0,
    }
}
