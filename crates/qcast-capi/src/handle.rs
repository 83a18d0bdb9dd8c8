//! Tagged opaque handles.
//!
//! A handle is a `u64`: the top 16 bits name the object kind and the low 48
//! bits index a process-wide registry. Every entry point checks both before
//! touching the object, so a stream handle passed where a tensor is expected
//! fails with an invalid-handle status instead of being reinterpreted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use qcast_core::{QcastError, Result};

pub type Handle = u64;

const TAG_SHIFT: u32 = 48;
const ID_MASK: u64 = (1 << TAG_SHIFT) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HandleKind {
    Tensor = 0x5154,
    Stream = 0x5153,
    Config = 0x5143,
}

impl HandleKind {
    pub fn name(self) -> &'static str {
        match self {
            HandleKind::Tensor => "tensor",
            HandleKind::Stream => "stream",
            HandleKind::Config => "quantization config",
        }
    }
}

pub const fn make_handle(kind: HandleKind, id: u64) -> Handle {
    ((kind as u64) << TAG_SHIFT) | (id & ID_MASK)
}

pub(crate) struct Registry<T> {
    kind: HandleKind,
    next: AtomicU64,
    entries: Mutex<HashMap<u64, T>>,
}

impl<T: Clone> Registry<T> {
    pub fn new(kind: HandleKind) -> Self {
        Self {
            kind,
            // id 0 is reserved per kind
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, value: T) -> Handle {
        let id = self.next.fetch_add(1, Ordering::Relaxed) & ID_MASK;
        self.entries.lock().insert(id, value);
        make_handle(self.kind, id)
    }

    /// Registry id of `handle` after checking its tag.
    pub fn id_of(&self, handle: Handle) -> Result<u64> {
        if (handle >> TAG_SHIFT) as u16 != self.kind as u16 {
            return Err(QcastError::InvalidHandle(format!(
                "{handle:#x} is not a {} handle",
                self.kind.name()
            )));
        }
        Ok(handle & ID_MASK)
    }

    fn missing(&self, handle: Handle) -> QcastError {
        QcastError::InvalidHandle(format!("{handle:#x}: no live {}", self.kind.name()))
    }

    pub fn get(&self, handle: Handle) -> Result<T> {
        let id = self.id_of(handle)?;
        self.entries
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| self.missing(handle))
    }

    pub fn update(&self, handle: Handle, f: impl FnOnce(&mut T) -> Result<()>) -> Result<()> {
        let id = self.id_of(handle)?;
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id).ok_or_else(|| self.missing(handle))?;
        f(entry)
    }

    pub fn remove(&self, handle: Handle) -> Result<T> {
        let id = self.id_of(handle)?;
        self.entries.lock().remove(&id).ok_or_else(|| self.missing(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_is_checked() {
        let tensors: Registry<u32> = Registry::new(HandleKind::Tensor);
        let streams: Registry<u32> = Registry::new(HandleKind::Stream);
        let h = tensors.insert(7);
        assert_eq!(tensors.get(h).unwrap(), 7);
        assert!(matches!(streams.get(h), Err(QcastError::InvalidHandle(_))));
        assert!(matches!(tensors.get(h ^ 0x1), Err(QcastError::InvalidHandle(_))));
        assert!(matches!(tensors.get(0), Err(QcastError::InvalidHandle(_))));
    }

    #[test]
    fn test_remove_then_get_fails() {
        let r: Registry<String> = Registry::new(HandleKind::Config);
        let h = r.insert("a".into());
        r.update(h, |s| {
            s.push('b');
            Ok(())
        })
        .unwrap();
        assert_eq!(r.remove(h).unwrap(), "ab");
        assert!(r.get(h).is_err());
        assert!(r.remove(h).is_err());
    }
}
