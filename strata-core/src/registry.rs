//! Close registry
//!
//! An application owns one [`TableRegistry`] and hands it to every table it
//! opens. On shutdown a single [`TableRegistry::close_all`] closes whatever
//! is still open.

use crate::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Something that holds files or locks until closed
pub trait Closeable: Send + Sync {
    fn name(&self) -> &str;

    /// Release every resource. Closing twice is a no-op.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Handle returned by [`TableRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegistrationId(u64);

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    handles: Mutex<BTreeMap<u64, Arc<dyn Closeable>>>,
}

/// Owning registry of open tables; clones share the same entries
#[derive(Clone, Default)]
pub struct TableRegistry {
    inner: Arc<Inner>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: Arc<dyn Closeable>) -> RegistrationId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handles.lock().insert(id, handle);
        RegistrationId(id)
    }

    /// Forget a handle without closing it
    pub fn unregister(&self, id: RegistrationId) -> bool {
        self.inner.handles.lock().remove(&id.0).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered handle, oldest first.
    ///
    /// Every handle is closed even if some fail; the first failure is
    /// returned.
    pub fn close_all(&self) -> Result<()> {
        // Handles unregister themselves while closing
        let handles = std::mem::take(&mut *self.inner.handles.lock());
        let count = handles.len();
        let mut first_error = None;
        for handle in handles.into_values() {
            if let Err(e) = handle.close() {
                warn!("Failed to close {}: {}", handle.name(), e);
                first_error.get_or_insert(e);
            }
        }
        if count > 0 {
            info!("Closed {} registered tables", count);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StrataError;
    use std::sync::atomic::AtomicBool;

    struct Handle {
        name: String,
        closed: AtomicBool,
        fail: bool,
    }

    impl Handle {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                closed: AtomicBool::new(false),
                fail,
            })
        }
    }

    impl Closeable for Handle {
        fn name(&self) -> &str {
            &self.name
        }

        fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            if self.fail {
                return Err(StrataError::Internal("close failed".into()));
            }
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_close_all() {
        let registry = TableRegistry::new();
        let a = Handle::new("a", false);
        let b = Handle::new("b", true);
        let c = Handle::new("c", false);
        registry.register(a.clone());
        registry.register(b.clone());
        let id = registry.register(c.clone());
        assert_eq!(registry.len(), 3);

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));

        assert!(registry.close_all().is_err());
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(!c.is_closed());
        assert!(registry.is_empty());
    }
}
