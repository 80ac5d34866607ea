//! A fixed set of reusable CASes over one shared type system.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use casgraph_types::TypeSystem;
use parking_lot::{Condvar, Mutex};

use crate::cas::Cas;
use crate::config::CasConfig;
use crate::error::Result;

#[derive(Debug)]
struct Shared {
    free: Mutex<Vec<Cas>>,
    returned: Condvar,
}

/// Hands out CASes to worker threads; each is reset when it comes back.
#[derive(Debug, Clone)]
pub struct CasPool {
    shared: Arc<Shared>,
    size: usize,
}

impl CasPool {
    pub fn new(ts: Arc<TypeSystem>, size: usize, config: CasConfig) -> Result<Self> {
        let free = (0..size)
            .map(|_| Cas::with_config(Arc::clone(&ts), config.clone()))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(size, "created cas pool");
        Ok(Self {
            shared: Arc::new(Shared {
                free: Mutex::new(free),
                returned: Condvar::new(),
            }),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of CASes not checked out right now.
    pub fn available(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Take a CAS, waiting until one is returned if all are in use.
    pub fn checkout(&self) -> CasGuard {
        let mut free = self.shared.free.lock();
        loop {
            if let Some(cas) = free.pop() {
                return CasGuard {
                    cas: Some(cas),
                    shared: Arc::clone(&self.shared),
                };
            }
            self.shared.returned.wait(&mut free);
        }
    }

    pub fn try_checkout(&self) -> Option<CasGuard> {
        let cas = self.shared.free.lock().pop()?;
        Some(CasGuard {
            cas: Some(cas),
            shared: Arc::clone(&self.shared),
        })
    }
}

/// A checked-out CAS. Dropping it resets the CAS and returns it to the pool.
#[derive(Debug)]
pub struct CasGuard {
    cas: Option<Cas>,
    shared: Arc<Shared>,
}

impl Deref for CasGuard {
    type Target = Cas;

    fn deref(&self) -> &Cas {
        self.cas.as_ref().unwrap_or_else(|| unreachable!("guard holds its cas until drop"))
    }
}

impl DerefMut for CasGuard {
    fn deref_mut(&mut self) -> &mut Cas {
        self.cas.as_mut().unwrap_or_else(|| unreachable!("guard holds its cas until drop"))
    }
}

impl Drop for CasGuard {
    fn drop(&mut self) {
        if let Some(mut cas) = self.cas.take() {
            cas.reset();
            self.shared.free.lock().push(cas);
            self.shared.returned.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casgraph_types::TypeSystemBuilder;

    #[test]
    fn returned_cas_is_reset() {
        let ts = TypeSystemBuilder::new().commit().unwrap();
        let pool = CasPool::new(ts, 1, CasConfig::default()).unwrap();
        {
            let mut cas = pool.checkout();
            let view = cas.initial_view();
            cas.set_document_text(view, "first").unwrap();
            assert!(pool.try_checkout().is_none());
        }
        assert_eq!(pool.available(), 1);
        let cas = pool.checkout();
        assert_eq!(cas.document_text(cas.initial_view()).unwrap(), None);
        assert_eq!(cas.generation(), 1);
    }
}
