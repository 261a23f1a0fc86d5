use parking_lot::{Mutex, MutexGuard};

/// Key naming a segment within one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(pub u8);

impl SegmentId {
    /// Ids at or above this are rejected by the polling transport.
    pub const LIMIT: u8 = 64;
}

impl core::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A contiguous register range with its own read and write buffers.
///
/// Each buffer sits behind its own lock. Locks are held only for the
/// duration of a closure, so callers never block the polling task for
/// longer than a copy.
pub struct Segment {
    id: SegmentId,
    base: u8,
    write: Mutex<Box<[u8]>>,
    read: Mutex<Box<[u8]>>,
}

impl Segment {
    pub(crate) fn new(id: SegmentId, base: u8, len: usize) -> Self {
        Self {
            id,
            base,
            write: Mutex::new(vec![0u8; len].into_boxed_slice()),
            read: Mutex::new(vec![0u8; len].into_boxed_slice()),
        }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn base(&self) -> u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.write.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` on the write buffer under the write lock.
    pub fn with_write_buffer<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.write.lock();
        f(&mut guard[..])
    }

    /// Runs `f` on the read buffer under the read lock.
    pub fn with_read_buffer<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.read.lock();
        f(&guard[..])
    }

    /// Holds the write lock until the guard drops. Prefer
    /// [`Segment::with_write_buffer`] unless the lock must span several steps.
    pub fn lock_write(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.write.lock()
    }

    /// Holds the read lock until the guard drops.
    pub fn lock_read(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.read.lock()
    }

    pub(crate) fn snapshot_write(&self) -> Vec<u8> {
        self.write.lock().to_vec()
    }

    pub(crate) fn store_read(&self, bytes: &[u8]) {
        let mut guard = self.read.lock();
        let n = guard.len().min(bytes.len());
        guard[..n].copy_from_slice(&bytes[..n]);
    }
}

impl core::fmt::Debug for Segment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}
