// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{Arc, Mutex};

/// Initial number of buffers kept by a fresh pool
pub const INITIAL_POOL_SIZE: usize = 12;

/// A per-compaction pool of reusable read buffers
///
/// Compaction reads draw from this pool instead of the shared block cache
/// so that one-shot reads do not pollute hot cache entries. The pool grows
/// to the compaction's working-set size and then recycles.
#[derive(Clone)]
pub struct BufferPool(Arc<Mutex<Vec<Vec<u8>>>>);

impl Default for BufferPool {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(
            (0..INITIAL_POOL_SIZE).map(|_| Vec::new()).collect(),
        )))
    }
}

impl BufferPool {
    /// Takes a buffer out of the pool, allocating a fresh one if drained.
    #[must_use]
    pub fn checkout(&self) -> PooledBuffer {
        let buf = self
            .0
            .lock()
            .expect("lock is poisoned")
            .pop()
            .unwrap_or_default();

        PooledBuffer {
            pool: self.clone(),
            buf,
        }
    }

    fn checkin(&self, mut buf: Vec<u8>) {
        buf.clear();
        self.0.lock().expect("lock is poisoned").push(buf);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().expect("lock is poisoned").len()
    }
}

/// A buffer checked out of a [`BufferPool`]; returns itself on drop
pub struct PooledBuffer {
    pool: BufferPool,
    buf: Vec<u8>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.checkin(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn buffer_pool_recycles() {
        let pool = BufferPool::default();
        assert_eq!(INITIAL_POOL_SIZE, pool.len());

        {
            let mut a = pool.checkout();
            a.extend_from_slice(b"hello");
            assert_eq!(INITIAL_POOL_SIZE - 1, pool.len());
        }

        // buffer returned, cleared
        assert_eq!(INITIAL_POOL_SIZE, pool.len());
        assert!(pool.checkout().is_empty());
    }

    #[test]
    fn buffer_pool_grows() {
        let pool = BufferPool::default();

        let held = (0..INITIAL_POOL_SIZE + 3)
            .map(|_| pool.checkout())
            .collect::<Vec<_>>();
        assert_eq!(0, pool.len());

        drop(held);
        assert_eq!(INITIAL_POOL_SIZE + 3, pool.len());
    }
}
