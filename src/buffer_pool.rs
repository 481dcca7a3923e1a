//! Recycled payload buffers for event intake.
//!
//! Control events carry small payloads (a parameter value, a trigger velocity, a sync counter),
//! so buffers are organised in power-of-two slabs from 16 bytes up to 1 KiB. Each slab keeps a
//! stash of pre-allocated `Vec<u8>`s. A producer leases a buffer sized for its payload, fills it,
//! and freezes it into a [`BufferHandle`]; when the last clone of the handle is dropped (after
//! delivery, eviction or shutdown) the allocation goes back to its slab.
//!
//! Every size class is split into shards and each thread sticks to one shard, so concurrent
//! producers rarely meet on the same slab lock.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;

const MIN_BUFFER_SIZE: usize = 16;
const MAX_BUFFER_SIZE: usize = 1024;
const SIZE_CLASSES: usize = 7;
const SHARDS: usize = 8;
const BUFFERS_PER_SHARD: usize = 16;
/// Slabs never keep more than this many idle buffers; surplus returns are freed.
const MAX_IDLE_PER_SHARD: usize = 256;

struct Slab {
    idle: Mutex<Vec<Vec<u8>>>,
}

/// `SIZE_CLASSES * SHARDS` slabs, indexed by `class * SHARDS + shard`.
static SLABS: OnceLock<Vec<Slab>> = OnceLock::new();
static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) % SHARDS;
}

fn slabs() -> &'static [Slab] {
    SLABS.get_or_init(|| {
        (0..SIZE_CLASSES * SHARDS)
            .map(|idx| {
                let size = MIN_BUFFER_SIZE << (idx / SHARDS);
                let idle = (0..BUFFERS_PER_SHARD).map(|_| vec![0u8; size]).collect();
                Slab {
                    idle: Mutex::new(idle),
                }
            })
            .collect()
    })
}

fn slab_for(size: usize) -> &'static Slab {
    let shard = SHARD.try_with(|shard| *shard).unwrap_or(0);
    &slabs()[class_index(size) * SHARDS + shard]
}

#[inline]
fn size_class_for(len: usize) -> usize {
    len.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE).next_power_of_two()
}

#[inline]
fn class_index(size: usize) -> usize {
    debug_assert!(size.is_power_of_two());
    (size.trailing_zeros() - MIN_BUFFER_SIZE.trailing_zeros()) as usize
}

fn acquire_vec(size: usize) -> Vec<u8> {
    let slab = slab_for(size);
    if let Some(buffer) = slab.idle.lock().pop() {
        return buffer;
    }
    vec![0u8; size]
}

fn release_vec(size: usize, mut buffer: Vec<u8>) {
    buffer.clear();
    buffer.resize(size, 0);
    let mut idle = slab_for(size).idle.lock();
    if idle.len() < MAX_IDLE_PER_SHARD {
        idle.push(buffer);
    }
}

/// Exclusive write access to a pooled buffer before it is frozen into a payload.
pub struct BufferLease {
    size_class: usize,
    data: Option<Vec<u8>>,
}

impl BufferLease {
    /// Mutable view of the whole leased buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.data.as_mut() {
            Some(data) => data.as_mut_slice(),
            None => &mut [],
        }
    }

    /// Convert the lease into a shared handle holding `len` valid bytes.
    pub fn freeze(mut self, len: usize) -> BufferHandle {
        let mut data = self.data.take().unwrap_or_default();
        data.truncate(len.min(data.len()));
        BufferHandle {
            inner: Arc::new(BufferInner {
                size_class: self.size_class,
                data: Some(data),
            }),
        }
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            release_vec(self.size_class, data);
        }
    }
}

#[derive(Debug)]
struct BufferInner {
    size_class: usize,
    data: Option<Vec<u8>>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            release_vec(self.size_class, data);
        }
    }
}

/// Shared, cloneable, read-only handle to a pooled buffer.
#[derive(Clone, Debug)]
pub struct BufferHandle {
    inner: Arc<BufferInner>,
}

impl BufferHandle {
    pub fn as_slice(&self) -> &[u8] {
        self.inner.data.as_deref().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Acquire a buffer able to hold `size_hint` bytes (capped at the largest slab).
pub fn lease(size_hint: usize) -> BufferLease {
    let size = size_class_for(size_hint);
    BufferLease {
        size_class: size,
        data: Some(acquire_vec(size)),
    }
}

/// Copy `bytes` into a pooled buffer and freeze it.
pub fn copy_from(bytes: &[u8]) -> BufferHandle {
    let len = bytes.len().min(MAX_BUFFER_SIZE);
    let mut lease = lease(len);
    lease.as_mut_slice()[..len].copy_from_slice(&bytes[..len]);
    lease.freeze(len)
}

/// Largest payload a single buffer can carry.
pub const fn max_buffer_size() -> usize {
    MAX_BUFFER_SIZE
}
