//! Bounded pool of reusable frame buffers and the decoder input queue.
//!
//! A [`BufferRef`] is exclusively owned while it is being filled; pushing
//! it into a [`FrameQueue`] transfers ownership to the decoder side, and
//! dropping it anywhere returns the storage to its pool. Buffers can
//! therefore never leak: every acquired buffer ends up either queued or
//! back in the pool.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use rp_common::{AccessUnitInfo, PlaybackError};

/// Cap on the user-data side region, to bound a malformed SEI.
const MAX_USERDATA_CAPACITY: usize = 1 << 20;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct BufferStorage {
    data: Vec<u8>,
    len: usize,
    userdata: Vec<u8>,
    userdata_len: usize,
    au_info: Option<AccessUnitInfo>,
    locked: bool,
}

impl BufferStorage {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            len: 0,
            userdata: Vec::new(),
            userdata_len: 0,
            au_info: None,
            locked: false,
        }
    }

    fn reset(&mut self) {
        self.len = 0;
        self.userdata_len = 0;
        self.au_info = None;
        self.locked = false;
    }
}

struct PoolShared {
    id: u64,
    free: Mutex<Vec<BufferStorage>>,
    returned: Condvar,
    capacity: usize,
}

/// Fixed-size pool of frame buffers, shared with the decoder.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a pool of `count` buffers of `buffer_size` bytes each.
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let free = (0..count).map(|_| BufferStorage::new(buffer_size)).collect();
        trace!(pool = id, count, buffer_size, "buffer pool created");
        Self {
            shared: Arc::new(PoolShared {
                id,
                free: Mutex::new(free),
                returned: Condvar::new(),
                capacity: count,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Total number of buffers owned by the pool.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of buffers currently available.
    pub fn available(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Take a buffer from the pool.
    ///
    /// Non-blocking acquisition fails with [`PlaybackError::WouldBlock`]
    /// when the pool is empty; blocking acquisition waits for a release.
    /// The scheduler only ever uses the non-blocking form.
    pub fn acquire(&self, blocking: bool) -> Result<BufferRef, PlaybackError> {
        let mut free = self.shared.free.lock();
        loop {
            if let Some(mut storage) = free.pop() {
                storage.reset();
                return Ok(BufferRef {
                    storage: Some(storage),
                    pool: Arc::clone(&self.shared),
                });
            }
            if !blocking {
                return Err(PlaybackError::WouldBlock);
            }
            self.shared.returned.wait(&mut free);
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.shared.id)
            .field("capacity", &self.shared.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// Exclusive handle on one pool buffer.
pub struct BufferRef {
    storage: Option<BufferStorage>,
    pool: Arc<PoolShared>,
}

impl BufferRef {
    fn storage(&self) -> &BufferStorage {
        self.storage.as_ref().expect("live buffer has storage")
    }

    fn storage_mut(&mut self) -> &mut BufferStorage {
        self.storage.as_mut().expect("live buffer has storage")
    }

    /// Pool the buffer came from (queues check this before accepting it).
    pub fn pool_id(&self) -> u64 {
        self.pool.id
    }

    /// Payload capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.storage().data.len()
    }

    /// The written portion of the payload.
    pub fn payload(&self) -> &[u8] {
        let storage = self.storage();
        &storage.data[..storage.len]
    }

    /// Full-capacity mutable payload; fails once the buffer is locked.
    pub fn payload_mut(&mut self) -> Result<&mut [u8], PlaybackError> {
        let storage = self.storage_mut();
        if storage.locked {
            return Err(PlaybackError::InvalidArgument(
                "buffer is write-locked".to_string(),
            ));
        }
        Ok(&mut storage.data)
    }

    /// Declare how many payload bytes are valid.
    pub fn set_len(&mut self, len: usize) -> Result<(), PlaybackError> {
        if len > self.capacity() {
            return Err(PlaybackError::InvalidArgument(format!(
                "len {len} exceeds capacity {}",
                self.capacity()
            )));
        }
        let storage = self.storage_mut();
        if storage.locked {
            return Err(PlaybackError::InvalidArgument(
                "buffer is write-locked".to_string(),
            ));
        }
        storage.len = len;
        Ok(())
    }

    /// The written portion of the user-data side region.
    pub fn userdata(&self) -> &[u8] {
        let storage = self.storage();
        &storage.userdata[..storage.userdata_len]
    }

    /// Replace the user-data region contents, growing capacity as needed.
    pub fn set_userdata(&mut self, data: &[u8]) -> Result<(), PlaybackError> {
        if data.len() > MAX_USERDATA_CAPACITY {
            return Err(PlaybackError::OutOfMemory(format!(
                "user data of {} bytes exceeds the {MAX_USERDATA_CAPACITY} byte cap",
                data.len()
            )));
        }
        let storage = self.storage_mut();
        if storage.userdata.len() < data.len() {
            storage.userdata.resize(data.len(), 0);
        }
        storage.userdata[..data.len()].copy_from_slice(data);
        storage.userdata_len = data.len();
        Ok(())
    }

    /// Drop any previously attached user data.
    pub fn clear_userdata(&mut self) {
        self.storage_mut().userdata_len = 0;
    }

    /// Attach the access-unit descriptor.
    pub fn set_au_info(&mut self, info: AccessUnitInfo) {
        self.storage_mut().au_info = Some(info);
    }

    pub fn au_info(&self) -> Option<&AccessUnitInfo> {
        self.storage().au_info.as_ref()
    }

    /// Freeze the payload for submission.
    pub fn write_lock(&mut self) {
        self.storage_mut().locked = true;
    }

    /// Release the write lock (consumer side, or when a submission is
    /// rolled back).
    pub fn unlock(&mut self) {
        self.storage_mut().locked = false;
    }
}

impl Drop for BufferRef {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            self.pool.free.lock().push(storage);
            self.pool.returned.notify_one();
        }
    }
}

impl fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let storage = self.storage();
        f.debug_struct("BufferRef")
            .field("pool", &self.pool.id)
            .field("len", &storage.len)
            .field("locked", &storage.locked)
            .finish()
    }
}

/// A queue push the queue refused; hands the buffer back to the caller.
#[derive(Debug)]
pub struct QueueRejected {
    pub buffer: BufferRef,
    pub reason: PlaybackError,
}

/// Input queue of a decoder, bound to the pool its buffers come from.
#[derive(Clone)]
pub struct FrameQueue {
    pool_id: u64,
    tx: Sender<BufferRef>,
    rx: Receiver<BufferRef>,
}

impl FrameQueue {
    /// Create a queue accepting buffers of `pool` only.
    pub fn new(pool: &BufferPool) -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            pool_id: pool.id(),
            tx,
            rx,
        }
    }

    /// Transfer a buffer to the decoder side.
    ///
    /// A buffer from another pool is refused with
    /// [`PlaybackError::WrongPool`] and returned to the caller.
    pub fn push(&self, buffer: BufferRef) -> Result<(), QueueRejected> {
        if buffer.pool_id() != self.pool_id {
            return Err(QueueRejected {
                buffer,
                reason: PlaybackError::WrongPool,
            });
        }
        match self.tx.send(buffer) {
            Ok(()) => Ok(()),
            Err(e) => Err(QueueRejected {
                buffer: e.into_inner(),
                reason: PlaybackError::Decoder("input queue closed".to_string()),
            }),
        }
    }

    /// Take the next queued buffer (decoder side).
    pub fn try_pop(&self) -> Option<BufferRef> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
