//! Buffer and object pools for the per-message hot path.
//!
//! Pools hand out values by move: a buffer or message checked out with `get`
//! belongs to the caller until it is moved back with `put`, so a value can
//! never be handed to two owners or used after it was returned.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::messages::{ClientMessage, ForwardMessage, Message, RpcRequest, RpcResponse};

/// Size classes of [`BufferPool`], smallest first.
pub const BUFFER_SIZES: [usize; 7] = [
    256,
    1024,
    4 * 1024,
    16 * 1024,
    64 * 1024,
    256 * 1024,
    1024 * 1024,
];

/// Idle values kept per size class / object pool before extras are dropped.
pub const DEFAULT_MAX_IDLE: usize = 256;

/// Restores a pooled value to its empty state while keeping allocations.
pub trait Reset {
    fn reset(&mut self);
}

// ---------------------------------------------------------------------------
// Byte buffers
// ---------------------------------------------------------------------------

/// Tiered pool of `Vec<u8>` buffers.
pub struct BufferPool {
    classes: [Mutex<Vec<Vec<u8>>>; BUFFER_SIZES.len()],
    max_idle: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_max_idle(DEFAULT_MAX_IDLE)
    }

    pub fn with_max_idle(max_idle: usize) -> Self {
        Self {
            classes: std::array::from_fn(|_| Mutex::new(Vec::new())),
            max_idle,
        }
    }

    /// Check out a zero-filled buffer with `len() == size`.
    ///
    /// Served from the smallest class that fits; sizes above the largest
    /// class are allocated directly.
    pub fn get(&self, size: usize) -> Vec<u8> {
        let mut buf = self.get_empty(size);
        buf.resize(size, 0);
        buf
    }

    /// Check out an empty buffer with room for at least `capacity` bytes.
    pub fn get_empty(&self, capacity: usize) -> Vec<u8> {
        let Some(class) = class_for_request(capacity) else {
            return Vec::with_capacity(capacity);
        };
        match self.classes[class].lock().pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(BUFFER_SIZES[class]),
        }
    }

    /// Return a buffer.
    ///
    /// Filed under the largest class `c` with `capacity / 2 <= c <= capacity`,
    /// so every buffer in a class can hold that class's size. Buffers that
    /// match no class, or arrive when the class is full, are dropped.
    pub fn put(&self, buf: Vec<u8>) {
        let Some(class) = class_for_return(buf.capacity()) else {
            return;
        };
        let mut idle = self.classes[class].lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }

    /// Number of idle buffers held for the class of exactly `class_size` bytes.
    pub fn idle(&self, class_size: usize) -> usize {
        BUFFER_SIZES
            .iter()
            .position(|&s| s == class_size)
            .map_or(0, |i| self.classes[i].lock().len())
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

fn class_for_request(size: usize) -> Option<usize> {
    BUFFER_SIZES.iter().position(|&s| s >= size)
}

fn class_for_return(capacity: usize) -> Option<usize> {
    BUFFER_SIZES
        .iter()
        .rposition(|&s| s <= capacity && s >= capacity / 2)
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// Free list of resettable values.
pub struct ObjectPool<T> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
}

impl<T: Reset + Default> ObjectPool<T> {
    pub fn new() -> Self {
        Self::with_max_idle(DEFAULT_MAX_IDLE)
    }

    pub fn with_max_idle(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Check out a value in its reset state.
    pub fn get(&self) -> T {
        self.idle.lock().pop().unwrap_or_default()
    }

    /// Reset `value` and keep it for reuse.
    pub fn put(&self, mut value: T) {
        value.reset();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(value);
        }
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

impl<T: Reset + Default> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// Every pool the transport uses, cheap to clone and share between components.
#[derive(Clone)]
pub struct Pools {
    pub buffers: Arc<BufferPool>,
    pub messages: Arc<ObjectPool<Message>>,
    pub rpc_requests: Arc<ObjectPool<RpcRequest>>,
    pub rpc_responses: Arc<ObjectPool<RpcResponse>>,
    pub client_messages: Arc<ObjectPool<ClientMessage>>,
    pub forward_messages: Arc<ObjectPool<ForwardMessage>>,
}

impl Pools {
    /// A fresh, unshared set of pools.
    pub fn new() -> Self {
        Self {
            buffers: Arc::new(BufferPool::new()),
            messages: Arc::new(ObjectPool::new()),
            rpc_requests: Arc::new(ObjectPool::new()),
            rpc_responses: Arc::new(ObjectPool::new()),
            client_messages: Arc::new(ObjectPool::new()),
            forward_messages: Arc::new(ObjectPool::new()),
        }
    }

    /// The process-wide default set.
    pub fn shared() -> Self {
        static SHARED: OnceLock<Pools> = OnceLock::new();
        SHARED.get_or_init(Pools::new).clone()
    }

    /// Build a pooled message around `payload`.
    pub fn message(&self, msg_type: u8, payload: Vec<u8>) -> Message {
        let mut msg = self.messages.get();
        msg.msg_type = msg_type;
        msg.payload = payload;
        msg
    }

    /// Hand a message's payload back to the buffer pool and its shell back to
    /// the message pool.
    pub fn recycle(&self, mut msg: Message) {
        let payload = std::mem::take(&mut msg.payload);
        self.buffers.put(payload);
        self.messages.put(msg);
    }
}

impl Default for Pools {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_requested_length() {
        let pool = BufferPool::new();
        for size in [0, 1, 255, 256, 257, 5000, 2 * 1024 * 1024] {
            let buf = pool.get(size);
            assert_eq!(buf.len(), size);
            assert!(buf.capacity() >= size);
        }
    }

    #[test]
    fn test_get_uses_smallest_fitting_class() {
        let pool = BufferPool::new();
        assert_eq!(pool.get(100).capacity(), 256);
        assert_eq!(pool.get(1000).capacity(), 1024);
        assert_eq!(pool.get(1025).capacity(), 4096);
    }

    #[test]
    fn test_oversized_request_is_not_pooled() {
        let pool = BufferPool::new();
        let buf = pool.get(4 * 1024 * 1024);
        pool.put(buf);
        assert_eq!(pool.idle(1024 * 1024), 0);
    }

    #[test]
    fn test_returned_buffer_is_reused() {
        let pool = BufferPool::new();
        let buf = pool.get(3000);
        let ptr = buf.as_ptr();
        pool.put(buf);
        assert_eq!(pool.idle(4096), 1);

        let again = pool.get(4000);
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(again.len(), 4000);
        assert!(again.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_no_double_checkout() {
        let pool = BufferPool::new();
        pool.put(pool.get(512));

        let a = pool.get(512);
        let b = pool.get(512);
        assert_ne!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn test_concurrent_gets_never_share_a_buffer() {
        use std::collections::HashSet;

        let pool = Arc::new(BufferPool::new());
        let held = Arc::new(Mutex::new(HashSet::new()));

        std::thread::scope(|s| {
            for _ in 0..8 {
                let (pool, held) = (pool.clone(), held.clone());
                s.spawn(move || {
                    for i in 0..2000 {
                        let buf = pool.get(300 + i % 700);
                        let ptr = buf.as_ptr() as usize;
                        assert!(held.lock().insert(ptr), "buffer {ptr:#x} checked out twice");
                        std::thread::yield_now();
                        held.lock().remove(&ptr);
                        pool.put(buf);
                    }
                });
            }
        });
        assert!(held.lock().is_empty());
        assert!(pool.idle(1024) > 0);
    }

    #[test]
    fn test_put_files_under_largest_fitting_class() {
        let pool = BufferPool::new();
        pool.put(Vec::with_capacity(3000));
        assert_eq!(pool.idle(1024), 0);
        assert_eq!(pool.idle(4096), 0);

        // 6000 bytes: 4096 is within [3000, 6000]
        pool.put(Vec::with_capacity(6000));
        assert_eq!(pool.idle(4096), 1);
        assert!(pool.get(4096).capacity() >= 4096);
    }

    #[test]
    fn test_tiny_buffers_are_dropped() {
        let pool = BufferPool::new();
        pool.put(Vec::with_capacity(64));
        assert!(BUFFER_SIZES.iter().all(|&s| pool.idle(s) == 0));
    }

    #[test]
    fn test_idle_count_is_bounded() {
        let pool = BufferPool::with_max_idle(2);
        for _ in 0..5 {
            pool.put(Vec::with_capacity(256));
        }
        assert_eq!(pool.idle(256), 2);
    }

    #[test]
    fn test_object_pool_resets_on_put() {
        let pool: ObjectPool<ClientMessage> = ObjectPool::new();
        let mut msg = pool.get();
        msg.msg_id = 42;
        msg.data.extend_from_slice(b"payload");
        pool.put(msg);

        let msg = pool.get();
        assert_eq!(msg, ClientMessage::default());
        assert!(msg.data.capacity() >= 7);
    }

    #[test]
    fn test_recycle_returns_payload_and_shell() {
        let pools = Pools::new();
        let payload = pools.buffers.get(300);
        let msg = pools.message(0x02, payload);
        pools.recycle(msg);

        assert_eq!(pools.messages.idle(), 1);
        assert_eq!(pools.buffers.idle(1024), 1);
        assert_eq!(pools.messages.get(), Message::default());
    }

    #[test]
    fn test_shared_pools_are_one_instance() {
        let a = Pools::shared();
        let b = Pools::shared();
        assert!(Arc::ptr_eq(&a.buffers, &b.buffers));
        assert!(!Arc::ptr_eq(&a.buffers, &Pools::new().buffers));
    }
}
