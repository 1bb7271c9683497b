//! Process-wide pool of fixed-size relay buffers.
//!
//! Every borrow is paired with a return on all exit paths: the pooled buffer
//! is a guard that hands its storage back when dropped. Counters expose the
//! borrow/return balance for tests.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

/// Buffer size for stream relays.
pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;
/// Buffer size for UDP datagrams.
pub const UDP_BUFFER_SIZE: usize = 4096;
/// WebSocket read/write buffer size.
pub const WS_BUFFER_SIZE: usize = 4096;

static GLOBAL: OnceLock<BufferPool> = OnceLock::new();

/// A pool of equally-sized byte buffers.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
    borrows: AtomicUsize,
    returns: AtomicUsize,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buf_size` bytes.
    pub fn new(buf_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buf_size,
            borrows: AtomicUsize::new(0),
            returns: AtomicUsize::new(0),
        }
    }

    /// The shared relay-buffer pool.
    pub fn global() -> &'static BufferPool {
        GLOBAL.get_or_init(|| BufferPool::new(RELAY_BUFFER_SIZE))
    }

    /// Borrow a buffer; it returns to the pool when the guard drops.
    pub fn acquire(&self) -> PooledBuf<'_> {
        self.borrows.fetch_add(1, Ordering::Relaxed);
        let buf = {
            let mut free = self.free.lock().expect("buffer pool poisoned");
            free.pop()
        };
        let buf = buf.unwrap_or_else(|| vec![0u8; self.buf_size]);
        PooledBuf {
            buf: Some(buf),
            pool: self,
        }
    }

    fn release(&self, buf: Vec<u8>) {
        self.returns.fetch_add(1, Ordering::Relaxed);
        let mut free = self.free.lock().expect("buffer pool poisoned");
        free.push(buf);
    }

    /// Current borrow/return counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            borrows: self.borrows.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            idle: self.free.lock().expect("buffer pool poisoned").len(),
        }
    }
}

/// Counters for a buffer pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Buffers handed out since startup.
    pub borrows: usize,
    /// Buffers handed back since startup.
    pub returns: usize,
    /// Buffers currently idle in the pool.
    pub idle: usize,
}

impl PoolStats {
    /// Buffers currently out on loan.
    pub fn outstanding(&self) -> usize {
        self.borrows.saturating_sub(self.returns)
    }
}

/// A borrowed buffer that returns itself to the pool on drop.
pub struct PooledBuf<'a> {
    buf: Option<Vec<u8>>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer already released")
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer already released")
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
