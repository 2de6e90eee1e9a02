//! Bounded SPSC handoff between the socket reader and the bus drainer.
//!
//! A transient slowdown in publishing must not stall the socket reader and
//! get the session disconnected by the exchange, so the reader pushes into a
//! fixed ring and sheds the newest frame when the ring is full. Fullness
//! means a sustained downstream problem; dropping the incoming frame keeps
//! the older in-flight data intact and shows up on the drop counter.
//!
//! # Synchronization
//!
//! Unbounded `u64` sequence numbers for head and tail (slot index is
//! `seq & mask`), so wrap-around never aliases. The producer writes only
//! `tail`, the consumer writes only `head`; each side reads the other's
//! index with `Acquire` and publishes its own with `Release`, and each
//! keeps a private cached copy of the opposite index so the hot path mostly
//! avoids cross-core traffic. No locks anywhere, and neither operation ever
//! suspends.
//!
//! Slot storage is an anonymous memory map; `Frame` values are moved in and
//! out with `ptr::write`/`ptr::read`, so the payload buffer itself is never
//! copied — ownership transfers through the ring.

use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::MmapMut;

use crate::frame::Frame;

/// Default slot count; at the 4 KiB payload ceiling this is ~4 MiB of queue.
pub const DEFAULT_CAPACITY: usize = 1024;

#[repr(align(64))]
struct CacheAligned<T>(T);

/// Shared counters, readable by the admin endpoint while the ring runs.
#[derive(Debug, Default)]
pub struct RingStats {
    pushed: AtomicU64,
    popped: AtomicU64,
    dropped: AtomicU64,
}

impl RingStats {
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn popped(&self) -> u64 {
        self.popped.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Shared {
    /// Anonymous mapping holding `capacity` slots of `MaybeUninit<Frame>`.
    buf: MmapMut,
    mask: u64,
    capacity: u64,
    /// Next sequence the consumer will read. Written by consumer only.
    head: CacheAligned<AtomicU64>,
    /// Next sequence the producer will write. Written by producer only.
    tail: CacheAligned<AtomicU64>,
    closed: AtomicBool,
    stats: Arc<RingStats>,
}

// Slots are only ever touched by the side that owns them under the
// head/tail protocol; Frame is Send.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    #[inline]
    fn slot(&self, seq: u64) -> *mut MaybeUninit<Frame> {
        let idx = (seq & self.mask) as usize;
        unsafe { (self.buf.as_ptr() as *mut MaybeUninit<Frame>).add(idx) }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Both handles are gone; drop whatever frames are still queued.
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Relaxed);
        for seq in head..tail {
            unsafe { ptr::drop_in_place((*self.slot(seq)).as_mut_ptr()) };
        }
    }
}

/// Producer half. Owned by the socket reader; not clonable.
pub struct Producer {
    shared: Arc<Shared>,
    cached_head: u64,
}

/// Consumer half. Owned by the bus drainer; not clonable.
pub struct Consumer {
    shared: Arc<Shared>,
    cached_tail: u64,
}

/// Creates an SPSC ring with `capacity` slots (rounded up to a power of two).
pub fn ring(capacity: usize) -> (Producer, Consumer) {
    let capacity = capacity.max(2).next_power_of_two();
    let bytes = capacity * std::mem::size_of::<MaybeUninit<Frame>>();
    let buf = MmapMut::map_anon(bytes).expect("anonymous mmap for ring slots");

    let shared = Arc::new(Shared {
        buf,
        mask: (capacity - 1) as u64,
        capacity: capacity as u64,
        head: CacheAligned(AtomicU64::new(0)),
        tail: CacheAligned(AtomicU64::new(0)),
        closed: AtomicBool::new(false),
        stats: Arc::new(RingStats::default()),
    });

    (
        Producer {
            shared: Arc::clone(&shared),
            cached_head: 0,
        },
        Consumer {
            shared,
            cached_tail: 0,
        },
    )
}

impl Producer {
    /// Non-blocking push. On a full ring the frame comes back to the caller
    /// and the drop counter has already been incremented.
    #[inline]
    pub fn push(&mut self, frame: Frame) -> Result<(), Frame> {
        let shared = &*self.shared;
        let tail = shared.tail.0.load(Ordering::Relaxed);

        if tail - self.cached_head >= shared.capacity {
            self.cached_head = shared.head.0.load(Ordering::Acquire);
            if tail - self.cached_head >= shared.capacity {
                shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(frame);
            }
        }

        unsafe { ptr::write(shared.slot(tail), MaybeUninit::new(frame)) };
        shared.tail.0.store(tail + 1, Ordering::Release);
        shared.stats.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Marks the ring closed. The consumer drains what remains and then sees
    /// `is_disconnected`.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> Arc<RingStats> {
        Arc::clone(&self.shared.stats)
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.close();
    }
}

impl Consumer {
    /// Non-blocking pop.
    #[inline]
    pub fn pop(&mut self) -> Option<Frame> {
        let shared = &*self.shared;
        let head = shared.head.0.load(Ordering::Relaxed);

        if head == self.cached_tail {
            self.cached_tail = shared.tail.0.load(Ordering::Acquire);
            if head == self.cached_tail {
                return None;
            }
        }

        let frame = unsafe { ptr::read(shared.slot(head)).assume_init() };
        shared.head.0.store(head + 1, Ordering::Release);
        shared.stats.popped.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// True once the producer has closed the ring, whether or not frames
    /// remain queued. Shutdown drains run against a bounded deadline from
    /// the moment this turns true.
    pub fn is_closing(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// True once the producer has closed the ring and everything queued has
    /// been popped.
    pub fn is_disconnected(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
            && self.shared.head.0.load(Ordering::Relaxed)
                == self.shared.tail.0.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Arc<RingStats> {
        Arc::clone(&self.shared.stats)
    }
}

/// Adaptive backoff for the drain loop: spin briefly, then yield, then park
/// for short sleeps. Resets whenever work arrives.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;

    pub fn reset(&mut self) {
        self.step = 0;
    }

    pub async fn idle(&mut self) {
        if self.step < Self::SPIN_LIMIT {
            for _ in 0..(1 << self.step) {
                std::hint::spin_loop();
            }
        } else if self.step < Self::YIELD_LIMIT {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(std::time::Duration::from_micros(200)).await;
        }
        self.step = (self.step + 1).min(Self::YIELD_LIMIT);
    }
}
