//! Reference-counted frame ring shared between the capture thread and consumers

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, TryLockError};
use std::time::Instant;

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use tracing::debug;

use crate::capture::frame::{FrameFormat, FrameInfo};
use crate::error::{CaptureError, Result};

/// Fewest slots that still let a consumer hold one frame while the next is written
pub const MIN_SLOTS: usize = 2;

/// Preallocated ring of `K` frame buffers.
///
/// Every write goes to a slot that no live [`FrameHandle`] points at, so a
/// published frame's bytes never change under a reader. When consumers hold
/// every slot, the one with the oldest frame is taken back and handles to it
/// report [`CaptureError::StaleFrame`] from then on. A single producer thread
/// is assumed; writes never block and never allocate.
pub struct FrameRing {
    shared: Arc<RingShared>,
    /// Slot the next search starts from
    cursor: AtomicUsize,
    /// Last sequence number handed out
    sequence: AtomicU64,
}

struct RingShared {
    format: FrameFormat,
    slots: Box<[Slot]>,
    stats: CachePadded<Stats>,
}

struct Slot {
    frame: RwLock<SlotFrame>,
    /// Live handles to this slot, stale ones included
    refs: AtomicUsize,
    /// Sequence currently stored, 0 while the slot has never been written
    published: AtomicU64,
}

struct SlotFrame {
    sequence: u64,
    bytes: Box<[u8]>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_dropped: AtomicU64,
    slots_recycled: AtomicU64,
    format_mismatches: AtomicU64,
}

/// Snapshot of ring counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub slots_recycled: u64,
    pub format_mismatches: u64,
}

impl FrameRing {
    pub fn new(format: FrameFormat, slot_count: usize) -> Self {
        let slot_count = slot_count.max(MIN_SLOTS);
        let frame_len = format.frame_len();

        // All pixel memory is allocated here, never on the write path
        let slots = (0..slot_count)
            .map(|_| Slot {
                frame: RwLock::new(SlotFrame {
                    sequence: 0,
                    bytes: vec![0u8; frame_len].into_boxed_slice(),
                }),
                refs: AtomicUsize::new(0),
                published: AtomicU64::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        debug!(
            "Frame ring allocated: {} slots x {} bytes ({})",
            slot_count, frame_len, format
        );

        Self {
            shared: Arc::new(RingShared {
                format,
                slots,
                stats: CachePadded::new(Stats::default()),
            }),
            cursor: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn format(&self) -> FrameFormat {
        self.shared.format
    }

    pub fn slot_count(&self) -> usize {
        self.shared.slots.len()
    }

    /// Producer: copy one raw frame into a free slot
    pub fn write(&self, data: &[u8]) -> Result<FrameHandle> {
        self.write_at(data, Instant::now())
    }

    /// Producer: like [`write`](Self::write) with an explicit capture time
    pub fn write_at(&self, data: &[u8], captured_at: Instant) -> Result<FrameHandle> {
        let stats = &self.shared.stats;
        let expected = self.shared.format.frame_len();
        if data.len() != expected {
            stats.format_mismatches.fetch_add(1, Ordering::Relaxed);
            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(CaptureError::FormatMismatch {
                expected,
                actual: data.len(),
            });
        }

        let (index, recycled) = self.select_slot();
        let slot = &self.shared.slots[index];

        let mut frame = match slot.frame.try_write() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                // A consumer is reading the oldest frame right now
                stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                return Err(CaptureError::SlotBusy);
            }
        };

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        frame.bytes.copy_from_slice(data);
        frame.sequence = sequence;
        slot.published.store(sequence, Ordering::Release);
        slot.refs.fetch_add(1, Ordering::AcqRel);
        drop(frame);

        self.cursor
            .store((index + 1) % self.shared.slots.len(), Ordering::Relaxed);
        stats.frames_written.fetch_add(1, Ordering::Relaxed);
        if recycled {
            stats.slots_recycled.fetch_add(1, Ordering::Relaxed);
            debug!("All ring slots referenced, recycled slot {} for frame {}", index, sequence);
        }

        Ok(FrameHandle {
            ring: Arc::clone(&self.shared),
            slot: index,
            info: FrameInfo {
                sequence,
                captured_at,
            },
        })
    }

    /// First unreferenced slot from the cursor on, else the slot holding the oldest frame.
    fn select_slot(&self) -> (usize, bool) {
        let slots = &self.shared.slots;
        let start = self.cursor.load(Ordering::Relaxed);

        for offset in 0..slots.len() {
            let index = (start + offset) % slots.len();
            if slots[index].refs.load(Ordering::Acquire) == 0 {
                return (index, false);
            }
        }

        let oldest = slots
            .iter()
            .enumerate()
            .min_by_key(|(_, slot)| slot.published.load(Ordering::Acquire))
            .map(|(index, _)| index)
            .unwrap_or(0);
        (oldest, true)
    }

    pub fn stats(&self) -> RingStats {
        let stats = &self.shared.stats;
        RingStats {
            frames_written: stats.frames_written.load(Ordering::Relaxed),
            frames_dropped: stats.frames_dropped.load(Ordering::Relaxed),
            slots_recycled: stats.slots_recycled.load(Ordering::Relaxed),
            format_mismatches: stats.format_mismatches.load(Ordering::Relaxed),
        }
    }

    /// Count a frame the producer gave up on before reaching the ring
    pub fn record_drop(&self) {
        self.shared
            .stats
            .frames_dropped
            .fetch_add(1, Ordering::Relaxed);
    }
}

/// Immutable, reference-counted view of one published frame.
///
/// Cloning is cheap and keeps the ring slot reserved. The pixels stay
/// bit-identical to what was written for as long as [`data`](Self::data)
/// succeeds.
pub struct FrameHandle {
    ring: Arc<RingShared>,
    slot: usize,
    info: FrameInfo,
}

impl FrameHandle {
    pub fn format(&self) -> FrameFormat {
        self.ring.format
    }

    pub fn sequence(&self) -> u64 {
        self.info.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.info.captured_at
    }

    pub fn info(&self) -> FrameInfo {
        self.info
    }

    /// Borrow the pixels. Fails once the slot has been recycled for a newer frame.
    ///
    /// The returned guard holds the slot's read lock. The producer never waits
    /// on it: if it needs this slot while the guard is alive, it drops the new
    /// frame instead (`SlotBusy`). Keep the guard short-lived, or use
    /// [`to_bytes`](Self::to_bytes) for pixels that must outlive the callback.
    pub fn data(&self) -> Result<FrameData<'_>> {
        let slot = &self.ring.slots[self.slot];
        let guard = match slot.frame.try_read() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            // Only the producer takes the write lock, and only to overwrite
            Err(TryLockError::WouldBlock) => {
                return Err(CaptureError::StaleFrame {
                    sequence: self.info.sequence,
                })
            }
        };

        if guard.sequence != self.info.sequence {
            return Err(CaptureError::StaleFrame {
                sequence: self.info.sequence,
            });
        }
        Ok(FrameData { guard })
    }

    pub fn is_valid(&self) -> bool {
        self.ring.slots[self.slot].published.load(Ordering::Acquire) == self.info.sequence
    }

    /// Owned copy of the pixels for hosts that build their own image types.
    ///
    /// The copy is taken under the slot's read lock, so for its duration a
    /// producer that must recycle this slot drops its frame rather than block.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let data = self.data()?;
        Ok(Bytes::copy_from_slice(&data))
    }
}

impl Clone for FrameHandle {
    fn clone(&self) -> Self {
        self.ring.slots[self.slot].refs.fetch_add(1, Ordering::AcqRel);
        Self {
            ring: Arc::clone(&self.ring),
            slot: self.slot,
            info: self.info,
        }
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        self.ring.slots[self.slot].refs.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHandle")
            .field("sequence", &self.info.sequence)
            .field("slot", &self.slot)
            .field("format", &self.ring.format)
            .finish()
    }
}

/// Read guard over a frame's pixels. While it lives, the slot cannot be
/// recycled and new frames that would need it are dropped.
pub struct FrameData<'a> {
    guard: RwLockReadGuard<'a, SlotFrame>,
}

impl Deref for FrameData<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard.bytes
    }
}
