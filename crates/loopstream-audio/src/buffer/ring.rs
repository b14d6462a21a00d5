//! Lock-free ring queue for passing messages between the control thread and
//! the audio callback.
//!
//! This queue is designed for single-producer, single-consumer scenarios.
//! The two ends are separate handles so each side can only do its own half.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Lock-free single-producer, single-consumer queue of owned values.
///
/// Storage is allocated once up front. Neither `push` nor `pop` allocates,
/// locks, or blocks, so both ends are safe to use from a real-time callback.
pub struct SpscQueue<T> {
    /// Slot storage. Slots between `read_pos` and `write_pos` are initialized.
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Next slot to read.
    read_pos: AtomicUsize,
    /// Next slot to write.
    write_pos: AtomicUsize,
    /// Queue capacity (power of 2 for efficient modulo).
    capacity: usize,
    /// Mask for efficient modulo (capacity - 1).
    mask: usize,
}

impl<T> SpscQueue<T> {
    /// Create a new queue with the specified capacity.
    ///
    /// The capacity will be rounded up to the next power of 2.
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            capacity,
            mask: capacity - 1,
        }
    }

    /// Get the queue capacity.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of values waiting to be read.
    pub fn len(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the number of free slots for writing.
    pub fn free(&self) -> usize {
        self.capacity - self.len()
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        let write = *self.write_pos.get_mut();
        let mut read = *self.read_pos.get_mut();
        while read != write {
            let slot = self.slots[read & self.mask].get_mut();
            // SAFETY: slots in [read, write) were written and not yet read
            #[allow(unsafe_code)]
            unsafe {
                slot.assume_init_drop();
            }
            read = read.wrapping_add(1);
        }
    }
}

// SAFETY: SpscQueue is safe to share between threads (Send + Sync) when T is Send.
// Only the producer handle writes slots and advances `write_pos`; only the
// consumer handle reads slots and advances `read_pos`. A slot is handed over
// by the Release store of the position that publishes it.
#[allow(unsafe_code)]
unsafe impl<T: Send> Send for SpscQueue<T> {}
#[allow(unsafe_code)]
unsafe impl<T: Send> Sync for SpscQueue<T> {}

/// Writing end of an [`SpscQueue`].
pub struct QueueProducer<T> {
    queue: Arc<SpscQueue<T>>,
}

impl<T> QueueProducer<T> {
    /// Push a value, handing it back if the queue is full.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        let queue = &*self.queue;
        let write_pos = queue.write_pos.load(Ordering::Relaxed);
        let read_pos = queue.read_pos.load(Ordering::Acquire);

        if write_pos.wrapping_sub(read_pos) == queue.capacity {
            return Err(value);
        }

        let slot = queue.slots[write_pos & queue.mask].get();
        // SAFETY: We're the only writer and the slot is outside [read, write)
        #[allow(unsafe_code)]
        unsafe {
            (*slot).write(value);
        }

        queue
            .write_pos
            .store(write_pos.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Get the number of free slots for writing.
    pub fn free(&self) -> usize {
        self.queue.free()
    }

    /// Get the number of values waiting to be read.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Get the queue capacity.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Reading end of an [`SpscQueue`].
pub struct QueueConsumer<T> {
    queue: Arc<SpscQueue<T>>,
}

impl<T> QueueConsumer<T> {
    /// Pop the oldest value, if any.
    pub fn pop(&mut self) -> Option<T> {
        let queue = &*self.queue;
        let read_pos = queue.read_pos.load(Ordering::Relaxed);
        let write_pos = queue.write_pos.load(Ordering::Acquire);

        if read_pos == write_pos {
            return None;
        }

        let slot = queue.slots[read_pos & queue.mask].get();
        // SAFETY: We're the only reader and the slot is inside [read, write)
        #[allow(unsafe_code)]
        let value = unsafe { (*slot).assume_init_read() };

        queue
            .read_pos
            .store(read_pos.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Get the number of values waiting to be read.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Create a queue and split it into its producer and consumer ends.
pub fn spsc_queue<T>(capacity: usize) -> (QueueProducer<T>, QueueConsumer<T>) {
    let queue = Arc::new(SpscQueue::new(capacity));
    (
        QueueProducer {
            queue: queue.clone(),
        },
        QueueConsumer { queue },
    )
}
