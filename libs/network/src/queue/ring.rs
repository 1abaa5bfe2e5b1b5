//! Bounded lock-free MPMC ring
//!
//! ## Concurrency Design
//!
//! Producers and consumers each own a pair of monotonically increasing `u32`
//! cursors, wrapped onto the slot array through `mask = capacity - 1`:
//!
//! - **Reserve**: a producer reads its `head` and the consumer `tail`, checks
//!   that `n <= capacity - (head - tail)`, and CASes `head` forward by `n`.
//!   The winner owns slots `[old_head, old_head + n)` exclusively.
//! - **Publish**: after writing, the producer waits until the producer `tail`
//!   reaches `old_head` (earlier reservers have published) and then stores
//!   `tail = old_head + n`. Consumers never read past the producer `tail`, so a
//!   slot becomes visible only once fully written.
//! - **Pop** is symmetric: consumers reserve against the producer `tail` and
//!   publish on the consumer `tail`, which is what producers check for space.
//!
//! No mutex is taken on any path. Full and empty are reported immediately;
//! nothing in the ring blocks apart from the short publish wait.

use crate::error::{Result, TransportError};
use crossbeam_utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

/// Largest capacity for which `u32` cursor arithmetic stays unambiguous
pub const MAX_CAPACITY: usize = 1 << 31;

/// Head/tail pair; each side's pair lives on its own cache line
struct Cursors {
    head: AtomicU32,
    tail: AtomicU32,
}

impl Cursors {
    fn starting_at(pos: u32) -> Self {
        Self {
            head: AtomicU32::new(pos),
            tail: AtomicU32::new(pos),
        }
    }

    /// Wait for earlier reservers, then publish `[start, start + n)`
    fn publish(&self, start: u32, n: u32) {
        let backoff = Backoff::new();
        while self.tail.load(Ordering::Acquire) != start {
            backoff.snooze();
        }
        self.tail.store(start.wrapping_add(n), Ordering::Release);
    }
}

/// Fixed-capacity multi-producer multi-consumer queue
pub struct BoundedQueue<T> {
    capacity: u32,
    mask: u32,
    prod: CachePadded<Cursors>,
    cons: CachePadded<Cursors>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Slots are handed between threads only through the cursor protocol above:
// one thread writes a reserved slot, the publish store releases it, and
// exactly one consumer takes it.
unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> BoundedQueue<T> {
    /// Create a queue; `capacity` must be a power of two
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_start(capacity, 0)
    }

    fn with_start(capacity: usize, start: u32) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() || capacity > MAX_CAPACITY {
            return Err(TransportError::configuration(
                format!(
                    "queue capacity must be a power of two between 1 and {}, got {}",
                    MAX_CAPACITY, capacity
                ),
                Some("capacity"),
            ));
        }

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            capacity: capacity as u32,
            mask: (capacity - 1) as u32,
            prod: CachePadded::new(Cursors::starting_at(start)),
            cons: CachePadded::new(Cursors::starting_at(start)),
            slots,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Published element count; a snapshot under concurrent use
    pub fn len(&self) -> usize {
        let cons_tail = self.cons.tail.load(Ordering::Acquire);
        let prod_tail = self.prod.tail.load(Ordering::Acquire);
        (prod_tail.wrapping_sub(cons_tail)).min(self.capacity) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Push one item; a full queue hands the item back
    pub fn push(&self, item: T) -> std::result::Result<(), T> {
        let Some(start) = self.reserve_produce(1) else {
            return Err(item);
        };
        // SAFETY: the reservation grants exclusive ownership of this slot
        unsafe { self.write_slot(start, item) };
        self.prod.publish(start, 1);
        Ok(())
    }

    /// Push all of `items` in one reservation, or none of them
    pub fn mpush(&self, items: Vec<T>) -> std::result::Result<(), Vec<T>> {
        if items.is_empty() {
            return Ok(());
        }
        let n = match u32::try_from(items.len()) {
            Ok(n) if n <= self.capacity => n,
            _ => return Err(items),
        };
        let Some(start) = self.reserve_produce(n) else {
            return Err(items);
        };
        for (offset, item) in items.into_iter().enumerate() {
            // SAFETY: slots [start, start + n) are exclusively reserved
            unsafe { self.write_slot(start.wrapping_add(offset as u32), item) };
        }
        self.prod.publish(start, n);
        Ok(())
    }

    /// Pop one item
    pub fn pop(&self) -> Option<T> {
        let (start, _) = self.reserve_consume(1)?;
        // SAFETY: the slot was published by a producer and reserved by us
        let item = unsafe { self.read_slot(start) };
        self.cons.publish(start, 1);
        Some(item)
    }

    /// Pop up to `max_n` items in one reservation
    pub fn mpop(&self, max_n: usize) -> Vec<T> {
        let want = u32::try_from(max_n).unwrap_or(u32::MAX).min(self.capacity);
        if want == 0 {
            return Vec::new();
        }
        let Some((start, n)) = self.reserve_consume(want) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(n as usize);
        for offset in 0..n {
            // SAFETY: slots [start, start + n) are published and reserved by us
            out.push(unsafe { self.read_slot(start.wrapping_add(offset)) });
        }
        self.cons.publish(start, n);
        out
    }

    fn reserve_produce(&self, n: u32) -> Option<u32> {
        let mut head = self.prod.head.load(Ordering::Acquire);
        loop {
            let cons_tail = self.cons.tail.load(Ordering::Acquire);
            let free = self.capacity.wrapping_add(cons_tail).wrapping_sub(head);
            if n > free {
                return None;
            }
            match self.prod.head.compare_exchange_weak(
                head,
                head.wrapping_add(n),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(head),
                Err(actual) => head = actual,
            }
        }
    }

    /// Reserve up to `max_n` published items; returns start and count
    fn reserve_consume(&self, max_n: u32) -> Option<(u32, u32)> {
        let mut head = self.cons.head.load(Ordering::Acquire);
        loop {
            let prod_tail = self.prod.tail.load(Ordering::Acquire);
            let available = prod_tail.wrapping_sub(head);
            let n = available.min(max_n);
            if n == 0 {
                return None;
            }
            match self.cons.head.compare_exchange_weak(
                head,
                head.wrapping_add(n),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some((head, n)),
                Err(actual) => head = actual,
            }
        }
    }

    unsafe fn write_slot(&self, pos: u32, item: T) {
        let slot = &self.slots[(pos & self.mask) as usize];
        (*slot.get()).write(item);
    }

    unsafe fn read_slot(&self, pos: u32) -> T {
        let slot = &self.slots[(pos & self.mask) as usize];
        (*slot.get()).assume_init_read()
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        let mut pos = *self.cons.tail.get_mut();
        let end = *self.prod.tail.get_mut();
        while pos != end {
            let slot = &mut self.slots[(pos & self.mask) as usize];
            // SAFETY: every slot in [cons.tail, prod.tail) holds a published item
            unsafe { slot.get_mut().assume_init_drop() };
            pos = pos.wrapping_add(1);
        }
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
