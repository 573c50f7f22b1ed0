//! Bounded message queue with slot reservation.
//!
//! Every port of a bank is a `MessageQueue`. Producers must check availability before
//! pushing; a push into a queue without space is a wiring bug and aborts. Slots can be
//! reserved ahead of time so that a work record admitted this cycle is guaranteed room
//! for the messages it will emit several cycles later.
//!
//! Accounting uses two counters:
//! 1. **Usage:** Messages currently queued.
//! 2. **Claimed:** Usage plus outstanding reservations; never exceeds the size.

use std::collections::VecDeque;

/// FIFO queue of `T` with a fixed capacity and reservations.
#[derive(Debug)]
pub struct MessageQueue<T> {
    name: &'static str,
    items: VecDeque<T>,
    size: usize,
    usage: usize,
    claimed: usize,
}

impl<T> MessageQueue<T> {
    /// Creates an empty queue holding at most `size` messages.
    ///
    /// `name` is used only in diagnostics.
    pub fn new(name: &'static str, size: usize) -> Self {
        assert!(size > 0, "queue {name} must have a non-zero size");
        Self {
            name,
            items: VecDeque::with_capacity(size),
            size,
            usage: 0,
            claimed: 0,
        }
    }

    /// Diagnostic name.
    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Configured capacity.
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.size
    }

    /// Appends a message. Consumes one unclaimed slot.
    ///
    /// # Panics
    ///
    /// Panics if the queue has no unclaimed slot. Callers that hold a reservation must
    /// release it before pushing.
    pub fn push(&mut self, item: T) {
        assert!(
            self.claimed < self.size,
            "push into full queue {} ({} used, {} reserved, size {})",
            self.name,
            self.usage,
            self.reserved(),
            self.size
        );
        self.items.push_back(item);
        self.usage += 1;
        self.claimed += 1;
    }

    /// Removes and returns the oldest message.
    pub fn pop(&mut self) -> Option<T> {
        let item = self.items.pop_front()?;
        self.usage -= 1;
        self.claimed -= 1;
        Some(item)
    }

    /// Returns the oldest message without removing it.
    #[inline]
    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    /// True if `n` more messages (or reservations) fit.
    #[inline]
    pub const fn has_space(&self, n: usize) -> bool {
        self.claimed + n <= self.size
    }

    /// True if one more message fits.
    #[inline]
    pub const fn available(&self) -> bool {
        self.has_space(1)
    }

    /// True if every slot is queued or reserved.
    #[inline]
    pub const fn is_full(&self) -> bool {
        self.claimed >= self.size
    }

    /// Claims `n` slots for future pushes.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `n` slots are unclaimed.
    pub fn reserve(&mut self, n: usize) {
        assert!(
            self.claimed + n <= self.size,
            "over-reservation of queue {}: {} claimed + {n} > {}",
            self.name,
            self.claimed,
            self.size
        );
        self.claimed += n;
    }

    /// Releases `n` previously reserved slots.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `n` reservations are outstanding.
    pub fn unreserve(&mut self, n: usize) {
        assert!(
            self.reserved() >= n,
            "queue {} released {n} slots but only {} are reserved",
            self.name,
            self.reserved()
        );
        self.claimed -= n;
    }

    /// Outstanding reservations, excluding queued messages.
    #[inline]
    pub const fn reserved(&self) -> usize {
        self.claimed - self.usage
    }

    /// Number of queued messages.
    #[inline]
    pub const fn len(&self) -> usize {
        self.usage
    }

    /// True if no message is queued.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.usage == 0
    }

    /// Iterates over queued messages, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}
