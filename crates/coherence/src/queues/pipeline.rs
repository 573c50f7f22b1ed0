//! Timed multi-server pipeline.
//!
//! Models a fixed-latency resource (MAF lookup, directory tag array, data array) that
//! accepts a new item only when one of its servers is free. Each enqueue occupies the
//! earliest free server for `issue_latency` cycles per repeat, and the item completes
//! `latency` cycles per repeat after issue.

use std::collections::VecDeque;

/// Latency/issue/server configuration of a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineTiming {
    /// Cycles from issue to completion.
    pub latency: u64,
    /// Minimum spacing between two issues on the same server.
    pub issue_latency: u64,
    /// Number of parallel servers.
    pub servers: usize,
}

/// FIFO of in-flight items, each tagged with its completion cycle.
#[derive(Debug)]
pub struct PipelineFifo<T> {
    name: &'static str,
    timing: PipelineTiming,
    server_ready: VecDeque<u64>,
    queue: VecDeque<(T, u64)>,
}

impl<T> PipelineFifo<T> {
    /// Creates an idle pipeline.
    ///
    /// # Panics
    ///
    /// Panics if `servers` is zero or `issue_latency` is zero.
    pub fn new(name: &'static str, timing: PipelineTiming) -> Self {
        assert!(timing.servers > 0, "pipeline {name} needs at least one server");
        assert!(
            timing.issue_latency >= 1,
            "pipeline {name} issue latency must be at least one cycle"
        );
        Self {
            name,
            timing,
            server_ready: std::iter::repeat_n(0, timing.servers).collect(),
            queue: VecDeque::new(),
        }
    }

    /// Issues `item` at cycle `now`, occupying the pipeline `repeat` consecutive times.
    ///
    /// # Panics
    ///
    /// Panics if no server is available at `now`.
    pub fn enqueue(&mut self, item: T, now: u64, repeat: u32) {
        assert!(
            self.server_avail(now),
            "pipeline {} enqueue at cycle {now} with no free server",
            self.name
        );
        let repeat = u64::from(repeat.max(1));
        for i in 0..repeat {
            let _ = self.server_ready.pop_front();
            self.server_ready
                .push_back(now + self.timing.issue_latency * (i + 1));
        }
        self.queue
            .push_back((item, now + self.timing.latency * repeat));
    }

    /// True if the oldest item has completed by `now`.
    #[inline]
    pub fn ready(&self, now: u64) -> bool {
        self.queue.front().is_some_and(|&(_, done)| now >= done)
    }

    /// True if a new item can be issued at `now`.
    #[inline]
    pub fn server_avail(&self, now: u64) -> bool {
        self.server_ready.front().is_some_and(|&t| t <= now)
    }

    /// Delays every server by one cycle, used when a downstream stage is busy.
    pub fn stall(&mut self) {
        self.server_ready.iter_mut().for_each(|t| *t += 1);
    }

    /// Removes the oldest item.
    pub fn dequeue(&mut self) -> Option<T> {
        self.queue.pop_front().map(|(item, _)| item)
    }

    /// Oldest item, if any.
    #[inline]
    pub fn peek(&self) -> Option<&T> {
        self.queue.front().map(|(item, _)| item)
    }

    /// Oldest item, mutably.
    #[inline]
    pub fn peek_mut(&mut self) -> Option<&mut T> {
        self.queue.front_mut().map(|(item, _)| item)
    }

    /// Items in flight.
    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if nothing is in flight.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
