// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Buffer provider capability and the word-buffer primitive behind it.
//!
//! The exchange core does not own its memory. The host supplies send buffer
//! slots, one staging buffer for merged outbound slabs, and one receive
//! buffer, all measured in 32-bit stream words. Delivered sub-streams come
//! back through the [`BufferProvider::received`] upcall.
//!
//! [`VecBufferPool`] is the reference provider: a growable pool of
//! heap-backed slots with a recording `received` sink. The tests run on it;
//! simple hosts can too.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::CommResult;

/// Handle for a send buffer slot handed out by a provider.
pub type BufferId = usize;

/// Fixed-size word buffer written by several threads at disjoint offsets.
///
/// Producers reserve disjoint ranges through an external protocol (the
/// atomic reservation counter in the comm targets, or the per-destination
/// slab offsets of the staging buffer) before touching the words, so the
/// interior mutability never aliases.
pub struct SharedWords {
    words: Box<[UnsafeCell<u32>]>,
}

// SAFETY: all mutable access goes through `slice_mut`, whose callers
// guarantee exclusive ranges; see the struct docs.
unsafe impl Send for SharedWords {}
unsafe impl Sync for SharedWords {}

impl SharedWords {
    pub fn new(len: usize) -> Self {
        Self {
            words: (0..len).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Mutable view of `len` words starting at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive access to the range for the lifetime
    /// of the returned slice; no other `slice`/`slice_mut` may overlap it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u32] {
        debug_assert!(offset + len <= self.words.len());
        let base = self.words.as_ptr() as *mut u32;
        std::slice::from_raw_parts_mut(base.add(offset), len)
    }

    /// Shared view of `len` words starting at `offset`.
    ///
    /// # Safety
    ///
    /// No concurrent `slice_mut` may overlap the range.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u32] {
        debug_assert!(offset + len <= self.words.len());
        let base = self.words.as_ptr() as *const u32;
        std::slice::from_raw_parts(base.add(offset), len)
    }
}

/// Capability the host implements to back one exchange manager.
///
/// All methods take `&self`; implementations are shared across the producer
/// threads and the driver.
pub trait BufferProvider: Send + Sync {
    /// Hand out an empty send buffer of [`buffer_len`](Self::buffer_len)
    /// words. The manager serializes calls.
    fn get_buffer(&self) -> CommResult<BufferId>;

    /// Write `data` into `buf` starting at `offset_words`. Concurrent
    /// callers always target disjoint ranges.
    fn add(&self, buf: BufferId, offset_words: usize, data: &[u32]);

    /// Copy the first `dst.len()` words of `buf` into `dst`.
    fn read_into(&self, buf: BufferId, dst: &mut [u32]);

    /// Words per send buffer slot.
    fn buffer_len(&self) -> usize;

    /// Capacity in words of the staging and receive buffers.
    fn max_words(&self) -> usize;

    /// Staging buffer the merge phase writes destination slabs into.
    fn stage(&self) -> &SharedWords;

    /// Reclaim every handed-out send buffer and expose the receive buffer
    /// for the next exchange.
    fn clear_buffers(&self) -> &SharedWords;

    /// Delivery upcall: one sub-stream of `data` words arrived from rank
    /// `from`. `is_pointer_stream` distinguishes pointer-origin payload from
    /// buffer-origin payload.
    fn received(&self, from: usize, data: &[u32], is_pointer_stream: bool);

    /// Called once per exchange round after all deliveries.
    fn finish(&self);
}

/// One recorded `received` upcall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub source: usize,
    pub is_pointer_stream: bool,
    pub words: Vec<u32>,
}

struct PoolSlots {
    all: Vec<Arc<SharedWords>>,
    free: Vec<BufferId>,
}

/// Reference provider: heap-backed slot pool plus a recording delivery sink.
pub struct VecBufferPool {
    buffer_len: usize,
    stage: SharedWords,
    recv: SharedWords,
    slots: Mutex<PoolSlots>,
    received: Mutex<Vec<Delivery>>,
    rounds: AtomicUsize,
}

impl VecBufferPool {
    /// `buffer_len` words per send slot; `max_words` capacity for the
    /// staging and receive buffers.
    pub fn new(buffer_len: usize, max_words: usize) -> Self {
        Self {
            buffer_len,
            stage: SharedWords::new(max_words),
            recv: SharedWords::new(max_words),
            slots: Mutex::new(PoolSlots {
                all: Vec::new(),
                free: Vec::new(),
            }),
            received: Mutex::new(Vec::new()),
            rounds: AtomicUsize::new(0),
        }
    }

    /// Drain everything delivered so far, in delivery order.
    pub fn take_received(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.received.lock().unwrap())
    }

    /// Number of completed exchange rounds.
    pub fn rounds_finished(&self) -> usize {
        self.rounds.load(Ordering::Acquire)
    }

    fn slot(&self, buf: BufferId) -> Arc<SharedWords> {
        self.slots.lock().unwrap().all[buf].clone()
    }
}

impl BufferProvider for VecBufferPool {
    fn get_buffer(&self) -> CommResult<BufferId> {
        let mut slots = self.slots.lock().unwrap();
        if let Some(id) = slots.free.pop() {
            return Ok(id);
        }
        slots.all.push(Arc::new(SharedWords::new(self.buffer_len)));
        Ok(slots.all.len() - 1)
    }

    fn add(&self, buf: BufferId, offset_words: usize, data: &[u32]) {
        let slot = self.slot(buf);
        // SAFETY: the caller's reservation protocol makes the range
        // exclusive to this thread.
        unsafe { slot.slice_mut(offset_words, data.len()).copy_from_slice(data) };
    }

    fn read_into(&self, buf: BufferId, dst: &mut [u32]) {
        let slot = self.slot(buf);
        // SAFETY: the buffer was flushed; no writer touches it anymore.
        unsafe { dst.copy_from_slice(slot.slice(0, dst.len())) };
    }

    fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    fn max_words(&self) -> usize {
        self.stage.len()
    }

    fn stage(&self) -> &SharedWords {
        &self.stage
    }

    fn clear_buffers(&self) -> &SharedWords {
        let mut slots = self.slots.lock().unwrap();
        slots.free = (0..slots.all.len()).collect();
        &self.recv
    }

    fn received(&self, from: usize, data: &[u32], is_pointer_stream: bool) {
        self.received.lock().unwrap().push(Delivery {
            source: from,
            is_pointer_stream,
            words: data.to_vec(),
        });
    }

    fn finish(&self) {
        self.rounds.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_cleared_slots() {
        let pool = VecBufferPool::new(16, 64);
        let a = pool.get_buffer().unwrap();
        let b = pool.get_buffer().unwrap();
        assert_ne!(a, b);
        pool.clear_buffers();
        let c = pool.get_buffer().unwrap();
        assert!(c == a || c == b);
    }

    #[test]
    fn add_then_read_back() {
        let pool = VecBufferPool::new(8, 64);
        let buf = pool.get_buffer().unwrap();
        pool.add(buf, 2, &[7, 8, 9]);
        let mut out = vec![0u32; 5];
        pool.read_into(buf, &mut out);
        assert_eq!(out, vec![0, 0, 7, 8, 9]);
    }
}
