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

//! Asynchronous all-to-all manager.
//!
//! Producer threads feed per-destination comm targets through [`put`]
//! (lock-free word-stream append) and [`put_ptr`] (deferred edge ranges).
//! The drivers then merge, filter, deduplicate, and exchange everything:
//!
//! - [`run_with_both`] handles mixed buffer and pointer traffic over
//!   multiple bounded-memory rounds,
//! - [`run_ptr`] is the pointer-only variant with a per-thread output
//!   budget,
//! - [`run_buffer`] is a single-shot buffer-only exchange.
//!
//! Destinations are always walked in rank-shifted order
//! `(c + my_rank) % size` so receivers are loaded evenly.
//!
//! [`put`]: AlltoallManager::put
//! [`put_ptr`]: AlltoallManager::put_ptr
//! [`run_with_both`]: AlltoallManager::run_with_both
//! [`run_ptr`]: AlltoallManager::run_ptr
//! [`run_buffer`]: AlltoallManager::run_buffer

use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error};
use rayon::prelude::*;

use crate::buffer::{BufferId, BufferProvider};
use crate::collect::{
    collect_targets_ptr, dedup_targets_buffer, node_send_length_ptr, remove_sentinels_buffer,
    remove_sentinels_ptr, DedupScratch, PointerBatch,
};
use crate::error::{CommError, CommResult};
use crate::graph::Graph2DCsr;
use crate::net::Communicator;
use crate::scatter::ScatterContext;
use crate::state::SsspState;

/// `cur_buf` value while no send buffer is held.
const NO_BUF: usize = usize::MAX;

/// Smallest pointer reservation worth scheduling into a thread's budget.
const MINIMUM_POINTER_SPACE: usize = 40;

/// Dedup backend for the buffer path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupKind {
    /// Per-thread positions scratch sized `num_local_verts`.
    Positions,
    /// Per-thread hash map, cleared after every destination.
    HashMap,
}

/// Runtime switches of the manager.
#[derive(Debug, Clone)]
pub struct AlltoallOptions {
    pub dedup: DedupKind,
    /// Skip buffer-path dedup in presolve rounds.
    pub skip_presolve_dedup: bool,
    /// Walk edge weights for exact light/heavy size estimates instead of
    /// overestimating.
    pub tight_ptr_estimate: bool,
    /// Width of the merge worker team; the caller's positions scratch must
    /// cover `num_local_verts * max_threads` entries.
    pub max_threads: usize,
}

impl Default for AlltoallOptions {
    fn default() -> Self {
        Self {
            dedup: DedupKind::Positions,
            skip_presolve_dedup: false,
            tight_ptr_estimate: true,
            max_threads: rayon::current_num_threads(),
        }
    }
}

/// Completed send buffer queued for one destination.
#[derive(Debug, Clone, Copy)]
struct WordRun {
    buf: BufferId,
    len: usize,
}

/// Per-destination producer state.
struct CommTarget {
    // reservation protocol of `put`: reserve words, copy, then publish
    reserved: AtomicUsize,
    filled: AtomicUsize,
    cur_buf: AtomicUsize,
    send_data: Mutex<Vec<WordRun>>,
    send_ptr: Mutex<Vec<PointerBatch>>,
}

impl CommTarget {
    fn new(buffer_len: usize) -> Self {
        Self {
            reserved: AtomicUsize::new(buffer_len),
            filled: AtomicUsize::new(buffer_len),
            cur_buf: AtomicUsize::new(NO_BUF),
            send_data: Mutex::new(Vec::new()),
            send_ptr: Mutex::new(Vec::new()),
        }
    }

    /// Queue the current buffer, if any, behind the completed runs.
    fn flush(&self) {
        let buf = self.cur_buf.swap(NO_BUF, Ordering::AcqRel);
        if buf != NO_BUF {
            let len = self.filled.load(Ordering::Acquire);
            self.send_data.lock().unwrap().push(WordRun { buf, len });
        }
    }

    fn queued_words(&self) -> usize {
        self.send_data.lock().unwrap().iter().map(|r| r.len).sum()
    }
}

/// Multi-producer all-to-all exchange manager for one rank.
pub struct AlltoallManager<C: Communicator> {
    comm: C,
    provider: Arc<dyn BufferProvider>,
    scatter: ScatterContext,
    targets: Vec<CommTarget>,
    buffer_len: usize,
    comm_size: usize,
    // serializes send-buffer acquisition against the provider
    buffer_lock: Mutex<()>,
    opts: AlltoallOptions,
}

impl<C: Communicator> AlltoallManager<C> {
    pub fn new(comm: C, provider: Arc<dyn BufferProvider>, opts: AlltoallOptions) -> Self {
        let comm_size = comm.size();
        let buffer_len = provider.buffer_len();
        Self {
            comm,
            scatter: ScatterContext::new(comm_size),
            targets: (0..comm_size).map(|_| CommTarget::new(buffer_len)).collect(),
            buffer_len,
            comm_size,
            buffer_lock: Mutex::new(()),
            provider,
            opts,
        }
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// Arm every target so the next `put` acquires a fresh buffer. Call
    /// between production phases; `new` leaves the manager armed.
    pub fn prepare(&self) {
        for node in &self.targets {
            node.reserved.store(self.buffer_len, Ordering::Release);
            node.filled.store(self.buffer_len, Ordering::Release);
        }
    }

    /// Whether every producer queue has been drained.
    pub fn queues_empty(&self) -> bool {
        self.targets.iter().all(|t| {
            t.send_data.lock().unwrap().is_empty() && t.send_ptr.lock().unwrap().is_empty()
        })
    }

    /// Append `data` words to `target`'s stream, thread-safe against other
    /// producers. The thread that first overflows the current buffer drains
    /// concurrent writers, queues the full buffer, and installs a fresh one.
    pub fn put(&self, data: &[u32], target: usize) -> CommResult<()> {
        if data.is_empty() {
            debug_assert!(!data.is_empty(), "zero-length put");
            return Ok(());
        }
        let len = data.len();
        debug_assert!(len <= self.buffer_len);
        let node = &self.targets[target];

        loop {
            let offset = node.reserved.fetch_add(len, Ordering::AcqRel);
            if offset > self.buffer_len {
                // a swap is in flight; wait for the fresh buffer
                while node.reserved.load(Ordering::Acquire) > self.buffer_len {
                    std::hint::spin_loop();
                }
                continue;
            }
            if offset + len > self.buffer_len {
                // overflow winner: drain concurrent writers, then swap
                debug_assert!(offset > 0);
                while node.filled.load(Ordering::Acquire) != offset {
                    std::hint::spin_loop();
                }
                node.flush();
                let fresh = self.acquire_buffer()?;
                node.cur_buf.store(fresh, Ordering::Release);
                node.filled.store(0, Ordering::Release);
                // publish the buffer before reopening reservations
                fence(Ordering::SeqCst);
                node.reserved.store(len, Ordering::Release);

                self.provider.add(fresh, 0, data);
                node.filled.fetch_add(len, Ordering::AcqRel);
                return Ok(());
            }

            let buf = node.cur_buf.load(Ordering::Acquire);
            debug_assert_ne!(buf, NO_BUF, "put on an unarmed target");
            self.provider.add(buf, offset, data);
            node.filled.fetch_add(len, Ordering::AcqRel);
            return Ok(());
        }
    }

    /// Queue a deferred edge range for `target`. The payload materializes at
    /// merge time, so phase filters see the state of the round that sends it.
    pub fn put_ptr(&self, batch: PointerBatch, target: usize) {
        debug_assert!(batch.ptr >= 0);
        debug_assert!(batch.len > 0, "zero-length pointer batch");
        self.targets[target].send_ptr.lock().unwrap().push(batch);
    }

    fn acquire_buffer(&self) -> CommResult<BufferId> {
        let _guard = self.buffer_lock.lock().unwrap();
        self.provider.get_buffer()
    }

    /// Destinations in rank-shifted order, split into one contiguous chunk
    /// per merge worker.
    fn dest_chunks(&self) -> Vec<Vec<usize>> {
        let size = self.comm_size;
        let rank = self.comm.rank();
        let order: Vec<usize> = (0..size).map(|c| (c + rank) % size).collect();
        let n_chunks = self.opts.max_threads.min(size).max(1);
        let chunk_len = size.div_ceil(n_chunks);
        order.chunks(chunk_len).map(|c| c.to_vec()).collect()
    }

    fn check_scratch(&self, graph: &Graph2DCsr, vpos: &[i32], n_chunks: usize) {
        assert!(graph.num_local_verts > 0);
        let needed = graph.num_local_verts as usize * n_chunks;
        assert!(
            vpos.len() >= needed,
            "positions scratch holds {} entries, {} needed",
            vpos.len(),
            needed
        );
        debug_assert!(vpos.iter().all(|&p| p == -1));
    }

    /// Bounded-memory multi-round exchange of both buffer and pointer data.
    ///
    /// Buffer data always goes out in round 0; pointer data that would
    /// overflow the per-destination budget is deferred to later rounds. The
    /// loop ends when an OR-reduce over all ranks reports no data left.
    ///
    /// On success the positions scratch is all -1 again and every queue is
    /// empty. A capacity error aborts the round and leaves the scratch
    /// unspecified.
    pub fn run_with_both(
        &mut self,
        graph: &Graph2DCsr,
        state: &SsspState<'_>,
        vpos: &mut [i32],
    ) -> CommResult<()> {
        let chunks = self.dest_chunks();
        self.check_scratch(graph, vpos, chunks.len());
        let max_words = self.provider.max_words();
        let max_per_node = max_words / self.comm_size;
        let num_local = graph.num_local_verts as usize;
        let tight = self.opts.tight_ptr_estimate;
        let dedup_kind = self.opts.dedup;
        let skip_dedup = state.is_presolving && self.opts.skip_presolve_dedup;

        // flush and size every destination once
        let lengths: Vec<(usize, usize)> = self
            .targets
            .par_iter()
            .map(|node| {
                node.flush();
                let len_buffer = node.queued_words();
                let batches = node.send_ptr.lock().unwrap();
                let len_ptr = node_send_length_ptr(&batches, state, graph, tight);
                (len_buffer, len_ptr)
            })
            .collect();
        let mut len_buffer: Vec<usize> = lengths.iter().map(|l| l.0).collect();
        let mut len_ptr: Vec<usize> = lengths.iter().map(|l| l.1).collect();

        let mut round = 0usize;
        loop {
            self.scatter.reset();
            let counted: Vec<Vec<(usize, usize)>> = chunks
                .par_iter()
                .map(|chunk| {
                    let mut thread_has_ptr = false;
                    let mut out = Vec::new();
                    for &i in chunk {
                        if len_ptr[i] == 0 && len_buffer[i] == 0 {
                            continue;
                        }
                        // one word for the embedded pointer-origin length
                        let mut count = 1;
                        if len_buffer[i] > 0 {
                            debug_assert_eq!(round, 0, "buffer data past round 0");
                            count += len_buffer[i];
                        }
                        if len_ptr[i] == 0 {
                            out.push((i, count));
                            continue;
                        }
                        if len_buffer[i] + len_ptr[i] > max_per_node
                            && (thread_has_ptr || round == 0)
                        {
                            // defer the pointer data to a later round
                            if len_buffer[i] > 0 {
                                out.push((i, count));
                            }
                            continue;
                        }
                        thread_has_ptr = true;
                        out.push((i, count + len_ptr[i]));
                    }
                    out
                })
                .collect();
            for chunk_counts in counted {
                for (i, c) in chunk_counts {
                    self.scatter.counts_mut()[i] = c;
                }
            }

            self.scatter.sum();

            if self.scatter.send_count() > max_words {
                error!(
                    "send volume {} exceeds capacity {}",
                    self.scatter.send_count(),
                    max_words
                );
                return Err(CommError::SendOverflow {
                    send_words: self.scatter.send_count(),
                    capacity_words: max_words,
                });
            }

            if round > 0 {
                let has_data = self.comm.allreduce_or(self.scatter.send_count() > 0);
                if !has_data {
                    break;
                }
                if self.comm.rank() == 0 {
                    debug!("re-running all-to-all, round {}", round);
                }
            }

            // merge into the staging buffer
            {
                let offsets = self.scatter.offsets().to_vec();
                let counts_org = self.scatter.counts_org().to_vec();
                let targets = &self.targets;
                let provider = &*self.provider;
                let stage = provider.stage();
                let len_buffer = &len_buffer;
                let merged: Vec<Vec<(usize, usize)>> = chunks
                    .par_iter()
                    .zip(vpos.par_chunks_mut(num_local))
                    .map(|(chunk, vpos)| {
                        let mut map = hashbrown::HashMap::new();
                        let mut out = Vec::new();
                        for &i in chunk {
                            if counts_org[i] == 0 {
                                continue;
                            }
                            let node = &targets[i];
                            let use_buffer = len_buffer[i] != 0;
                            let use_ptr = counts_org[i] > len_buffer[i] + 1;
                            debug_assert!(use_ptr || use_buffer);

                            // SAFETY: slabs of distinct destinations are disjoint
                            let slab = unsafe { stage.slice_mut(offsets[i], counts_org[i]) };
                            let (ptr_len_word, stream) =
                                slab.split_first_mut().expect("slab holds the length word");
                            *ptr_len_word = 0;

                            let mut length_ptr = 0;
                            if use_ptr {
                                let batches = node.send_ptr.lock().unwrap();
                                length_ptr =
                                    collect_targets_ptr(&batches, state, graph, stream, vpos);
                                debug_assert!(length_ptr < counts_org[i]);
                            }
                            let mut length_buffer = 0;
                            if use_buffer {
                                let runs = node.send_data.lock().unwrap();
                                let mut off = length_ptr;
                                for run in runs.iter() {
                                    if run.len == 0 {
                                        continue;
                                    }
                                    provider.read_into(run.buf, &mut stream[off..off + run.len]);
                                    off += run.len;
                                }
                                length_buffer = off - length_ptr;
                                let mut dedup = match dedup_kind {
                                    DedupKind::Positions => DedupScratch::Positions(&mut *vpos),
                                    DedupKind::HashMap => DedupScratch::Map(&mut map),
                                };
                                dedup_targets_buffer(
                                    graph,
                                    stream,
                                    length_ptr,
                                    length_buffer,
                                    skip_dedup,
                                    &mut dedup,
                                );
                            }

                            let mut send_len = 1;
                            let mut length_ptr_reduced = 0;
                            if use_ptr {
                                length_ptr_reduced =
                                    remove_sentinels_ptr(graph, length_ptr, stream, vpos);
                                debug_assert!(length_ptr_reduced <= length_ptr);
                                *ptr_len_word = length_ptr_reduced as u32;
                                send_len += length_ptr_reduced;
                                node.send_ptr.lock().unwrap().clear();
                            }
                            if use_buffer {
                                let resets = match dedup_kind {
                                    DedupKind::Positions => Some(&mut *vpos),
                                    DedupKind::HashMap => None,
                                };
                                let reduced = remove_sentinels_buffer(
                                    graph,
                                    length_ptr,
                                    length_ptr_reduced,
                                    length_buffer,
                                    stream,
                                    resets,
                                );
                                debug_assert!(reduced <= length_buffer);
                                send_len += reduced;
                                node.send_data.lock().unwrap().clear();
                            }

                            debug_assert!(send_len <= counts_org[i]);
                            if send_len == 1 {
                                send_len = 0;
                            }
                            out.push((i, send_len));
                        }
                        out
                    })
                    .collect();
                for chunk_lengths in merged {
                    for (i, l) in chunk_lengths {
                        self.scatter.send_lengths_mut()[i] = l;
                    }
                }
            }
            for i in 0..self.comm_size {
                if self.scatter.counts_org()[i] == 0 {
                    continue;
                }
                if self.scatter.counts_org()[i] > len_buffer[i] + 1 {
                    len_ptr[i] = 0;
                }
                len_buffer[i] = 0;
            }

            self.exchange_and_deliver(round)?;
            round += 1;
        }

        debug_assert!(self.queues_empty());
        Ok(())
    }

    /// Pointer-only exchange with a per-thread output budget.
    ///
    /// A destination is deferred when it would overflow the thread's budget
    /// or the per-destination cap while the thread already holds data; a
    /// destination larger than an empty thread's whole budget is fatal.
    pub fn run_ptr(
        &mut self,
        graph: &Graph2DCsr,
        state: &SsspState<'_>,
        vpos: &mut [i32],
    ) -> CommResult<()> {
        let chunks = self.dest_chunks();
        self.check_scratch(graph, vpos, chunks.len());
        let max_words = self.provider.max_words();
        let max_per_node = max_words / self.comm_size;
        let max_per_thread = max_words / chunks.len();
        let num_local = graph.num_local_verts as usize;
        let tight = self.opts.tight_ptr_estimate;

        let node_send_lengths: Vec<usize> = self
            .targets
            .par_iter()
            .map(|node| {
                let batches = node.send_ptr.lock().unwrap();
                if batches.is_empty() {
                    0
                } else {
                    node_send_length_ptr(&batches, state, graph, tight)
                }
            })
            .collect();

        let mut round = 0usize;
        loop {
            self.scatter.reset();
            {
                let targets = &self.targets;
                let counted: CommResult<Vec<Vec<(usize, usize)>>> = chunks
                    .par_iter()
                    .map(|chunk| {
                        let mut size_thread = 0usize;
                        let mut out = Vec::new();
                        for &i in chunk {
                            if targets[i].send_ptr.lock().unwrap().is_empty() {
                                continue;
                            }
                            let spare = max_per_thread.saturating_sub(size_thread);
                            if spare < MINIMUM_POINTER_SPACE {
                                debug_assert!(size_thread != 0);
                                continue;
                            }
                            let need = node_send_lengths[i];
                            if need > max_per_node && size_thread > 0 {
                                continue;
                            }
                            if size_thread + need > max_per_thread {
                                if size_thread == 0 {
                                    error!(
                                        "destination {} needs {} words, thread budget is {}",
                                        i, need, max_per_thread
                                    );
                                    return Err(CommError::ThreadBudgetExceeded {
                                        target: i,
                                        needed: need,
                                        budget: max_per_thread,
                                    });
                                }
                                continue;
                            }
                            size_thread += need;
                            out.push((i, need));
                        }
                        Ok(out)
                    })
                    .collect();
                for chunk_counts in counted? {
                    for (i, c) in chunk_counts {
                        self.scatter.counts_mut()[i] = c;
                    }
                }
            }

            self.scatter.sum();

            if round > 0 {
                let has_data = self.comm.allreduce_or(self.scatter.send_count() > 0);
                if !has_data {
                    break;
                }
                if self.comm.rank() == 0 {
                    debug!("re-running pointer all-to-all, round {}", round);
                }
            }

            {
                let offsets = self.scatter.offsets().to_vec();
                let counts_org = self.scatter.counts_org().to_vec();
                let targets = &self.targets;
                let stage = self.provider.stage();
                let merged: Vec<Vec<(usize, usize)>> = chunks
                    .par_iter()
                    .zip(vpos.par_chunks_mut(num_local))
                    .map(|(chunk, vpos)| {
                        let mut out = Vec::new();
                        for &i in chunk {
                            if counts_org[i] == 0 {
                                continue;
                            }
                            // SAFETY: slabs of distinct destinations are disjoint
                            let stream = unsafe { stage.slice_mut(offsets[i], counts_org[i]) };
                            let mut batches = targets[i].send_ptr.lock().unwrap();
                            let length_ptr =
                                collect_targets_ptr(&batches, state, graph, stream, vpos);
                            debug_assert!(length_ptr <= counts_org[i]);
                            let reduced = remove_sentinels_ptr(graph, length_ptr, stream, vpos);
                            debug_assert!(reduced <= length_ptr);
                            batches.clear();
                            out.push((i, reduced));
                        }
                        out
                    })
                    .collect();
                for chunk_lengths in merged {
                    for (i, l) in chunk_lengths {
                        self.scatter.send_lengths_mut()[i] = l;
                    }
                }
            }

            // whole per-source range is pointer-origin here
            self.exchange_ptr_only()?;
            round += 1;
        }

        debug_assert!(self.queues_empty());
        Ok(())
    }

    /// Single-shot exchange of queued stream buffers; no multi-round logic.
    pub fn run_buffer(
        &mut self,
        graph: &Graph2DCsr,
        state: &SsspState<'_>,
        vpos: &mut [i32],
    ) -> CommResult<()> {
        let chunks = self.dest_chunks();
        self.check_scratch(graph, vpos, chunks.len());
        let max_words = self.provider.max_words();
        let num_local = graph.num_local_verts as usize;
        let dedup_kind = self.opts.dedup;
        let skip_dedup = state.is_presolving && self.opts.skip_presolve_dedup;

        let counts: Vec<usize> = self
            .targets
            .par_iter()
            .map(|node| {
                node.flush();
                node.queued_words()
            })
            .collect();
        self.scatter.reset();
        self.scatter.counts_mut().copy_from_slice(&counts);
        self.scatter.sum();

        if self.scatter.send_count() > max_words {
            error!(
                "send volume {} exceeds capacity {}",
                self.scatter.send_count(),
                max_words
            );
            return Err(CommError::SendOverflow {
                send_words: self.scatter.send_count(),
                capacity_words: max_words,
            });
        }

        {
            let offsets = self.scatter.offsets().to_vec();
            let counts_org = self.scatter.counts_org().to_vec();
            let targets = &self.targets;
            let provider = &*self.provider;
            let stage = provider.stage();
            let merged: Vec<Vec<(usize, usize)>> = chunks
                .par_iter()
                .zip(vpos.par_chunks_mut(num_local))
                .map(|(chunk, vpos)| {
                    let mut map = hashbrown::HashMap::new();
                    let mut out = Vec::new();
                    for &i in chunk {
                        if counts_org[i] == 0 {
                            continue;
                        }
                        let node = &targets[i];
                        // SAFETY: slabs of distinct destinations are disjoint
                        let stream = unsafe { stage.slice_mut(offsets[i], counts_org[i]) };

                        let runs = node.send_data.lock().unwrap();
                        let mut off = 0usize;
                        for run in runs.iter() {
                            if run.len == 0 {
                                continue;
                            }
                            provider.read_into(run.buf, &mut stream[off..off + run.len]);
                            off += run.len;
                        }
                        drop(runs);

                        let mut dedup = match dedup_kind {
                            DedupKind::Positions => DedupScratch::Positions(&mut *vpos),
                            DedupKind::HashMap => DedupScratch::Map(&mut map),
                        };
                        dedup_targets_buffer(graph, stream, 0, off, skip_dedup, &mut dedup);
                        let resets = match dedup_kind {
                            DedupKind::Positions => Some(&mut *vpos),
                            DedupKind::HashMap => None,
                        };
                        let reduced = remove_sentinels_buffer(graph, 0, 0, off, stream, resets);
                        debug_assert!(counts_org[i] >= reduced);

                        node.send_data.lock().unwrap().clear();
                        out.push((i, reduced));
                    }
                    out
                })
                .collect();
            for chunk_lengths in merged {
                for (i, l) in chunk_lengths {
                    self.scatter.send_lengths_mut()[i] = l;
                }
            }
        }

        let stage = self.provider.stage();
        let recv = self.provider.clear_buffers();
        // SAFETY: merge is done; the driver is the only buffer user now
        let send = unsafe { stage.slice(0, self.scatter.send_count()) };
        let recv_mut = unsafe { recv.slice_mut(0, max_words) };
        self.scatter.exchange(&self.comm, send, recv_mut, max_words)?;

        let recv_offsets = self.scatter.recv_offsets().to_vec();
        let provider = &*self.provider;
        (0..self.comm_size).into_par_iter().for_each(|i| {
            let start = recv_offsets[i];
            let end = recv_offsets[i + 1];
            // SAFETY: exchange complete, receive buffer is read-only now
            let words = unsafe { recv.slice(start, end - start) };
            provider.received(i, words, false);
        });

        Ok(())
    }

    /// Exchange the staged slabs and deliver the two sub-streams per source.
    fn exchange_and_deliver(&mut self, round: usize) -> CommResult<()> {
        let max_words = self.provider.max_words();
        let stage = self.provider.stage();
        let recv = self.provider.clear_buffers();
        // SAFETY: merge is done; the driver is the only buffer user now
        let send = unsafe { stage.slice(0, self.scatter.send_count()) };
        let recv_mut = unsafe { recv.slice_mut(0, max_words) };
        self.scatter.exchange(&self.comm, send, recv_mut, max_words)?;

        let recv_offsets = self.scatter.recv_offsets().to_vec();
        let provider = &*self.provider;
        (0..self.comm_size).into_par_iter().for_each(|i| {
            let start = recv_offsets[i];
            let end = recv_offsets[i + 1];
            if start == end {
                return;
            }
            // SAFETY: exchange complete, receive buffer is read-only now
            let words = unsafe { recv.slice(start, end - start) };
            let length_ptr = words[0] as usize;
            debug_assert!(1 + length_ptr <= words.len());
            provider.received(i, &words[1..1 + length_ptr], true);
            let rest = &words[1 + length_ptr..];
            debug_assert!(round == 0 || rest.is_empty());
            provider.received(i, rest, false);
        });

        self.provider.finish();
        Ok(())
    }

    /// Exchange and deliver for the pointer-only driver: every per-source
    /// range is one pointer-origin stream.
    fn exchange_ptr_only(&mut self) -> CommResult<()> {
        let max_words = self.provider.max_words();
        let stage = self.provider.stage();
        let recv = self.provider.clear_buffers();
        // SAFETY: merge is done; the driver is the only buffer user now
        let send = unsafe { stage.slice(0, self.scatter.send_count()) };
        let recv_mut = unsafe { recv.slice_mut(0, max_words) };
        self.scatter.exchange(&self.comm, send, recv_mut, max_words)?;

        let recv_offsets = self.scatter.recv_offsets().to_vec();
        let provider = &*self.provider;
        (0..self.comm_size).into_par_iter().for_each(|i| {
            let start = recv_offsets[i];
            let end = recv_offsets[i + 1];
            // SAFETY: exchange complete, receive buffer is read-only now
            let words = unsafe { recv.slice(start, end - start) };
            provider.received(i, words, true);
        });

        self.provider.finish();
        Ok(())
    }
}
