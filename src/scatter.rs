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

//! Per-round bookkeeping around the all-to-all-v exchange.
//!
//! One round goes: write per-destination word counts, `sum()` them into
//! slab offsets, merge into the staging buffer (which may shrink each
//! destination, recorded in the send lengths), then `exchange()`.
//!
//! Invariant: `send_lengths[i] <= counts_org[i]` at exchange time; the
//! merge phase only ever reduces a destination below its counted size.

use crate::error::{CommError, CommResult};
use crate::net::Communicator;

/// Counts, prefix offsets, and the exchange wrapper for one manager.
pub struct ScatterContext {
    size: usize,
    counts: Vec<usize>,
    counts_org: Vec<usize>,
    offsets: Vec<usize>,
    send_lengths: Vec<usize>,
    recv_counts: Vec<usize>,
    recv_offsets: Vec<usize>,
}

impl ScatterContext {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            counts: vec![0; size],
            counts_org: vec![0; size],
            offsets: vec![0; size + 1],
            send_lengths: vec![0; size],
            recv_counts: vec![0; size],
            recv_offsets: vec![0; size + 1],
        }
    }

    /// Zero the counts and send lengths for a new round.
    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
        self.send_lengths.iter_mut().for_each(|c| *c = 0);
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn counts_mut(&mut self) -> &mut [usize] {
        &mut self.counts
    }

    /// Counted size of each destination as of the last `sum()`.
    pub fn counts_org(&self) -> &[usize] {
        &self.counts_org
    }

    /// Prefix-sum the counts into slab offsets; seed the send lengths with
    /// the counted sizes.
    pub fn sum(&mut self) {
        self.offsets[0] = 0;
        for i in 0..self.size {
            self.offsets[i + 1] = self.offsets[i] + self.counts[i];
        }
        self.counts_org.copy_from_slice(&self.counts);
        self.send_lengths.copy_from_slice(&self.counts);
    }

    /// Slab start offsets, one past the end at index `size`.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Total words counted for this round.
    pub fn send_count(&self) -> usize {
        self.offsets[self.size]
    }

    pub fn send_lengths(&self) -> &[usize] {
        &self.send_lengths
    }

    pub fn send_lengths_mut(&mut self) -> &mut [usize] {
        &mut self.send_lengths
    }

    /// Words actually sent in the last exchange.
    pub fn sent_count(&self) -> usize {
        self.send_lengths.iter().sum()
    }

    /// Per-source delivered ranges of the last exchange, one past the end
    /// at index `size`.
    pub fn recv_offsets(&self) -> &[usize] {
        &self.recv_offsets
    }

    /// Total words received in the last exchange.
    pub fn recv_count(&self) -> usize {
        self.recv_offsets[self.size]
    }

    /// Exchange the merged slabs: a count round first, then the payloads.
    /// `recv` must hold at least `recv_cap_words`.
    pub fn exchange<C: Communicator>(
        &mut self,
        comm: &C,
        send: &[u32],
        recv: &mut [u32],
        recv_cap_words: usize,
    ) -> CommResult<()> {
        debug_assert!(self
            .send_lengths
            .iter()
            .zip(self.counts_org.iter())
            .all(|(l, c)| l <= c));

        self.recv_counts = comm.alltoall_counts(&self.send_lengths);
        self.recv_offsets[0] = 0;
        for i in 0..self.size {
            self.recv_offsets[i + 1] = self.recv_offsets[i] + self.recv_counts[i];
        }

        let recv_total = self.recv_offsets[self.size];
        if recv_total > recv_cap_words {
            return Err(CommError::RecvOverflow {
                recv_words: recv_total,
                capacity_words: recv_cap_words,
            });
        }

        comm.alltoallv(
            send,
            &self.send_lengths,
            &self.offsets[..self.size],
            recv,
            &self.recv_counts,
            &self.recv_offsets[..self.size],
        );
        Ok(())
    }
}
