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

//! Communication backends and the semantic message-passing surface.
//!
//! The exchange core needs rank/size, non-blocking point-to-point with
//! waitable and pollable handles, a barrier, an OR all-reduce, and a
//! variable-count all-to-all. The collectives have generic implementations
//! over the point-to-point operations; backends may override them with
//! native calls.
//!
//! Wire conventions: integers little-endian fixed width; stream payloads are
//! 32-bit words serialized LE.

pub mod allgather;
pub mod local;
pub mod request;

#[cfg(feature = "mpi")]
pub mod mpi;

pub use allgather::{allgather_2d, allgatherv_2d, Topology2d};
pub use local::{LocalComm, LocalGroup};

/// Blocking completion; receives return their payload.
pub trait Wait {
    fn wait(self) -> Option<Vec<u8>>;
}

/// Non-blocking completion test. Returns `Some` exactly once, when the
/// operation has completed; completed sends yield an empty payload.
pub trait PollWait {
    fn try_complete(&mut self) -> Option<Vec<u8>>;
}

/// Tag newtype for safer tag arithmetic.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CommTag(u16);

impl CommTag {
    #[inline]
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

/// Count exchange preceding a payload all-to-all.
pub const TAG_COUNTS: CommTag = CommTag::new(1);
/// Payload phase of the all-to-all.
pub const TAG_PAYLOAD: CommTag = CommTag::new(2);
/// OR all-reduce for round termination.
pub const TAG_REDUCE: CommTag = CommTag::new(3);
/// All-gather traffic along the first mesh dimension.
pub const TAG_GATHER_X: CommTag = CommTag::new(4);
/// All-gather traffic along the second mesh dimension.
pub const TAG_GATHER_Y: CommTag = CommTag::new(5);

/// Serialize stream words for the wire.
pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

/// Inverse of [`words_to_bytes`]; `bytes.len()` must be `4 * out.len()`.
pub fn bytes_to_words(bytes: &[u8], out: &mut [u32]) {
    debug_assert_eq!(bytes.len(), out.len() * 4);
    for (dst, src) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *dst = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
    }
}

/// Non-blocking communication surface of one rank.
pub trait Communicator: Send + Sync {
    /// Handle returned by `isend`.
    type SendHandle: Wait + PollWait + Send;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait + PollWait + Send;

    /// Rank of this process (0..size-1).
    fn rank(&self) -> usize;
    /// Total number of ranks.
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: CommTag, len: usize) -> Self::RecvHandle;

    /// Synchronization barrier across all ranks.
    fn barrier(&self);

    /// Personalized count exchange: returns the counts the peers hold for
    /// this rank.
    fn alltoall_counts(&self, send: &[usize]) -> Vec<usize> {
        let size = self.size();
        let me = self.rank();
        debug_assert_eq!(send.len(), size);

        let mut recvs: Vec<Option<Self::RecvHandle>> = (0..size).map(|_| None).collect();
        for peer in 0..size {
            if peer != me {
                recvs[peer] = Some(self.irecv(peer, TAG_COUNTS, 8));
            }
        }
        let mut sends = Vec::with_capacity(size.saturating_sub(1));
        for peer in 0..size {
            if peer != me {
                sends.push(self.isend(peer, TAG_COUNTS, &(send[peer] as u64).to_le_bytes()));
            }
        }

        let mut out = vec![0usize; size];
        out[me] = send[me];
        for s in sends {
            s.wait();
        }
        for (peer, slot) in recvs.iter_mut().enumerate() {
            if let Some(h) = slot.take() {
                let bytes = h.wait().expect("count receive");
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes);
                out[peer] = u64::from_le_bytes(raw) as usize;
            }
        }
        out
    }

    /// Logical-OR all-reduce.
    fn allreduce_or(&self, value: bool) -> bool {
        let size = self.size();
        let me = self.rank();

        let mut recvs: Vec<Option<Self::RecvHandle>> = (0..size).map(|_| None).collect();
        for peer in 0..size {
            if peer != me {
                recvs[peer] = Some(self.irecv(peer, TAG_REDUCE, 1));
            }
        }
        let mut sends = Vec::with_capacity(size.saturating_sub(1));
        for peer in 0..size {
            if peer != me {
                sends.push(self.isend(peer, TAG_REDUCE, &[value as u8]));
            }
        }

        let mut acc = value;
        for s in sends {
            s.wait();
        }
        for slot in recvs.iter_mut() {
            if let Some(h) = slot.take() {
                acc |= h.wait().expect("reduce receive")[0] != 0;
            }
        }
        acc
    }

    /// Variable-count personalized exchange of stream words.
    ///
    /// `send[send_displs[p]..][..send_counts[p]]` goes to peer `p`; peer
    /// `p`'s block lands at `recv[recv_displs[p]..][..recv_counts[p]]`.
    fn alltoallv(
        &self,
        send: &[u32],
        send_counts: &[usize],
        send_displs: &[usize],
        recv: &mut [u32],
        recv_counts: &[usize],
        recv_displs: &[usize],
    ) {
        let size = self.size();
        let me = self.rank();

        let mut recvs: Vec<Option<Self::RecvHandle>> = (0..size).map(|_| None).collect();
        for peer in 0..size {
            if peer != me && recv_counts[peer] > 0 {
                recvs[peer] = Some(self.irecv(peer, TAG_PAYLOAD, recv_counts[peer] * 4));
            }
        }
        let mut sends = Vec::new();
        for peer in 0..size {
            if peer != me && send_counts[peer] > 0 {
                let block = &send[send_displs[peer]..send_displs[peer] + send_counts[peer]];
                sends.push(self.isend(peer, TAG_PAYLOAD, &words_to_bytes(block)));
            }
        }

        // own block
        recv[recv_displs[me]..recv_displs[me] + recv_counts[me]]
            .copy_from_slice(&send[send_displs[me]..send_displs[me] + send_counts[me]]);

        for s in sends {
            s.wait();
        }
        for (peer, slot) in recvs.iter_mut().enumerate() {
            if let Some(h) = slot.take() {
                let bytes = h.wait().expect("payload receive");
                bytes_to_words(
                    &bytes,
                    &mut recv[recv_displs[peer]..recv_displs[peer] + recv_counts[peer]],
                );
            }
        }
    }
}
