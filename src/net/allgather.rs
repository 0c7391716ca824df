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

//! Pipelined all-gather specialized for a 1-D ring and a 2-D torus.
//!
//! The 2-D path splits every rank's segment into four quarters and gathers
//! one quarter per mesh direction (+x, -x, +y, -y), then fills the
//! orthogonal axis with `width` concurrent send/recv pairs per step. Both
//! dimensions carry traffic for the whole operation instead of one after
//! the other.
//!
//! Ranks outside a proper grid fall back to a bidirectional ring that ships
//! the left half of each segment one way and the right half the other.

use super::request::{Post, PostKind, RequestManager, StepHandler};
use super::{CommTag, Communicator, TAG_GATHER_X, TAG_GATHER_Y};
use crate::error::CommResult;

/// Process grid of `size_x * size_y` ranks.
///
/// `rank_map[x + y * size_x]` names the rank at grid position `(x, y)`.
#[derive(Debug, Clone)]
pub struct Topology2d {
    pub rank: usize,
    pub size: usize,
    pub rank_x: usize,
    pub rank_y: usize,
    pub size_x: usize,
    pub size_y: usize,
    pub rank_map: Vec<usize>,
}

impl Topology2d {
    /// Degenerate 1-D arrangement; the gather falls back to the ring path.
    pub fn ring(rank: usize, size: usize) -> Self {
        Self {
            rank,
            size,
            rank_x: rank,
            rank_y: 0,
            size_x: size,
            size_y: 1,
            rank_map: (0..size).collect(),
        }
    }

    /// Row-major grid with identity rank placement.
    pub fn grid(rank: usize, size_x: usize, size_y: usize) -> Self {
        Self {
            rank,
            size: size_x * size_y,
            rank_x: rank % size_x,
            rank_y: rank / size_x,
            size_x,
            size_y,
            rank_map: (0..size_x * size_y).collect(),
        }
    }

    /// Whether both mesh dimensions are usable.
    pub fn is_multi_dim(&self) -> bool {
        self.size_x > 1 && self.size_y > 1
    }

    /// Rank at the grid offset `(dx, dy)` from this rank, torus-wrapped.
    fn rank_at(&self, dx: isize, dy: isize) -> usize {
        let x = (self.rank_x as isize + dx).rem_euclid(self.size_x as isize) as usize;
        let y = (self.rank_y as isize + dy).rem_euclid(self.size_y as isize) as usize;
        self.rank_map[x + y * self.size_x]
    }
}

/// Bidirectional ring step: four posts per step, `size - 1` steps.
struct RingHandler {
    counts: Vec<usize>,
    offsets: Vec<usize>,
    size: usize,
    left: usize,
    right: usize,
    tag: CommTag,
    current: usize,
    l_sendidx: usize,
    l_recvidx: usize,
    r_sendidx: usize,
    r_recvidx: usize,
}

impl RingHandler {
    fn new(topo: &Topology2d, counts: Vec<usize>, offsets: Vec<usize>, tag: CommTag) -> Self {
        let size = topo.size;
        let rank = topo.rank;
        Self {
            counts,
            offsets,
            size,
            left: (rank + size - 1) % size,
            right: (rank + 1) % size,
            tag,
            current: 1,
            l_sendidx: rank,
            l_recvidx: (rank + 1) % size,
            r_sendidx: rank,
            r_recvidx: (rank + size - 1) % size,
        }
    }

    fn half(&self, idx: usize) -> (usize, usize, usize) {
        let off = self.offsets[idx];
        let cnt = self.counts[idx];
        (off, cnt / 2, cnt - cnt / 2)
    }
}

impl StepHandler for RingHandler {
    fn fanout(&self) -> usize {
        4
    }

    fn next(&mut self) -> Option<Vec<Post>> {
        if self.current >= self.size {
            return None;
        }

        let (l_send_off, l_send_cnt, _) = self.half(self.l_sendidx);
        let (l_recv_off, l_recv_cnt, _) = self.half(self.l_recvidx);
        let (r_off_s, r_lo_s, r_send_cnt) = self.half(self.r_sendidx);
        let (r_off_r, r_lo_r, r_recv_cnt) = self.half(self.r_recvidx);
        let r_send_off = r_off_s + r_lo_s;
        let r_recv_off = r_off_r + r_lo_r;

        let posts = vec![
            Post {
                peer: self.right,
                tag: self.tag,
                kind: PostKind::Recv(l_recv_off..l_recv_off + l_recv_cnt),
            },
            Post {
                peer: self.left,
                tag: self.tag,
                kind: PostKind::Recv(r_recv_off..r_recv_off + r_recv_cnt),
            },
            Post {
                peer: self.left,
                tag: self.tag,
                kind: PostKind::Send(l_send_off..l_send_off + l_send_cnt),
            },
            Post {
                peer: self.right,
                tag: self.tag,
                kind: PostKind::Send(r_send_off..r_send_off + r_send_cnt),
            },
        ];

        self.current += 1;
        self.l_sendidx = (self.l_sendidx + 1) % self.size;
        self.l_recvidx = (self.l_recvidx + 1) % self.size;
        self.r_sendidx = (self.r_sendidx + self.size - 1) % self.size;
        self.r_recvidx = (self.r_recvidx + self.size - 1) % self.size;

        Some(posts)
    }
}

/// Phase-1 step: gather one quarter along a single mesh direction.
struct AxisHandler {
    topo: Topology2d,
    counts: Vec<usize>,
    offsets: Vec<usize>,
    unit: (isize, isize),
    steps: usize,
    tag: CommTag,
    send_to: usize,
    recv_from: usize,
    current: usize,
}

impl AxisHandler {
    fn new(
        topo: &Topology2d,
        counts: Vec<usize>,
        offsets: Vec<usize>,
        unit: (isize, isize),
        steps: usize,
        tag: CommTag,
    ) -> Self {
        let send_to = topo.rank_at(-unit.0, -unit.1);
        let recv_from = topo.rank_at(unit.0, unit.1);
        Self {
            topo: topo.clone(),
            counts,
            offsets,
            unit,
            steps,
            tag,
            send_to,
            recv_from,
            current: 1,
        }
    }

    fn segment_rank(&self, diff: isize) -> usize {
        self.topo.rank_at(self.unit.0 * diff, self.unit.1 * diff)
    }
}

impl StepHandler for AxisHandler {
    fn fanout(&self) -> usize {
        2
    }

    fn next(&mut self) -> Option<Vec<Post>> {
        if self.current >= self.steps {
            return None;
        }

        let sendidx = self.segment_rank(self.current as isize - 1);
        let recvidx = self.segment_rank(self.current as isize);
        let send_off = self.offsets[sendidx];
        let send_cnt = self.counts[sendidx];
        let recv_off = self.offsets[recvidx];
        let recv_cnt = self.counts[recvidx];

        let posts = vec![
            Post {
                peer: self.recv_from,
                tag: self.tag,
                kind: PostKind::Recv(recv_off..recv_off + recv_cnt),
            },
            Post {
                peer: self.send_to,
                tag: self.tag,
                kind: PostKind::Send(send_off..send_off + send_cnt),
            },
        ];

        self.current += 1;
        Some(posts)
    }
}

/// Phase-2 step: fill the axis orthogonal to the phase-1 direction with
/// `width` concurrent send/recv pairs per step.
struct FillHandler {
    topo: Topology2d,
    counts: Vec<usize>,
    offsets: Vec<usize>,
    unit: (isize, isize),
    steps: usize,
    width: usize,
    tag: CommTag,
    send_to: usize,
    recv_from: usize,
    current: usize,
}

impl FillHandler {
    #[allow(clippy::too_many_arguments)]
    fn new(
        topo: &Topology2d,
        counts: Vec<usize>,
        offsets: Vec<usize>,
        unit: (isize, isize),
        steps: usize,
        width: usize,
        tag: CommTag,
    ) -> Self {
        let send_to = topo.rank_at(-unit.0, -unit.1);
        let recv_from = topo.rank_at(unit.0, unit.1);
        Self {
            topo: topo.clone(),
            counts,
            offsets,
            unit,
            steps,
            width,
            tag,
            send_to,
            recv_from,
            current: 1,
        }
    }

    /// Segment owner `step_diff` hops along the fill axis and `idx` along
    /// the orthogonal one.
    fn segment_rank(&self, step_diff: isize, idx: usize) -> usize {
        let ortho_x = if self.unit.0 == 0 { idx as isize } else { 0 };
        let ortho_y = if self.unit.1 == 0 { idx as isize } else { 0 };
        self.topo
            .rank_at(self.unit.0 * step_diff + ortho_x, self.unit.1 * step_diff + ortho_y)
    }
}

impl StepHandler for FillHandler {
    fn fanout(&self) -> usize {
        self.width * 2
    }

    fn next(&mut self) -> Option<Vec<Post>> {
        if self.current >= self.steps {
            return None;
        }

        let mut posts = Vec::with_capacity(self.width * 2);
        for idx in 0..self.width {
            let sendidx = self.segment_rank(self.current as isize - 1, idx);
            let recvidx = self.segment_rank(self.current as isize, idx);
            let send_off = self.offsets[sendidx];
            let send_cnt = self.counts[sendidx];
            let recv_off = self.offsets[recvidx];
            let recv_cnt = self.counts[recvidx];

            posts.push(Post {
                peer: self.recv_from,
                tag: self.tag,
                kind: PostKind::Recv(recv_off..recv_off + recv_cnt),
            });
            posts.push(Post {
                peer: self.send_to,
                tag: self.tag,
                kind: PostKind::Send(send_off..send_off + send_cnt),
            });
        }

        self.current += 1;
        Some(posts)
    }
}

/// Quarter split of every rank's segment, `[quarter][rank] -> (count, offset)`.
fn quarter_split(
    size: usize,
    recv_counts: &[usize],
    recv_offsets: &[usize],
) -> ([Vec<usize>; 4], [Vec<usize>; 4]) {
    let mut counts: [Vec<usize>; 4] = Default::default();
    let mut offsets: [Vec<usize>; 4] = Default::default();
    for s in 0..4 {
        counts[s] = Vec::with_capacity(size);
        offsets[s] = Vec::with_capacity(size);
        for i in 0..size {
            let max = recv_counts[i];
            let split = (max + 3) / 4;
            let start = recv_offsets[i] + max.min(split * s);
            let end = recv_offsets[i] + max.min(split * (s + 1));
            counts[s].push(end - start);
            offsets[s].push(start);
        }
    }
    (counts, offsets)
}

/// Variable-count all-gather over the mesh described by `topo`.
///
/// Output equals the reference all-gather-v: `recv` holds each rank's
/// segment of `recv_counts[i]` words at `recv_offsets[i]`.
pub fn allgatherv_2d<C: Communicator>(
    comm: &C,
    topo: &Topology2d,
    send: &[u32],
    recv_counts: &[usize],
    recv_offsets: &[usize],
    recv: &mut [u32],
) -> CommResult<()> {
    debug_assert_eq!(send.len(), recv_counts[topo.rank]);

    // own segment
    let own = recv_offsets[topo.rank];
    recv[own..own + send.len()].copy_from_slice(send);

    if topo.size == 1 {
        return Ok(());
    }

    if !topo.is_multi_dim() {
        let mut req_man = RequestManager::new(comm, 8);
        let mut ring = RingHandler::new(
            topo,
            recv_counts.to_vec(),
            recv_offsets.to_vec(),
            TAG_GATHER_X,
        );
        let mut handlers: [&mut dyn StepHandler; 1] = [&mut ring];
        return req_man.run(&mut handlers, recv);
    }

    let mut req_man = RequestManager::new(comm, (topo.size_x + topo.size_y) * 4);
    let (counts, offsets) = quarter_split(topo.size, recv_counts, recv_offsets);
    let (sx, sy) = (topo.size_x, topo.size_y);

    {
        let mut h0 = AxisHandler::new(topo, counts[0].clone(), offsets[0].clone(), (1, 0), sx, TAG_GATHER_X);
        let mut h1 = AxisHandler::new(topo, counts[1].clone(), offsets[1].clone(), (-1, 0), sx, TAG_GATHER_X);
        let mut h2 = AxisHandler::new(topo, counts[2].clone(), offsets[2].clone(), (0, 1), sy, TAG_GATHER_Y);
        let mut h3 = AxisHandler::new(topo, counts[3].clone(), offsets[3].clone(), (0, -1), sy, TAG_GATHER_Y);
        let mut handlers: [&mut dyn StepHandler; 4] = [&mut h0, &mut h1, &mut h2, &mut h3];
        req_man.run(&mut handlers, recv)?;
    }
    {
        let mut h0 = FillHandler::new(topo, counts[0].clone(), offsets[0].clone(), (0, 1), sy, sx, TAG_GATHER_X);
        let mut h1 = FillHandler::new(topo, counts[1].clone(), offsets[1].clone(), (0, -1), sy, sx, TAG_GATHER_X);
        let mut h2 = FillHandler::new(topo, counts[2].clone(), offsets[2].clone(), (1, 0), sx, sy, TAG_GATHER_Y);
        let mut h3 = FillHandler::new(topo, counts[3].clone(), offsets[3].clone(), (-1, 0), sx, sy, TAG_GATHER_Y);
        let mut handlers: [&mut dyn StepHandler; 4] = [&mut h0, &mut h1, &mut h2, &mut h3];
        req_man.run(&mut handlers, recv)?;
    }
    Ok(())
}

/// Uniform-count convenience wrapper over [`allgatherv_2d`].
pub fn allgather_2d<C: Communicator>(
    comm: &C,
    topo: &Topology2d,
    send: &[u32],
    recv: &mut [u32],
) -> CommResult<()> {
    let count = send.len();
    let recv_counts = vec![count; topo.size];
    let recv_offsets: Vec<usize> = (0..topo.size).map(|i| i * count).collect();
    allgatherv_2d(comm, topo, send, &recv_counts, &recv_offsets, recv)
}
