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

//! Merge and filter pipeline for one destination slab.
//!
//! Pointer batches expand into `(local_vertex, weight_bits)` pairs under the
//! active phase filter; queued stream buffers are copied in behind them.
//! Both passes deduplicate per local vertex through a positions scratch (or
//! a per-thread hash map), keeping the minimum-weight candidate and marking
//! losers with the sentinel weight. Compaction then squeezes the sentinels
//! out, drops headers left without payload, and restores every scratch
//! entry it saw back to -1.
//!
//! Stream layout per destination:
//! `[hdr_hi|FLAG][hdr_lo][block_len][v, w]*` repeated for pointer-origin
//! payload; buffer-origin payload interleaves flagged header pairs with
//! bare `[v, w]` pairs.

use crate::graph::Graph2DCsr;
use crate::state::SsspState;

/// High bit flagging the first word of a source-header pair.
pub const SOURCE_FLAG: u32 = 0x8000_0000;

/// Weight encoding used on the wire.
#[inline]
pub fn weight_bits(w: f32) -> u32 {
    w.to_bits()
}

#[inline]
pub fn weight_from_bits(b: u32) -> f32 {
    f32::from_bits(b)
}

/// Weight word marking a pair removed by dedup, squeezed out before send.
#[inline]
pub fn sentinel() -> u32 {
    (-1.0f32).to_bits()
}

/// Deferred edge range queued by `put_ptr`; expansion happens at merge time
/// so the filters see the newest phase state.
#[derive(Debug, Clone, Copy)]
pub struct PointerBatch {
    /// Start index into the graph's edge array.
    pub ptr: i64,
    /// Source header emitted ahead of the batch; bit 63 flags heavy batches.
    pub header: u64,
    /// Distance of the batch's source vertex.
    pub dist: f32,
    /// Number of edges in the range.
    pub len: usize,
}

impl PointerBatch {
    #[inline]
    pub fn is_heavy(&self) -> bool {
        self.header & (1 << 63) != 0
    }
}

/// Per-thread dedup state for the buffer path.
pub enum DedupScratch<'a> {
    /// Positions array sized `num_local_verts`, all entries -1 outside a
    /// merge. Fastest when local vertex ids are dense.
    Positions(&'a mut [i32]),
    /// Hash map alternative; cleared at the end of every destination.
    Map(&'a mut hashbrown::HashMap<u32, usize>),
}

/// Weight of `pos`'s candidate if it survives the phase filter.
///
/// Bellman-Ford keeps everything except settled targets. The light phase
/// additionally drops candidates at or above the bucket bound. The heavy
/// phase keeps heavy batches whole and takes only the delayed overflow
/// (at or above the bound) from non-heavy batches.
#[inline]
fn surviving_dist(
    state: &SsspState,
    graph: &Graph2DCsr,
    pos: usize,
    batch_dist: f32,
    batch_is_heavy: bool,
) -> Option<f32> {
    let edge = graph.edge_array[pos];
    if state.with_settled && state.target_is_settled(graph, edge) {
        return None;
    }
    let dist_new = batch_dist + graph.edge_weights[pos];
    if state.is_bellman_ford {
        return Some(dist_new);
    }
    if state.is_light_phase {
        if dist_new >= state.bucket_upper {
            return None;
        }
    } else if !batch_is_heavy && dist_new < state.bucket_upper {
        return None;
    }
    Some(dist_new)
}

/// Upper bound on the words the pointer queue expands to for one
/// destination: three words of header/length per batch plus two per
/// surviving edge. `tight` walks the weights for an exact light/heavy
/// count; otherwise those phases are overestimated.
pub fn node_send_length_ptr(
    batches: &[PointerBatch],
    state: &SsspState,
    graph: &Graph2DCsr,
    tight: bool,
) -> usize {
    let mut total = 0usize;
    for b in batches {
        if b.len == 0 {
            continue;
        }
        total += 3;

        if state.is_light_phase {
            debug_assert!(!b.is_heavy());
            if !tight {
                total += 2 * b.len;
                continue;
            }
        }

        let heavy = b.is_heavy();
        for i in 0..b.len {
            let pos = b.ptr as usize + i;
            if !tight && !state.is_bellman_ford {
                // loose heavy-phase estimate: count every non-settled edge
                if state.with_settled && state.target_is_settled(graph, graph.edge_array[pos]) {
                    continue;
                }
                total += 2;
            } else if surviving_dist(state, graph, pos, b.dist, heavy).is_some() {
                total += 2;
            }
        }
    }
    total
}

/// Expand the pointer queue into `stream`, filtering and deduplicating.
///
/// Emits `[hdr_hi|FLAG][hdr_lo][block_len]` then the surviving pairs per
/// batch; dominated pairs stay in place with their weight set to the
/// sentinel. `vpos` is indexed by local vertex and holds stream positions;
/// it is not reset here, that is the compaction pass's job. Returns the
/// emitted length.
pub fn collect_targets_ptr(
    batches: &[PointerBatch],
    state: &SsspState,
    graph: &Graph2DCsr,
    stream: &mut [u32],
    vpos: &mut [i32],
) -> usize {
    let sent = sentinel();
    let mut out = 0usize;

    for b in batches {
        if b.len == 0 {
            continue;
        }
        let heavy = b.is_heavy();
        stream[out] = (b.header >> 32) as u32 | SOURCE_FLAG;
        stream[out + 1] = b.header as u32;
        out += 3; // length word back-patched below
        let block_start = out;

        for i in 0..b.len {
            let pos = b.ptr as usize + i;
            let Some(dist_new) = surviving_dist(state, graph, pos, b.dist, heavy) else {
                continue;
            };
            let tgt_local = graph.target_local(graph.edge_array[pos]);

            let slot = vpos[tgt_local as usize];
            if slot < 0 {
                vpos[tgt_local as usize] = out as i32;
                stream[out] = tgt_local;
                stream[out + 1] = weight_bits(dist_new);
                out += 2;
                continue;
            }
            let twin = slot as usize;
            debug_assert!(twin < out);
            debug_assert_eq!(stream[twin], tgt_local);
            if dist_new < weight_from_bits(stream[twin + 1]) {
                vpos[tgt_local as usize] = out as i32;
                stream[twin + 1] = sent;
                stream[out] = tgt_local;
                stream[out + 1] = weight_bits(dist_new);
                out += 2;
            }
        }

        let filtered = out - block_start;
        debug_assert!(filtered % 2 == 0);
        stream[block_start - 1] = filtered as u32;
    }
    out
}

/// Dedup pass over buffer-origin payload already copied into `stream` at
/// `stream_offset..stream_offset + length`.
///
/// Embedded source-header pairs (flag bit on the first word) are skipped;
/// edge words get their flag bits masked off. With `skip_dedup` (presolve)
/// only the masking happens. Positions recorded by a preceding pointer pass
/// stay valid, so a buffer candidate can dominate a pointer-origin entry
/// and the other way round.
pub fn dedup_targets_buffer(
    graph: &Graph2DCsr,
    stream: &mut [u32],
    stream_offset: usize,
    length: usize,
    skip_dedup: bool,
    dedup: &mut DedupScratch<'_>,
) {
    let lmask = graph.local_mask();
    let sent = sentinel();
    debug_assert!(length % 2 == 0);

    let end = stream_offset + length;
    let mut j = stream_offset;
    while j < end {
        if stream[j] & SOURCE_FLAG != 0 {
            j += 2;
            debug_assert!(j + 1 < end, "source header without payload");
            debug_assert_eq!(stream[j] & SOURCE_FLAG, 0);
        }

        stream[j] &= lmask;
        let tgt_local = stream[j];
        debug_assert_ne!(stream[j + 1], sent);

        if !skip_dedup {
            let twin = match dedup {
                DedupScratch::Positions(vpos) => {
                    if vpos[tgt_local as usize] < 0 {
                        vpos[tgt_local as usize] = j as i32;
                        None
                    } else {
                        Some(vpos[tgt_local as usize] as usize)
                    }
                }
                DedupScratch::Map(map) => match map.entry(tgt_local) {
                    hashbrown::hash_map::Entry::Vacant(e) => {
                        e.insert(j);
                        None
                    }
                    hashbrown::hash_map::Entry::Occupied(e) => Some(*e.get()),
                },
            };

            if let Some(twin) = twin {
                debug_assert!(twin < j);
                debug_assert_eq!(stream[j], stream[twin]);
                let weight = weight_from_bits(stream[j + 1]);
                let twin_weight = weight_from_bits(stream[twin + 1]);
                if weight < twin_weight {
                    match dedup {
                        DedupScratch::Positions(vpos) => vpos[tgt_local as usize] = j as i32,
                        DedupScratch::Map(map) => {
                            map.insert(tgt_local, j);
                        }
                    }
                    stream[twin + 1] = sent;
                } else {
                    stream[j + 1] = sent;
                }
            }
        }
        j += 2;
    }

    if let DedupScratch::Map(map) = dedup {
        map.clear();
    }
}

/// Compact the pointer-origin segment: drop sentinel pairs, re-patch block
/// lengths, remove blocks whose payload emptied out, and reset the `vpos`
/// entries of every surviving pair. Returns the compacted length.
pub fn remove_sentinels_ptr(
    graph: &Graph2DCsr,
    length: usize,
    stream: &mut [u32],
    vpos: &mut [i32],
) -> usize {
    let sent = sentinel();
    let lmask = graph.local_mask();
    let mut new_len = 0usize;
    let mut i = 0usize;

    while i < length {
        debug_assert_ne!(stream[i] & SOURCE_FLAG, 0);
        debug_assert_eq!(stream[i + 2] & SOURCE_FLAG, 0);
        let block_len = stream[i + 2] as usize;
        let row_start = i + 3;
        let row_end = row_start + block_len;
        debug_assert!(block_len % 2 == 0);

        stream[new_len] = stream[i];
        stream[new_len + 1] = stream[i + 1];
        new_len += 3; // length word patched below
        let kept_start = new_len;

        let mut c = row_start;
        while c < row_end {
            if stream[c + 1] != sent {
                let tgt_local = stream[c] & lmask;
                debug_assert!((tgt_local as i64) < graph.num_local_verts);
                vpos[tgt_local as usize] = -1;
                stream[new_len] = stream[c];
                stream[new_len + 1] = stream[c + 1];
                new_len += 2;
            }
            c += 2;
        }

        let n_new = new_len - kept_start;
        if n_new == 0 {
            // every pair of the block was dominated; the header goes too
            new_len -= 3;
        } else {
            stream[kept_start - 1] = n_new as u32;
        }
        i = row_end;
    }

    debug_assert!(new_len <= length);
    new_len
}

/// Compact the buffer-origin segment, shifting it left from `read_start`
/// to `write_start` so it abuts the compacted pointer segment. Headers left
/// without a following pair are dropped. `vpos` entries of surviving pairs
/// are reset when the positions scratch is in use. Returns the compacted
/// length.
pub fn remove_sentinels_buffer(
    graph: &Graph2DCsr,
    read_start: usize,
    write_start: usize,
    length: usize,
    stream: &mut [u32],
    mut vpos: Option<&mut [i32]>,
) -> usize {
    debug_assert!(read_start >= write_start);
    let sent = sentinel();
    let lmask = graph.local_mask();
    let read_end = read_start + length;
    let mut write_pos = write_start;
    let mut red = read_start;

    while red < read_end {
        let mut v = stream[red];
        if v & SOURCE_FLAG != 0 {
            // previous header got no pairs after it
            if write_pos != write_start && stream[write_pos - 2] & SOURCE_FLAG != 0 {
                write_pos -= 2;
            }
            stream[write_pos] = stream[red];
            stream[write_pos + 1] = stream[red + 1];
            write_pos += 2;
            red += 2;
            v = stream[red];
            debug_assert_eq!(v & SOURCE_FLAG, 0);
        }

        if stream[red + 1] != sent {
            stream[write_pos] = stream[red];
            stream[write_pos + 1] = stream[red + 1];
            write_pos += 2;
            if let Some(vpos) = vpos.as_deref_mut() {
                let tgt_local = v & lmask;
                debug_assert!((tgt_local as i64) < graph.num_local_verts);
                vpos[tgt_local as usize] = -1;
            }
        }
        red += 2;
    }

    // trailing header with no payload
    if write_pos != write_start && stream[write_pos - 2] & SOURCE_FLAG != 0 {
        write_pos -= 2;
    }

    let reduced = write_pos - write_start;
    debug_assert!(reduced <= length);
    reduced
}
