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

//! Per-phase SSSP state consumed by the filter pipeline.
//!
//! The state is read-only for the duration of one `run_*` call. Pointer
//! batches queued before a round are expanded against the state of the round
//! that actually sends them, so filters reflect the latest algorithm
//! progress.

use crate::graph::Graph2DCsr;

/// Phase flags, bucket bound, and settled bitmap for the current round.
#[derive(Debug, Clone, Copy)]
pub struct SsspState<'a> {
    /// Plain Bellman-Ford relaxation (no bucket bound).
    pub is_bellman_ford: bool,
    /// Delta-stepping light-edge phase; candidates at or above
    /// `bucket_upper` are dropped.
    pub is_light_phase: bool,
    /// Whether `settled` filtering is active.
    pub with_settled: bool,
    /// Presolve rounds skip dedup on the buffer path.
    pub is_presolving: bool,
    /// Exclusive upper bound of the current bucket.
    pub bucket_upper: f32,
    /// Row-major settled bitmap, 64 vertices per word. May be empty when
    /// `with_settled` is false.
    pub settled: &'a [u64],
}

impl<'a> SsspState<'a> {
    /// Bellman-Ford phase; settled filtering is mandatory here.
    pub fn bellman_ford(settled: &'a [u64]) -> Self {
        Self {
            is_bellman_ford: true,
            is_light_phase: false,
            with_settled: true,
            is_presolving: false,
            bucket_upper: f32::INFINITY,
            settled,
        }
    }

    /// Light-edge phase bounded by `bucket_upper`.
    pub fn light(bucket_upper: f32) -> Self {
        Self {
            is_bellman_ford: false,
            is_light_phase: true,
            with_settled: false,
            is_presolving: false,
            bucket_upper,
            settled: &[],
        }
    }

    /// Heavy-edge phase: heavy batches pass, non-heavy batches contribute
    /// only their delayed overflow at or above `bucket_upper`.
    pub fn heavy(bucket_upper: f32) -> Self {
        Self {
            is_bellman_ford: false,
            is_light_phase: false,
            with_settled: false,
            is_presolving: false,
            bucket_upper,
            settled: &[],
        }
    }

    /// Presolve round: plain relaxation with no semantic filtering;
    /// buffer-path dedup stays optional.
    pub fn presolve() -> Self {
        Self {
            is_bellman_ford: true,
            is_light_phase: false,
            with_settled: false,
            is_presolving: true,
            bucket_upper: f32::INFINITY,
            settled: &[],
        }
    }

    /// Enable settled filtering with the given bitmap.
    pub fn with_settled(mut self, settled: &'a [u64]) -> Self {
        self.with_settled = true;
        self.settled = settled;
        self
    }

    /// Whether the target of `edge` is already settled.
    #[inline]
    pub fn target_is_settled(&self, graph: &Graph2DCsr, edge: i64) -> bool {
        let idx = graph.settled_index(edge);
        (self.settled[idx / 64] >> (idx % 64)) & 1 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_bit_lookup() {
        let g = Graph2DCsr::new(vec![5, 70], vec![1.0, 1.0], 8, 0, 256);
        let mut bitmap = vec![0u64; 4];
        bitmap[70 / 64] |= 1 << (70 % 64);
        let state = SsspState::bellman_ford(&bitmap);
        assert!(!state.target_is_settled(&g, 5));
        assert!(state.target_is_settled(&g, 70));
    }
}
