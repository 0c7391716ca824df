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

//! Read-only view of the 2-D partitioned CSR graph consumed by the exchange
//! core.
//!
//! Edge words pack the target vertex: the low `local_bits` bits hold the
//! vertex index local to the owning row, the `r_bits` bits above them hold
//! the owning row. The exchange core never walks CSR row offsets; producers
//! hand it flat ranges into `edge_array` / `edge_weights`.

/// Flat edge storage plus the bit layout of packed edge words.
#[derive(Debug, Clone)]
pub struct Graph2DCsr {
    /// Packed target words, one per edge.
    pub edge_array: Vec<i64>,
    /// Edge weights, parallel to `edge_array`.
    pub edge_weights: Vec<f32>,
    /// Bits of the local-vertex field.
    pub local_bits: u32,
    /// Bits of the owner-row field above the local-vertex field.
    pub r_bits: u32,
    /// Vertices owned per row.
    pub num_local_verts: i64,
}

impl Graph2DCsr {
    pub fn new(
        edge_array: Vec<i64>,
        edge_weights: Vec<f32>,
        local_bits: u32,
        r_bits: u32,
        num_local_verts: i64,
    ) -> Self {
        assert_eq!(edge_array.len(), edge_weights.len());
        assert!(local_bits < 32, "local vertex must fit one stream word");
        Self {
            edge_array,
            edge_weights,
            local_bits,
            r_bits,
            num_local_verts,
        }
    }

    /// Mask selecting the local-vertex field of an edge word.
    #[inline]
    pub fn local_mask(&self) -> u32 {
        (1u32 << self.local_bits) - 1
    }

    /// Local vertex index of an edge's target.
    #[inline]
    pub fn target_local(&self, edge: i64) -> u32 {
        (edge as u64 as u32) & self.local_mask()
    }

    /// Owner row of an edge's target.
    #[inline]
    pub fn target_row(&self, edge: i64) -> i64 {
        ((edge as u64) >> self.local_bits) as i64 & ((1i64 << self.r_bits) - 1)
    }

    /// Position of an edge's target in the row-major settled bitmap.
    #[inline]
    pub fn settled_index(&self, edge: i64) -> usize {
        (self.target_row(edge) * self.num_local_verts + self.target_local(edge) as i64) as usize
    }
}
