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

//! Distributed all-to-all exchange core for a parallel SSSP engine.
//!
//! During each SSSP phase, every rank produces candidate distance updates
//! for other ranks. This crate aggregates them per destination, filters
//! them against the phase state (settled vertices, bucket bound,
//! light/heavy edges), deduplicates to the minimum weight, and exchanges
//! the merged streams under a fixed memory budget, spilling excess pointer
//! data into follow-up rounds. A pipelined ring/2-D-torus all-gather covers
//! the collective side channel.
//!
//! The host plugs in through two seams: a [`BufferProvider`] that owns the
//! buffer memory and consumes delivered streams, and a [`Communicator`]
//! backend ([`LocalGroup`] in-process, MPI behind the `mpi` feature).
//!
//! [`BufferProvider`]: buffer::BufferProvider
//! [`Communicator`]: net::Communicator
//! [`LocalGroup`]: net::LocalGroup

pub mod alltoall;
pub mod buffer;
pub mod collect;
pub mod error;
pub mod graph;
pub mod net;
pub mod scatter;
pub mod state;
pub mod util;

// Re-export commonly used types
pub use crate::alltoall::{AlltoallManager, AlltoallOptions, DedupKind};
pub use crate::buffer::{BufferProvider, Delivery, SharedWords, VecBufferPool};
pub use crate::collect::PointerBatch;
pub use crate::error::{CommError, CommResult};
pub use crate::graph::Graph2DCsr;
pub use crate::state::SsspState;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
