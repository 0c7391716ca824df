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

//! Error handling for the exchange core.
//!
//! Memory shortfalls and request-pool exhaustion are unrecoverable for the
//! round that hits them; they surface as typed errors and the host decides
//! whether to tear down the job.

/// Main error type for communication operations.
#[derive(thiserror::Error, Debug)]
pub enum CommError {
    /// Aggregate send volume of a round does not fit the receive buffer.
    #[error("send volume of {send_words} words exceeds receive capacity of {capacity_words} words")]
    SendOverflow {
        send_words: usize,
        capacity_words: usize,
    },

    /// Received more data than the posted receive buffer can hold.
    #[error("receive volume of {recv_words} words exceeds capacity of {capacity_words} words")]
    RecvOverflow {
        recv_words: usize,
        capacity_words: usize,
    },

    /// A single destination needs more than one thread's output budget and
    /// no partial progress is possible.
    #[error("destination {target} needs {needed} words but the per-thread budget is {budget} words")]
    ThreadBudgetExceeded {
        target: usize,
        needed: usize,
        budget: usize,
    },

    /// The buffer provider could not hand out another send buffer.
    #[error("buffer pool exhausted after {in_use} buffers")]
    PoolExhausted { in_use: usize },

    /// All request slots of the gather engine are occupied.
    #[error("request pool exhausted ({slots} slots)")]
    RequestPoolExhausted { slots: usize },

    /// The gather engine still expects completions but holds no live request.
    #[error("no active request while {unfinished} operations are unfinished")]
    NoActiveRequest { unfinished: usize },

    /// Backend-specific communication failure.
    #[error("communication error: {0}")]
    Comm(String),
}

/// Result alias used throughout the crate.
pub type CommResult<T> = Result<T, CommError>;
