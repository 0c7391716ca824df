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

//! MPI communication backend (cargo feature `mpi`).
//!
//! Point-to-point operations use immediate sends/receives with statically
//! scoped buffers; the collectives map to their native MPI counterparts.
//! One thread per process drives the communicator, matching the exchange
//! core's single-communication-thread model.

use core::ptr::NonNull;

use mpi::collective::SystemOperation;
use mpi::environment::Universe;
use mpi::request::StaticScope;
use mpi::topology::{Communicator as _, SimpleCommunicator};
use mpi::traits::*;
use mpi::Count;

use super::{CommTag, Communicator, PollWait, Wait};

/// MPI-backed communicator over the world group.
pub struct MpiComm {
    _universe: Universe,
    world: SimpleCommunicator,
    rank: usize,
    size: usize,
}

// SAFETY: the exchange core serializes all communicator calls on one
// communication thread; MPI handles are opaque to the other threads.
unsafe impl Send for MpiComm {}
unsafe impl Sync for MpiComm {}

impl MpiComm {
    /// Initialize MPI and bind to the world communicator. Panics when MPI
    /// is already initialized.
    pub fn new() -> Self {
        let universe = mpi::initialize().expect("MPI already initialized");
        let world = universe.world();
        let rank = world.rank() as usize;
        let size = world.size() as usize;
        Self {
            _universe: universe,
            world,
            rank,
            size,
        }
    }
}

impl Default for MpiComm {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MpiSendHandle {
    req: Option<mpi::request::Request<'static, [u8], StaticScope>>,
    buf: Option<NonNull<[u8]>>,
}

// SAFETY: the boxed buffer is owned by the handle and freed exactly once.
unsafe impl Send for MpiSendHandle {}

impl MpiSendHandle {
    fn release(&mut self) {
        if let Some(ptr) = self.buf.take() {
            // SAFETY: pointer originates from Box::into_raw and the MPI
            // request no longer references it.
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
        }
    }
}

impl Wait for MpiSendHandle {
    fn wait(mut self) -> Option<Vec<u8>> {
        if let Some(r) = self.req.take() {
            let _ = r.wait();
        }
        self.release();
        None
    }
}

impl PollWait for MpiSendHandle {
    fn try_complete(&mut self) -> Option<Vec<u8>> {
        let req = self.req.take()?;
        match req.test() {
            Ok(_status) => {
                self.release();
                Some(Vec::new())
            }
            Err(req) => {
                self.req = Some(req);
                None
            }
        }
    }
}

impl Drop for MpiSendHandle {
    fn drop(&mut self) {
        if let Some(r) = self.req.take() {
            let _ = r.wait();
        }
        self.release();
    }
}

pub struct MpiRecvHandle {
    req: Option<mpi::request::Request<'static, [u8], StaticScope>>,
    buf: Option<NonNull<[u8]>>,
}

// SAFETY: see MpiSendHandle.
unsafe impl Send for MpiRecvHandle {}

impl MpiRecvHandle {
    fn take_data(&mut self) -> Vec<u8> {
        let ptr = self.buf.take().expect("receive buffer present");
        // SAFETY: pointer originates from Box::into_raw; the request has
        // completed, so MPI no longer writes through it.
        let boxed: Box<[u8]> = unsafe { Box::from_raw(ptr.as_ptr()) };
        boxed.into_vec()
    }
}

impl Wait for MpiRecvHandle {
    fn wait(mut self) -> Option<Vec<u8>> {
        if let Some(r) = self.req.take() {
            let _ = r.wait();
        }
        Some(self.take_data())
    }
}

impl PollWait for MpiRecvHandle {
    fn try_complete(&mut self) -> Option<Vec<u8>> {
        let req = self.req.take()?;
        match req.test() {
            Ok(_status) => Some(self.take_data()),
            Err(req) => {
                self.req = Some(req);
                None
            }
        }
    }
}

impl Drop for MpiRecvHandle {
    fn drop(&mut self) {
        if let Some(r) = self.req.take() {
            let _ = r.wait();
        }
        if let Some(ptr) = self.buf.take() {
            // SAFETY: as in take_data.
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
        }
    }
}

impl Communicator for MpiComm {
    type SendHandle = MpiSendHandle;
    type RecvHandle = MpiRecvHandle;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> Self::SendHandle {
        let boxed = buf.to_vec().into_boxed_slice();
        let raw: *mut [u8] = Box::into_raw(boxed);
        // SAFETY: raw stays live until the handle reclaims it.
        let slice: &'static [u8] = unsafe { &*raw };
        let req = self.world.process_at_rank(peer as i32).immediate_send_with_tag(
            StaticScope,
            slice,
            tag.as_u16() as i32,
        );
        MpiSendHandle {
            req: Some(req),
            buf: Some(unsafe { NonNull::new_unchecked(raw) }),
        }
    }

    fn irecv(&self, peer: usize, tag: CommTag, len: usize) -> Self::RecvHandle {
        let boxed = vec![0u8; len].into_boxed_slice();
        let raw: *mut [u8] = Box::into_raw(boxed);
        // SAFETY: raw stays live until the handle reclaims it.
        let slice: &'static mut [u8] = unsafe { &mut *raw };
        let req = self
            .world
            .process_at_rank(peer as i32)
            .immediate_receive_into_with_tag(StaticScope, slice, tag.as_u16() as i32);
        MpiRecvHandle {
            req: Some(req),
            buf: Some(unsafe { NonNull::new_unchecked(raw) }),
        }
    }

    fn barrier(&self) {
        self.world.barrier();
    }

    fn alltoall_counts(&self, send: &[usize]) -> Vec<usize> {
        let send: Vec<Count> = send.iter().map(|&c| c as Count).collect();
        let mut recv = vec![0 as Count; self.size];
        self.world.all_to_all_into(&send[..], &mut recv[..]);
        recv.into_iter().map(|c| c as usize).collect()
    }

    fn allreduce_or(&self, value: bool) -> bool {
        let send = value as i32;
        let mut recv = 0i32;
        self.world
            .all_reduce_into(&send, &mut recv, SystemOperation::logical_or());
        recv != 0
    }

    fn alltoallv(
        &self,
        send: &[u32],
        send_counts: &[usize],
        send_displs: &[usize],
        recv: &mut [u32],
        recv_counts: &[usize],
        recv_displs: &[usize],
    ) {
        let sc: Vec<Count> = send_counts.iter().map(|&c| c as Count).collect();
        let sd: Vec<Count> = send_displs.iter().map(|&d| d as Count).collect();
        let rc: Vec<Count> = recv_counts.iter().map(|&c| c as Count).collect();
        let rd: Vec<Count> = recv_displs.iter().map(|&d| d as Count).collect();

        let send_part = mpi::datatype::Partition::new(send, &sc[..], &sd[..]);
        let mut recv_part = mpi::datatype::PartitionMut::new(recv, &rc[..], &rd[..]);
        self.world.all_to_all_varcount_into(&send_part, &mut recv_part);
    }
}
