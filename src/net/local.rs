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

//! In-process communication backend.
//!
//! A [`LocalGroup`] hosts `size` ranks inside one process, typically one
//! thread per rank. Point-to-point messages travel through per
//! `(src, dst, tag)` FIFO mailboxes, so successive operations on the same
//! channel match in posting order, which the gather engine relies on.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use super::{CommTag, Communicator, PollWait, Wait};

type Key = (usize, usize, u16); // (src, dst, tag)

#[derive(Default)]
struct Slot {
    q: VecDeque<Vec<u8>>,
    // receives match in posting order, like MPI message matching
    next_ticket: u64,
    served: u64,
}

struct EpochBarrier {
    arrived: usize,
    epoch: usize,
}

struct Shared {
    size: usize,
    map: Mutex<HashMap<Key, Arc<(Mutex<Slot>, Condvar)>>>,
    barrier: (Mutex<EpochBarrier>, Condvar),
}

impl Shared {
    fn mailbox(&self, key: Key) -> Arc<(Mutex<Slot>, Condvar)> {
        let mut g = self.map.lock().expect("mailbox map poisoned");
        g.entry(key)
            .or_insert_with(|| Arc::new((Mutex::new(Slot::default()), Condvar::new())))
            .clone()
    }
}

/// Factory for the per-rank endpoints of one in-process group.
pub struct LocalGroup {
    shared: Arc<Shared>,
}

impl LocalGroup {
    pub fn new(size: usize) -> Self {
        assert!(size > 0);
        Self {
            shared: Arc::new(Shared {
                size,
                map: Mutex::new(HashMap::new()),
                barrier: (
                    Mutex::new(EpochBarrier {
                        arrived: 0,
                        epoch: 0,
                    }),
                    Condvar::new(),
                ),
            }),
        }
    }

    /// Endpoint for `rank`; hand each one to its own thread.
    pub fn comm(&self, rank: usize) -> LocalComm {
        assert!(rank < self.shared.size);
        LocalComm {
            rank,
            shared: self.shared.clone(),
        }
    }

    /// All endpoints in rank order.
    pub fn comms(&self) -> Vec<LocalComm> {
        (0..self.shared.size).map(|r| self.comm(r)).collect()
    }
}

/// One rank's endpoint in a [`LocalGroup`].
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    shared: Arc<Shared>,
}

pub struct LocalSendHandle {
    done: bool,
}

impl Wait for LocalSendHandle {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl PollWait for LocalSendHandle {
    fn try_complete(&mut self) -> Option<Vec<u8>> {
        // local sends are buffered, hence complete at posting time
        if self.done {
            None
        } else {
            self.done = true;
            Some(Vec::new())
        }
    }
}

pub struct LocalRecvHandle {
    cell: Arc<(Mutex<Slot>, Condvar)>,
    ticket: u64,
    want_len: usize,
}

impl Wait for LocalRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let (lock, cv) = &*self.cell;
        let mut slot = lock.lock().expect("mailbox poisoned");
        while slot.served != self.ticket || slot.q.is_empty() {
            slot = cv.wait(slot).expect("mailbox poisoned");
        }
        let msg = slot.q.pop_front().expect("queue non-empty");
        slot.served += 1;
        cv.notify_all();
        debug_assert_eq!(msg.len(), self.want_len);
        Some(msg)
    }
}

impl PollWait for LocalRecvHandle {
    fn try_complete(&mut self) -> Option<Vec<u8>> {
        let (lock, cv) = &*self.cell;
        let mut slot = lock.lock().expect("mailbox poisoned");
        if slot.served != self.ticket {
            return None;
        }
        let msg = slot.q.pop_front()?;
        slot.served += 1;
        cv.notify_all();
        debug_assert_eq!(msg.len(), self.want_len);
        Some(msg)
    }
}

impl Communicator for LocalComm {
    type SendHandle = LocalSendHandle;
    type RecvHandle = LocalRecvHandle;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> Self::SendHandle {
        let entry = self.shared.mailbox((self.rank, peer, tag.as_u16()));
        let (lock, cv) = &*entry;
        {
            let mut slot = lock.lock().expect("mailbox poisoned");
            slot.q.push_back(buf.to_vec());
        }
        cv.notify_all();
        LocalSendHandle { done: false }
    }

    fn irecv(&self, peer: usize, tag: CommTag, len: usize) -> Self::RecvHandle {
        let cell = self.shared.mailbox((peer, self.rank, tag.as_u16()));
        let ticket = {
            let mut slot = cell.0.lock().expect("mailbox poisoned");
            let t = slot.next_ticket;
            slot.next_ticket += 1;
            t
        };
        LocalRecvHandle {
            cell,
            ticket,
            want_len: len,
        }
    }

    fn barrier(&self) {
        let (lock, cv) = &self.shared.barrier;
        let mut b = lock.lock().expect("barrier poisoned");
        let entered = b.epoch;
        b.arrived += 1;
        if b.arrived == self.shared.size {
            b.arrived = 0;
            b.epoch += 1;
            cv.notify_all();
        } else {
            while b.epoch == entered {
                b = cv.wait(b).expect("barrier poisoned");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn point_to_point_fifo_per_channel() {
        let group = LocalGroup::new(2);
        let a = group.comm(0);
        let b = group.comm(1);

        a.isend(1, CommTag::new(9), &[1]);
        a.isend(1, CommTag::new(9), &[2]);
        assert_eq!(b.irecv(0, CommTag::new(9), 1).wait().unwrap(), vec![1]);
        assert_eq!(b.irecv(0, CommTag::new(9), 1).wait().unwrap(), vec![2]);
    }

    #[test]
    fn allreduce_or_across_threads() {
        let group = LocalGroup::new(3);
        let handles: Vec<_> = group
            .comms()
            .into_iter()
            .map(|c| {
                thread::spawn(move || {
                    let mine = c.rank() == 1;
                    c.allreduce_or(mine)
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn alltoallv_round_trip() {
        let group = LocalGroup::new(2);
        let handles: Vec<_> = group
            .comms()
            .into_iter()
            .map(|c| {
                thread::spawn(move || {
                    let me = c.rank() as u32;
                    // two words for each peer, stamped with the sender
                    let send = vec![me * 10, me * 10 + 1, me * 10 + 2, me * 10 + 3];
                    let counts = vec![2usize, 2];
                    let displs = vec![0usize, 2];
                    let mut recv = vec![0u32; 4];
                    c.alltoallv(&send, &counts, &displs, &mut recv, &counts, &displs);
                    recv
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], vec![0, 1, 10, 11]);
        assert_eq!(results[1], vec![2, 3, 12, 13]);
    }
}
