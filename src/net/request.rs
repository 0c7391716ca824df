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

//! Request-slot engine driving the pipelined all-gather.
//!
//! A fixed pool of request slots holds in-flight point-to-point operations.
//! Each slot remembers the step handler that posted it; completing a slot
//! feeds the handler's completion counter, and a full step fans back into
//! `next()`, which posts the following step or declares the handler
//! finished. This is the wait-any dispatch loop of the engine, run by the
//! communication thread.

use std::ops::Range;

use super::{bytes_to_words, words_to_bytes, CommTag, Communicator, PollWait};
use crate::error::{CommError, CommResult};

/// One operation a step handler wants posted. Ranges are word ranges into
/// the gather buffer.
#[derive(Debug, Clone)]
pub struct Post {
    pub peer: usize,
    pub tag: CommTag,
    pub kind: PostKind,
}

#[derive(Debug, Clone)]
pub enum PostKind {
    Send(Range<usize>),
    Recv(Range<usize>),
}

/// Stepwise state machine advanced by request completions.
pub trait StepHandler {
    /// Completions required to advance one step.
    fn fanout(&self) -> usize;

    /// Post the next step, or `None` once the handler is done.
    fn next(&mut self) -> Option<Vec<Post>>;
}

enum Op<C: Communicator> {
    Send(C::SendHandle),
    Recv(C::RecvHandle, Range<usize>),
}

struct SlotEntry<C: Communicator> {
    op: Op<C>,
    handler: usize,
}

/// Fixed-size pool of request slots plus the dispatch loop.
pub struct RequestManager<'c, C: Communicator> {
    comm: &'c C,
    slots: Vec<Option<SlotEntry<C>>>,
    free: Vec<usize>,
    active: usize,
}

impl<'c, C: Communicator> RequestManager<'c, C> {
    pub fn new(comm: &'c C, max_requests: usize) -> Self {
        Self {
            comm,
            slots: (0..max_requests).map(|_| None).collect(),
            free: (0..max_requests).collect(),
            active: 0,
        }
    }

    fn post(&mut self, handler: usize, post: Post, buffer: &[u32]) -> CommResult<()> {
        let slot = self.free.pop().ok_or(CommError::RequestPoolExhausted {
            slots: self.slots.len(),
        })?;
        let op = match post.kind {
            PostKind::Send(range) => {
                let bytes = words_to_bytes(&buffer[range]);
                Op::Send(self.comm.isend(post.peer, post.tag, &bytes))
            }
            PostKind::Recv(range) => {
                let handle = self.comm.irecv(post.peer, post.tag, range.len() * 4);
                Op::Recv(handle, range)
            }
        };
        self.slots[slot] = Some(SlotEntry { op, handler });
        self.active += 1;
        Ok(())
    }

    /// Poll until some slot completes; returns its handler index and, for
    /// receives, the landed payload with its word range.
    fn wait_any(&mut self) -> (usize, Option<(Range<usize>, Vec<u8>)>) {
        loop {
            for i in 0..self.slots.len() {
                let Some(entry) = self.slots[i].as_mut() else {
                    continue;
                };
                let done = match &mut entry.op {
                    Op::Send(h) => h.try_complete().map(|_| None),
                    Op::Recv(h, range) => {
                        let range = range.clone();
                        h.try_complete().map(|bytes| Some((range, bytes)))
                    }
                };
                if let Some(payload) = done {
                    let entry = self.slots[i].take().expect("slot occupied");
                    self.free.push(i);
                    self.active -= 1;
                    return (entry.handler, payload);
                }
            }
            std::thread::yield_now();
        }
    }

    /// Launch every handler and dispatch completions until all declare
    /// themselves finished.
    pub fn run(
        &mut self,
        handlers: &mut [&mut dyn StepHandler],
        buffer: &mut [u32],
    ) -> CommResult<()> {
        let mut unfinished = handlers.len();
        let mut complete_count = vec![0usize; handlers.len()];

        for (h, handler) in handlers.iter_mut().enumerate() {
            match handler.next() {
                Some(posts) => {
                    for p in posts {
                        self.post(h, p, buffer)?;
                    }
                }
                None => unfinished -= 1,
            }
        }

        while unfinished > 0 {
            if self.active == 0 {
                return Err(CommError::NoActiveRequest { unfinished });
            }
            let (h, payload) = self.wait_any();
            if let Some((range, bytes)) = payload {
                bytes_to_words(&bytes, &mut buffer[range]);
            }
            complete_count[h] += 1;
            if complete_count[h] == handlers[h].fanout() {
                complete_count[h] = 0;
                match handlers[h].next() {
                    Some(posts) => {
                        for p in posts {
                            self.post(h, p, buffer)?;
                        }
                    }
                    None => unfinished -= 1,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{LocalGroup, TAG_GATHER_X};

    /// Posts nothing but never finishes.
    struct Stuck;

    impl StepHandler for Stuck {
        fn fanout(&self) -> usize {
            1
        }

        fn next(&mut self) -> Option<Vec<Post>> {
            Some(Vec::new())
        }
    }

    /// Posts more self-sends than the pool can hold.
    struct Flood {
        posts: usize,
    }

    impl StepHandler for Flood {
        fn fanout(&self) -> usize {
            self.posts
        }

        fn next(&mut self) -> Option<Vec<Post>> {
            Some(
                (0..self.posts)
                    .map(|_| Post {
                        peer: 0,
                        tag: TAG_GATHER_X,
                        kind: PostKind::Send(0..1),
                    })
                    .collect(),
            )
        }
    }

    #[test]
    fn no_active_request_is_detected() {
        let group = LocalGroup::new(1);
        let comm = group.comm(0);
        let mut req_man = RequestManager::new(&comm, 4);
        let mut stuck = Stuck;
        let mut handlers: [&mut dyn StepHandler; 1] = [&mut stuck];
        let mut buffer = vec![0u32; 4];
        let err = req_man.run(&mut handlers, &mut buffer).unwrap_err();
        assert!(matches!(err, CommError::NoActiveRequest { unfinished: 1 }));
    }

    #[test]
    fn pool_exhaustion_is_detected() {
        let group = LocalGroup::new(1);
        let comm = group.comm(0);
        let mut req_man = RequestManager::new(&comm, 2);
        let mut flood = Flood { posts: 3 };
        let mut handlers: [&mut dyn StepHandler; 1] = [&mut flood];
        let mut buffer = vec![0u32; 4];
        let err = req_man.run(&mut handlers, &mut buffer).unwrap_err();
        assert!(matches!(err, CommError::RequestPoolExhausted { slots: 2 }));
    }
}
