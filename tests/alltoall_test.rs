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

//! Tests for the asynchronous all-to-all manager.
//!
//! Multi-rank scenarios run every rank on its own thread over a
//! `LocalGroup`; the recording `VecBufferPool` stands in for the host's
//! buffer provider.

use std::sync::Arc;
use std::thread;

use sssp_comm::collect::{weight_bits, weight_from_bits, sentinel, SOURCE_FLAG};
use sssp_comm::net::{Communicator, LocalComm, LocalGroup};
use sssp_comm::{
    AlltoallManager, AlltoallOptions, DedupKind, Delivery, Graph2DCsr, PointerBatch, SsspState,
    VecBufferPool,
};

fn with_ranks<R: Send + 'static>(
    size: usize,
    f: impl Fn(LocalComm) -> R + Send + Sync + 'static,
) -> Vec<R> {
    let group = LocalGroup::new(size);
    let f = Arc::new(f);
    let handles: Vec<_> = group
        .comms()
        .into_iter()
        .map(|comm| {
            let f = f.clone();
            thread::spawn(move || f(comm))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn opts(max_threads: usize) -> AlltoallOptions {
    AlltoallOptions {
        max_threads,
        ..Default::default()
    }
}

fn scratch(graph: &Graph2DCsr, max_threads: usize) -> Vec<i32> {
    vec![-1; graph.num_local_verts as usize * max_threads]
}

/// Pairs of one pointer-origin stream, headers and length words skipped.
fn ptr_pairs(stream: &[u32]) -> Vec<(u32, f32)> {
    let mut pairs = Vec::new();
    let mut i = 0;
    while i < stream.len() {
        assert_ne!(stream[i] & SOURCE_FLAG, 0);
        let block_len = stream[i + 2] as usize;
        for c in (i + 3..i + 3 + block_len).step_by(2) {
            pairs.push((stream[c], weight_from_bits(stream[c + 1])));
        }
        i += 3 + block_len;
    }
    pairs
}

fn pair_words(pairs: &[(u32, f32)]) -> Vec<u32> {
    pairs
        .iter()
        .flat_map(|&(v, w)| [v, weight_bits(w)])
        .collect()
}

// =============================================================================
// Pointer path
// =============================================================================

#[test]
fn pointer_block_filters_and_dedups_across_ranks() {
    let results = with_ranks(2, |comm| {
        let rank = comm.rank();
        let graph = Graph2DCsr::new(
            vec![1, 2, 1, 3],
            vec![2.0, 3.0, 1.5, 4.0],
            8,
            2,
            256,
        );
        let pool = Arc::new(VecBufferPool::new(64, 4096));
        let mut mgr = AlltoallManager::new(comm, pool.clone(), opts(2));
        let mut state = SsspState::bellman_ford(&[]);
        state.with_settled = false;

        if rank == 0 {
            mgr.put_ptr(
                PointerBatch {
                    ptr: 0,
                    header: 0x0000_0001_0000_0002,
                    dist: 1.0,
                    len: 4,
                },
                1,
            );
        }
        let mut vpos = scratch(&graph, 2);
        mgr.run_with_both(&graph, &state, &mut vpos).unwrap();

        assert!(vpos.iter().all(|&p| p == -1));
        assert!(mgr.queues_empty());
        pool.take_received()
    });

    assert!(results[0].is_empty());
    let rank1 = &results[1];
    assert_eq!(rank1.len(), 2);
    assert!(rank1[0].is_pointer_stream);
    // the (1, 3.0) candidate is dominated by (1, 2.5)
    assert_eq!(
        rank1[0].words,
        vec![
            0x0000_0001 | SOURCE_FLAG,
            0x0000_0002,
            6,
            2,
            weight_bits(4.0),
            1,
            weight_bits(2.5),
            3,
            weight_bits(5.0),
        ]
    );
    assert!(!rank1[1].is_pointer_stream);
    assert!(rank1[1].words.is_empty());
}

#[test]
fn light_phase_drops_candidates_at_bucket_bound() {
    let results = with_ranks(1, |comm| {
        let graph = Graph2DCsr::new(vec![1, 2], vec![1.0, 3.0], 8, 2, 256);
        let pool = Arc::new(VecBufferPool::new(64, 1024));
        let mut mgr = AlltoallManager::new(comm, pool.clone(), opts(1));
        let state = SsspState::light(10.0);

        mgr.put_ptr(
            PointerBatch {
                ptr: 0,
                header: 0,
                dist: 8.0,
                len: 2,
            },
            0,
        );
        let mut vpos = scratch(&graph, 1);
        mgr.run_ptr(&graph, &state, &mut vpos).unwrap();
        assert!(vpos.iter().all(|&p| p == -1));
        pool.take_received()
    });

    let streams: Vec<&Delivery> = results[0].iter().filter(|d| !d.words.is_empty()).collect();
    assert_eq!(streams.len(), 1);
    assert_eq!(ptr_pairs(&streams[0].words), vec![(1, 9.0)]);
    // no delivered weight is at or above the bound
    for (_, w) in ptr_pairs(&streams[0].words) {
        assert!(w < 10.0);
    }
}

#[test]
fn settled_targets_are_dropped() {
    let results = with_ranks(2, |comm| {
        let rank = comm.rank();
        let graph = Graph2DCsr::new(vec![7, 9, 7], vec![1.0, 2.0, 0.5], 8, 0, 256);
        // vertex 7 settled everywhere
        let mut settled = vec![0u64; 4];
        settled[7 / 64] |= 1 << (7 % 64);
        let state = SsspState::bellman_ford(&settled);

        let pool = Arc::new(VecBufferPool::new(64, 1024));
        let mut mgr = AlltoallManager::new(comm, pool.clone(), opts(2));
        if rank == 0 {
            mgr.put_ptr(
                PointerBatch {
                    ptr: 0,
                    header: 3,
                    dist: 1.0,
                    len: 3,
                },
                1,
            );
        }
        let mut vpos = scratch(&graph, 2);
        mgr.run_with_both(&graph, &state, &mut vpos).unwrap();
        assert!(vpos.iter().all(|&p| p == -1));
        pool.take_received()
    });

    let delivered: Vec<(u32, f32)> = results[1]
        .iter()
        .filter(|d| d.is_pointer_stream && !d.words.is_empty())
        .flat_map(|d| ptr_pairs(&d.words))
        .collect();
    assert_eq!(delivered, vec![(9, 3.0)]);
}

#[test]
fn heavy_phase_keeps_heavy_batches_and_delayed_overflow() {
    let results = with_ranks(1, |comm| {
        let graph = Graph2DCsr::new(vec![1, 2, 3, 4], vec![5.0, 1.0, 5.0, 1.0], 8, 2, 256);
        let pool = Arc::new(VecBufferPool::new(64, 1024));
        let mut mgr = AlltoallManager::new(comm, pool.clone(), opts(1));
        let state = SsspState::heavy(4.0);

        mgr.put_ptr(
            PointerBatch {
                ptr: 0,
                header: 1 << 63,
                dist: 0.0,
                len: 2,
            },
            0,
        );
        mgr.put_ptr(
            PointerBatch {
                ptr: 2,
                header: 0,
                dist: 0.0,
                len: 2,
            },
            0,
        );
        let mut vpos = scratch(&graph, 1);
        mgr.run_with_both(&graph, &state, &mut vpos).unwrap();
        pool.take_received()
    });

    let delivered: Vec<(u32, f32)> = results[0]
        .iter()
        .filter(|d| d.is_pointer_stream && !d.words.is_empty())
        .flat_map(|d| ptr_pairs(&d.words))
        .collect();
    assert_eq!(delivered, vec![(1, 5.0), (2, 1.0), (3, 5.0)]);
}

// =============================================================================
// Buffer path
// =============================================================================

#[test]
fn buffer_roundtrip_keeps_minimum_weight() {
    let results = with_ranks(1, |comm| {
        let graph = Graph2DCsr::new(vec![], vec![], 8, 2, 256);
        let pool = Arc::new(VecBufferPool::new(64, 1024));
        let mut mgr = AlltoallManager::new(comm, pool.clone(), opts(1));

        mgr.put(&pair_words(&[(5, 1.0)]), 0).unwrap();
        mgr.put(&pair_words(&[(5, 2.0)]), 0).unwrap();
        let mut vpos = scratch(&graph, 1);
        mgr.run_buffer(&graph, &SsspState::presolve(), &mut vpos).unwrap();
        assert!(vpos.iter().all(|&p| p == -1));
        pool.take_received()
    });

    assert_eq!(results[0].len(), 1);
    assert_eq!(results[0][0].words, pair_words(&[(5, 1.0)]));
    assert!(!results[0][0].is_pointer_stream);
}

#[test]
fn buffer_roundtrip_preserves_insertion_order() {
    let results = with_ranks(1, |comm| {
        let graph = Graph2DCsr::new(vec![], vec![], 8, 2, 256);
        let pool = Arc::new(VecBufferPool::new(64, 1024));
        let mut mgr = AlltoallManager::new(comm, pool.clone(), opts(1));

        for v in [10u32, 11, 12, 13] {
            mgr.put(&pair_words(&[(v, v as f32)]), 0).unwrap();
        }
        let mut vpos = scratch(&graph, 1);
        mgr.run_buffer(&graph, &SsspState::presolve(), &mut vpos).unwrap();
        pool.take_received()
    });

    assert_eq!(
        results[0][0].words,
        pair_words(&[(10, 10.0), (11, 11.0), (12, 12.0), (13, 13.0)])
    );
}

#[test]
fn buffer_headers_travel_with_their_pairs() {
    let results = with_ranks(1, |comm| {
        let graph = Graph2DCsr::new(vec![], vec![], 8, 2, 256);
        let pool = Arc::new(VecBufferPool::new(64, 1024));
        let mut mgr = AlltoallManager::new(comm, pool.clone(), opts(1));

        // source header pair, then two candidates for the same vertex
        mgr.put(&[SOURCE_FLAG | 42, 7], 0).unwrap();
        mgr.put(&pair_words(&[(6, 2.0), (6, 1.0)]), 0).unwrap();
        let mut vpos = scratch(&graph, 1);
        mgr.run_buffer(&graph, &SsspState::presolve(), &mut vpos).unwrap();
        pool.take_received()
    });

    assert_eq!(
        results[0][0].words,
        vec![SOURCE_FLAG | 42, 7, 6, weight_bits(1.0)]
    );
}

#[test]
fn hashmap_dedup_matches_positions_dedup_end_to_end() {
    let run = |dedup: DedupKind| {
        with_ranks(1, move |comm| {
            let graph = Graph2DCsr::new(vec![], vec![], 8, 2, 256);
            let pool = Arc::new(VecBufferPool::new(64, 1024));
            let mut options = opts(1);
            options.dedup = dedup;
            let mut mgr = AlltoallManager::new(comm, pool.clone(), options);

            mgr.put(&pair_words(&[(3, 5.0), (9, 2.0), (3, 1.0)]), 0).unwrap();
            let mut vpos = scratch(&graph, 1);
            mgr.run_buffer(&graph, &SsspState::presolve(), &mut vpos).unwrap();
            pool.take_received()
        })
    };

    let positions = run(DedupKind::Positions);
    let hashed = run(DedupKind::HashMap);
    assert_eq!(positions[0][0].words, hashed[0][0].words);
    assert_eq!(
        positions[0][0].words,
        pair_words(&[(9, 2.0), (3, 1.0)])
    );
}

#[test]
fn presolve_skip_keeps_duplicates() {
    let results = with_ranks(1, |comm| {
        let graph = Graph2DCsr::new(vec![], vec![], 8, 2, 256);
        let pool = Arc::new(VecBufferPool::new(64, 1024));
        let mut options = opts(1);
        options.skip_presolve_dedup = true;
        let mut mgr = AlltoallManager::new(comm, pool.clone(), options);

        mgr.put(&pair_words(&[(4, 2.0), (4, 1.0)]), 0).unwrap();
        let mut vpos = scratch(&graph, 1);
        mgr.run_buffer(&graph, &SsspState::presolve(), &mut vpos).unwrap();
        pool.take_received()
    });

    assert_eq!(results[0][0].words, pair_words(&[(4, 2.0), (4, 1.0)]));
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn concurrent_puts_survive_buffer_swaps() {
    const PRODUCERS: usize = 4;
    const PAIRS_PER_PRODUCER: usize = 64;

    let results = with_ranks(1, |comm| {
        let graph = Graph2DCsr::new(vec![], vec![], 8, 2, 256);
        // tiny send buffers force frequent swaps
        let pool = Arc::new(VecBufferPool::new(8, 4096));
        let mut options = opts(1);
        options.skip_presolve_dedup = true;
        let mut mgr = AlltoallManager::new(comm, pool.clone(), options);

        thread::scope(|s| {
            for t in 0..PRODUCERS {
                let mgr = &mgr;
                s.spawn(move || {
                    for k in 0..PAIRS_PER_PRODUCER {
                        let v = ((t * PAIRS_PER_PRODUCER + k) % 256) as u32;
                        mgr.put(&[v, weight_bits(1.0)], 0).unwrap();
                    }
                });
            }
        });

        let mut vpos = scratch(&graph, 1);
        mgr.run_buffer(&graph, &SsspState::presolve(), &mut vpos).unwrap();
        pool.take_received()
    });

    let total_pairs: usize = results[0].iter().map(|d| d.words.len() / 2).sum();
    assert_eq!(total_pairs, PRODUCERS * PAIRS_PER_PRODUCER);
}

// =============================================================================
// Multi-round driver
// =============================================================================

#[test]
fn oversized_pointer_data_drains_over_multiple_rounds() {
    const EDGES: usize = 20;

    let results = with_ranks(2, |comm| {
        let rank = comm.rank();
        let edge_array: Vec<i64> = (0..EDGES as i64).collect();
        let edge_weights = vec![1.0f32; EDGES];
        let graph = Graph2DCsr::new(edge_array, edge_weights, 7, 2, 128);
        // max_words 80: the 43-word pointer expansion exceeds the
        // per-destination budget of 40 and must wait for round 1
        let pool = Arc::new(VecBufferPool::new(64, 80));
        let mut mgr = AlltoallManager::new(comm, pool.clone(), opts(1));
        let mut state = SsspState::bellman_ford(&[]);
        state.with_settled = false;

        if rank == 0 {
            mgr.put(&pair_words(&[(100, 5.0), (101, 6.0)]), 1).unwrap();
            mgr.put_ptr(
                PointerBatch {
                    ptr: 0,
                    header: 0,
                    dist: 1.5,
                    len: EDGES,
                },
                1,
            );
        }
        let mut vpos = scratch(&graph, 1);
        mgr.run_with_both(&graph, &state, &mut vpos).unwrap();

        assert!(vpos.iter().all(|&p| p == -1));
        assert!(mgr.queues_empty());
        (pool.rounds_finished(), pool.take_received())
    });

    // buffer data in round 0, deferred pointer data in round 1, the
    // OR-reduce terminator fires in the round after
    let (rounds, deliveries) = &results[1];
    assert_eq!(*rounds, 2);

    let buffer_pairs: Vec<u32> = deliveries
        .iter()
        .filter(|d| !d.is_pointer_stream)
        .flat_map(|d| d.words.clone())
        .collect();
    assert_eq!(buffer_pairs, pair_words(&[(100, 5.0), (101, 6.0)]));

    let ptr_pairs_delivered: Vec<(u32, f32)> = deliveries
        .iter()
        .filter(|d| d.is_pointer_stream && !d.words.is_empty())
        .flat_map(|d| ptr_pairs(&d.words))
        .collect();
    assert_eq!(ptr_pairs_delivered.len(), EDGES);
    for (i, &(v, w)) in ptr_pairs_delivered.iter().enumerate() {
        assert_eq!(v, i as u32);
        assert_eq!(w, 2.5);
    }

    let (rank0_rounds, rank0_deliveries) = &results[0];
    assert_eq!(*rank0_rounds, 2);
    assert!(rank0_deliveries.is_empty());
}

#[test]
fn pointer_only_driver_respects_thread_budget() {
    const EDGES: usize = 10; // expands to 23 words per destination

    let results = with_ranks(2, |comm| {
        let edge_array: Vec<i64> = (0..EDGES as i64).collect();
        let edge_weights = vec![1.0f32; EDGES];
        let graph = Graph2DCsr::new(edge_array, edge_weights, 7, 2, 128);
        // 45-word budget fits one 23-word destination per round
        let pool = Arc::new(VecBufferPool::new(64, 45));
        let mut mgr = AlltoallManager::new(comm, pool.clone(), opts(1));
        let mut state = SsspState::bellman_ford(&[]);
        state.with_settled = false;

        for target in 0..2 {
            mgr.put_ptr(
                PointerBatch {
                    ptr: 0,
                    header: 0,
                    dist: 0.0,
                    len: EDGES,
                },
                target,
            );
        }
        let mut vpos = scratch(&graph, 1);
        mgr.run_ptr(&graph, &state, &mut vpos).unwrap();

        assert!(vpos.iter().all(|&p| p == -1));
        assert!(mgr.queues_empty());
        (pool.rounds_finished(), pool.take_received())
    });

    for (rounds, deliveries) in &results {
        assert_eq!(*rounds, 2);
        let pairs: Vec<(u32, f32)> = deliveries
            .iter()
            .filter(|d| !d.words.is_empty())
            .flat_map(|d| ptr_pairs(&d.words))
            .collect();
        // one full pointer stream from each rank
        assert_eq!(pairs.len(), 2 * EDGES);
    }
}

#[test]
fn pointer_destination_larger_than_thread_budget_is_fatal() {
    let results = with_ranks(1, |comm| {
        let edge_array: Vec<i64> = (0..30).collect();
        let edge_weights = vec![1.0f32; 30];
        let graph = Graph2DCsr::new(edge_array, edge_weights, 7, 2, 128);
        let pool = Arc::new(VecBufferPool::new(64, 48));
        let mut mgr = AlltoallManager::new(comm, pool, opts(1));
        let mut state = SsspState::bellman_ford(&[]);
        state.with_settled = false;

        // expands to 63 words against a 48-word thread budget
        mgr.put_ptr(
            PointerBatch {
                ptr: 0,
                header: 0,
                dist: 0.0,
                len: 30,
            },
            0,
        );
        let mut vpos = scratch(&graph, 1);
        mgr.run_ptr(&graph, &state, &mut vpos).err()
    });

    let err = results[0].as_ref().expect("budget error");
    assert!(matches!(
        err,
        sssp_comm::CommError::ThreadBudgetExceeded { .. }
    ));
}

#[test]
fn empty_run_terminates_cleanly() {
    let results = with_ranks(2, |comm| {
        let graph = Graph2DCsr::new(vec![], vec![], 8, 2, 256);
        let pool = Arc::new(VecBufferPool::new(64, 1024));
        let mut mgr = AlltoallManager::new(comm, pool.clone(), opts(2));
        let mut state = SsspState::bellman_ford(&[]);
        state.with_settled = false;

        let mut vpos = scratch(&graph, 2);
        mgr.run_with_both(&graph, &state, &mut vpos).unwrap();
        (pool.rounds_finished(), pool.take_received().len())
    });

    for (rounds, deliveries) in results {
        assert_eq!(rounds, 1);
        assert_eq!(deliveries, 0);
    }
}

// =============================================================================
// Stream hygiene
// =============================================================================

#[test]
fn delivered_streams_never_contain_the_sentinel() {
    let results = with_ranks(2, |comm| {
        let rank = comm.rank();
        let edge_array: Vec<i64> = vec![5, 6, 5, 6, 5];
        let edge_weights = vec![3.0, 2.0, 1.0, 4.0, 2.5];
        let graph = Graph2DCsr::new(edge_array, edge_weights, 7, 2, 128);
        let pool = Arc::new(VecBufferPool::new(64, 1024));
        let mut mgr = AlltoallManager::new(comm, pool.clone(), opts(2));
        let mut state = SsspState::bellman_ford(&[]);
        state.with_settled = false;

        let other = 1 - rank;
        mgr.put(&pair_words(&[(9, 4.0), (9, 3.5)]), other).unwrap();
        mgr.put_ptr(
            PointerBatch {
                ptr: 0,
                header: 11,
                dist: 0.5,
                len: 5,
            },
            other,
        );
        let mut vpos = scratch(&graph, 2);
        mgr.run_with_both(&graph, &state, &mut vpos).unwrap();
        pool.take_received()
    });

    for deliveries in &results {
        for d in deliveries {
            if d.words.is_empty() {
                continue;
            }
            let pairs: Vec<(u32, f32)> = if d.is_pointer_stream {
                ptr_pairs(&d.words)
            } else {
                d.words
                    .chunks(2)
                    .filter(|p| p[0] & SOURCE_FLAG == 0)
                    .map(|p| (p[0], weight_from_bits(p[1])))
                    .collect()
            };
            assert!(!pairs.is_empty());
            for (_, w) in pairs {
                assert_ne!(weight_bits(w), sentinel());
            }
        }
    }
}
