//! N-way merge of finalized partition graphs into the paged file.
//!
//! Each partition arrives sorted ascending by global id and contributes one
//! live cursor to a min-heap keyed `(global id, partition index)`; the
//! secondary key makes draining order deterministic. A vertex present in a
//! single partition has its adjacency copied verbatim; a vertex present in
//! several has the neighbor sets unioned, and an over-capacity union is cut
//! down to `max_degree` by taking a seeded uniform random subset.
//!
//! The merge asserts that global ids come out gap-free: the i-th record
//! written must be global id i.

use crate::disk::PagedFile;
use crate::graph::PartitionGraph;
use crate::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use tracing::info;

pub(crate) fn merge_partitions(
    paged: &mut PagedFile,
    partitions: &[PartitionGraph],
    rng: &mut StdRng,
) -> Result<()> {
    let max_degree = paged.max_degree();

    // cursors[p] is the next local index of partition p to enter the heap;
    // the heap holds at most one entry per partition, for local cursors[p]-1.
    let mut cursors = vec![0usize; partitions.len()];
    let mut heap: BinaryHeap<Reverse<(u32, u32)>> = BinaryHeap::with_capacity(partitions.len());

    for (p, partition) in partitions.iter().enumerate() {
        if partition.size() > 0 {
            heap.push(Reverse((partition.global_index(0), p as u32)));
            cursors[p] = 1;
        }
    }

    let mut neighbours = vec![0u32; max_degree];
    let mut union: HashSet<u32> = HashSet::with_capacity(2 * max_degree);
    let mut union_sorted: Vec<u32> = Vec::with_capacity(2 * max_degree);
    let mut result_index = 0usize;

    while let Some(Reverse((global_index, p))) = heap.pop() {
        assert_eq!(
            result_index as u32, global_index,
            "global id gap in partition merge"
        );

        let partition = &partitions[p as usize];
        let local = cursors[p as usize] - 1;
        if cursors[p as usize] < partition.size() {
            heap.push(Reverse((
                partition.global_index(cursors[p as usize]),
                p,
            )));
            cursors[p as usize] += 1;
        }

        let more_of_same = heap
            .peek()
            .is_some_and(|Reverse((next, _))| *next == global_index);

        if !more_of_same {
            // Single source: copy the adjacency as-is.
            let count = partition.fetch_neighbours(local, &mut neighbours);
            paged.write_edges(global_index as usize, &neighbours[..count]);
        } else {
            union.clear();
            let count = partition.fetch_neighbours(local, &mut neighbours);
            union.extend(neighbours[..count].iter().copied());

            while let Some(&Reverse((next, q))) = heap.peek() {
                if next != global_index {
                    break;
                }
                heap.pop();

                let partition = &partitions[q as usize];
                let local = cursors[q as usize] - 1;
                if cursors[q as usize] < partition.size() {
                    heap.push(Reverse((
                        partition.global_index(cursors[q as usize]),
                        q,
                    )));
                    cursors[q as usize] += 1;
                }

                let count = partition.fetch_neighbours(local, &mut neighbours);
                union.extend(neighbours[..count].iter().copied());
            }

            union_sorted.clear();
            union_sorted.extend(union.iter().copied());
            union_sorted.sort_unstable();

            if union_sorted.len() > max_degree {
                union_sorted.shuffle(rng);
                union_sorted.truncate(max_degree);
            }
            paged.write_edges(global_index as usize, &union_sorted);
        }

        result_index += 1;
    }

    assert_eq!(
        result_index,
        paged.vertex_count(),
        "partition merge did not cover every vertex"
    );

    paged.flush()?;
    info!(vertices = result_index, "partition merge finished");
    Ok(())
}
