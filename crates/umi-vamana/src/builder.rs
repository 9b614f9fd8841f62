//! Parallel Vamana prune loop.
//!
//! Vertices are assigned statically to `size mod T` mutator workers. Each
//! worker walks its share of a random permutation, harvesting candidates with
//! a greedy search and robust-pruning the vertex, then posts a back-edge
//! request `(u, v)` for every surviving neighbor `u` to the worker owning
//! `u`. Routing every write for a vertex to one fixed thread keeps the
//! per-vertex locks uncontended; the inbound queues are lock-free.
//!
//! Workers alternate between draining their inbox and advancing their vertex
//! list, signal completion once their list is exhausted, and exit when all
//! have signaled and the inboxes are empty. A worker panic propagates out of
//! the scope and aborts the build.

use crate::graph::{BuildScratch, PartitionGraph};
use crossbeam_queue::SegQueue;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

/// Run the prune phase over a freshly random-initialized partition graph.
pub(crate) fn prune_graph(
    graph: &PartitionGraph,
    medoid: u32,
    search_list_size: usize,
    name: &str,
    rng: &mut StdRng,
) {
    let size = graph.size();
    if size == 0 {
        return;
    }

    let mut permutation: Vec<u32> = (0..size as u32).collect();
    permutation.shuffle(rng);

    let cores = std::thread::available_parallelism().map_or(1, |p| p.get());
    let mutators = cores.min(size);

    let mut vertex_lists: Vec<Vec<u32>> = vec![Vec::with_capacity(size / mutators + 1); mutators];
    for &vertex in &permutation {
        vertex_lists[vertex as usize % mutators].push(vertex);
    }

    let inboxes: Vec<SegQueue<(u32, u32)>> = (0..mutators).map(|_| SegQueue::new()).collect();
    let completed = AtomicUsize::new(0);

    info!(size, mutators, "graph pruning started");

    std::thread::scope(|scope| {
        for (mutator, vertices) in vertex_lists.into_iter().enumerate() {
            let inboxes = &inboxes;
            let completed = &completed;
            std::thread::Builder::new()
                .name(format!("{name}-mutator-{mutator}"))
                .spawn_scoped(scope, move || {
                    let mut scratch = BuildScratch::new(search_list_size, graph.max_degree());
                    let mut neighbours = vec![0u32; graph.max_degree()];
                    let mut index = 0usize;

                    loop {
                        let mut inbound = inboxes[mutator].pop();
                        if inbound.is_some() {
                            while let Some((vertex, neighbour)) = inbound {
                                debug_assert_eq!(vertex as usize % mutators, mutator);
                                graph.insert_back_edge(vertex, neighbour, &mut scratch);
                                inbound = inboxes[mutator].pop();
                            }
                        } else if completed.load(Ordering::SeqCst) == mutators {
                            // A peer may have posted a back edge between our
                            // empty pop and its completion signal. Nothing is
                            // pushed after every worker has signaled, so one
                            // final drain leaves the inbox provably empty.
                            while let Some((vertex, neighbour)) = inboxes[mutator].pop() {
                                debug_assert_eq!(vertex as usize % mutators, mutator);
                                graph.insert_back_edge(vertex, neighbour, &mut scratch);
                            }
                            break;
                        }

                        if index < vertices.len() {
                            let vertex = vertices[index];
                            graph.greedy_search_prune(medoid, vertex, &mut scratch);

                            let count = graph.fetch_neighbours(vertex as usize, &mut neighbours);
                            for &neighbour in &neighbours[..count] {
                                inboxes[neighbour as usize % mutators].push((neighbour, vertex));
                            }
                            index += 1;
                        } else if index == vertices.len() {
                            index = usize::MAX;
                            completed.fetch_add(1, Ordering::SeqCst);
                        } else {
                            // Own list exhausted; wait for peers to stop
                            // producing back edges.
                            std::hint::spin_loop();
                        }
                    }
                })
                .expect("failed to spawn mutator thread");
        }
    });

    info!(size, "graph pruning finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use tempfile::tempdir;
    use umi_vector::DistanceKind;

    fn build_partition(count: usize, max_degree: usize) -> (tempfile::TempDir, PartitionGraph) {
        let dir = tempdir().unwrap();
        let mut graph = PartitionGraph::new(
            count,
            0,
            "prune",
            dir.path(),
            4,
            max_degree,
            DistanceKind::L2,
            1.2,
        )
        .unwrap();

        let mut rng = StdRng::seed_from_u64(11);
        for i in 0..count {
            let vector: Vec<f32> = (0..4)
                .map(|_| rand::Rng::gen_range(&mut rng, -1.0f32..1.0))
                .collect();
            graph.add_vector(i as u32, &vector);
        }
        (dir, graph)
    }

    #[test]
    fn test_pruned_graph_is_well_formed() {
        let (_dir, mut graph) = build_partition(120, 8);
        let mut rng = StdRng::seed_from_u64(12);
        graph.generate_random_edges(&mut rng);
        let medoid = graph.medoid();

        prune_graph(&graph, medoid, 24, "prune", &mut rng);

        let mut buf = vec![0u32; 8];
        let mut total_degree = 0usize;
        for v in 0..120 {
            let count = graph.fetch_neighbours(v, &mut buf);
            assert!(count <= 8, "degree cap violated at {v}");
            total_degree += count;

            let edges = &buf[..count];
            assert!(!edges.contains(&(v as u32)), "self loop at {v}");
            let mut deduped = edges.to_vec();
            deduped.sort_unstable();
            deduped.dedup();
            assert_eq!(deduped.len(), count, "duplicate edge at {v}");
            assert!(edges.iter().all(|&e| (e as usize) < 120));
        }
        // Pruning keeps the graph well connected on average.
        assert!(total_degree >= 120 * 2, "suspiciously sparse graph");
    }

    #[test]
    fn test_single_vertex_partition() {
        let (_dir, mut graph) = build_partition(1, 8);
        let mut rng = StdRng::seed_from_u64(13);
        graph.generate_random_edges(&mut rng);
        let medoid = graph.medoid();
        assert_eq!(medoid, 0);

        prune_graph(&graph, medoid, 24, "prune", &mut rng);

        let mut buf = vec![0u32; 8];
        assert_eq!(graph.fetch_neighbours(0, &mut buf), 0);
    }
}
