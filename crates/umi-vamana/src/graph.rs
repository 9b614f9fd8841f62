//! Mutable per-partition graph used during construction.
//!
//! Each partition holds full-precision copies of its member vectors in
//! process memory and keeps the adjacency and local-to-global id arrays in
//! memory-mapped scratch files that are deleted when the partition is
//! dropped. Per-vertex adjacency is guarded by a versioned seqlock: an odd
//! version means one mutator holds the vertex exclusively, readers retry on
//! any version change. Every vertex is written by exactly one build thread,
//! so writers never contend; the lock exists to keep concurrent readers from
//! observing torn adjacency.
//!
//! Layout of the edges scratch file: `(max_degree + 1)` u32 words per vertex,
//! word 0 is the current degree, the following words are neighbor ids. Ids
//! are partition-local until [`PartitionGraph::convert_local_edges_to_global`]
//! runs, global afterwards.

use crate::candidates::BoundedGreedyVertexQueue;
use crate::Result;
use memmap2::MmapMut;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use umi_vector::DistanceKind;

/// Per-worker scratch reused across prune calls.
pub(crate) struct BuildScratch {
    visited: HashSet<u32>,
    queue: BoundedGreedyVertexQueue,
    checked: HashMap<u32, f32>,
    neighbours: Vec<u32>,
    batch: Vec<u32>,
    pool: Vec<(u32, f32)>,
    survivors: Vec<(u32, f32)>,
    removed: Vec<(u32, f32)>,
    kept: Vec<u32>,
}

impl BuildScratch {
    pub(crate) fn new(search_list_size: usize, max_degree: usize) -> Self {
        Self {
            visited: HashSet::with_capacity(4 * search_list_size),
            queue: BoundedGreedyVertexQueue::new(search_list_size),
            checked: HashMap::with_capacity(2 * search_list_size),
            neighbours: vec![0u32; max_degree],
            batch: Vec::with_capacity(4),
            pool: Vec::with_capacity(2 * search_list_size),
            survivors: Vec::with_capacity(2 * search_list_size),
            removed: Vec::with_capacity(2 * search_list_size),
            kept: Vec::with_capacity(max_degree),
        }
    }
}

/// A memory-mapped scratch file, deleted on drop.
///
/// The raw pointer aliases the mapping so that vertices can be mutated
/// through `&self` under the per-vertex lock protocol.
struct ScratchFile {
    mmap: Option<MmapMut>,
    ptr: *mut u8,
    path: PathBuf,
}

// Access through `ptr` is serialized by the per-vertex seqlock.
unsafe impl Send for ScratchFile {}
unsafe impl Sync for ScratchFile {}

impl ScratchFile {
    fn create(path: PathBuf, bytes: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(bytes.max(1) as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();
        debug!(path = %path.display(), bytes, "created partition scratch file");
        Ok(Self {
            mmap: Some(mmap),
            ptr,
            path,
        })
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        self.mmap.take();
        if let Err(error) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), %error, "failed to delete scratch file");
        }
    }
}

/// Mutable graph over one partition's vertices.
pub(crate) struct PartitionGraph {
    size: usize,
    dimensions: usize,
    max_degree: usize,
    kind: DistanceKind,
    alpha: f32,
    /// Full-precision member vectors; freed by `save_vectors_to_disk`.
    vectors: Vec<f32>,
    edges: ScratchFile,
    global_indexes: ScratchFile,
    edge_versions: Vec<AtomicU64>,
    medoid: Option<u32>,
}

impl PartitionGraph {
    pub(crate) fn new(
        capacity: usize,
        partition: usize,
        name: &str,
        dir: &Path,
        dimensions: usize,
        max_degree: usize,
        kind: DistanceKind,
        alpha: f32,
    ) -> Result<Self> {
        assert!(capacity > 0, "empty partitions are skipped by the build");

        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_nanos();
        let edges_path = dir.join(format!("{name}-{partition}{ts}.edges"));
        let global_path = dir.join(format!("{name}-{partition}{ts}.globalIndexes"));

        let edges = ScratchFile::create(edges_path, capacity * (max_degree + 1) * 4)?;
        let global_indexes = ScratchFile::create(global_path, capacity * 4)?;

        Ok(Self {
            size: 0,
            dimensions,
            max_degree,
            kind,
            alpha,
            vectors: vec![0.0f32; capacity * dimensions],
            edges,
            global_indexes,
            edge_versions: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            medoid: None,
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn max_degree(&self) -> usize {
        self.max_degree
    }

    /// Append a member vector with its global id.
    pub(crate) fn add_vector(&mut self, global_index: u32, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dimensions);
        let start = self.size * self.dimensions;
        self.vectors[start..start + self.dimensions].copy_from_slice(vector);
        self.set_global_index(self.size, global_index);
        self.size += 1;
    }

    pub(crate) fn vector(&self, vertex: usize) -> &[f32] {
        let start = vertex * self.dimensions;
        &self.vectors[start..start + self.dimensions]
    }

    pub(crate) fn global_index(&self, vertex: usize) -> u32 {
        debug_assert!(vertex < self.size);
        unsafe { *(self.global_indexes.ptr as *const u32).add(vertex) }
    }

    fn set_global_index(&self, vertex: usize, global_index: u32) {
        unsafe { *(self.global_indexes.ptr as *mut u32).add(vertex) = global_index }
    }

    #[inline]
    fn edge_base(&self, vertex: usize) -> *mut u32 {
        unsafe { (self.edges.ptr as *mut u32).add(vertex * (self.max_degree + 1)) }
    }

    // ----- seqlock -----

    /// Lock a vertex for mutation: version even -> odd.
    ///
    /// Panics when the version is already odd. Each vertex is owned by a
    /// single mutator thread, so an odd version here means a re-entrant
    /// acquire, which is a bug.
    pub(crate) fn acquire_vertex(&self, vertex: usize) {
        let version = &self.edge_versions[vertex];
        loop {
            let current = version.load(Ordering::Acquire);
            assert!(current & 1 == 0, "vertex {vertex} is already acquired");
            if version
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Unlock a vertex: version odd -> even, one higher than before acquire.
    pub(crate) fn release_vertex(&self, vertex: usize) {
        let version = &self.edge_versions[vertex];
        let current = version.load(Ordering::Relaxed);
        assert!(current & 1 == 1, "vertex {vertex} is not acquired");
        version.store(current + 1, Ordering::Release);
    }

    fn assert_locked(&self, vertex: usize) {
        let version = self.edge_versions[vertex].load(Ordering::Relaxed);
        assert!(version & 1 == 1, "vertex {vertex} is not acquired");
    }

    /// Seqlock read of a vertex's adjacency into `out` (length >= max
    /// degree). Returns the degree. Retries while a writer holds the vertex
    /// or the version moved during the read.
    pub(crate) fn fetch_neighbours(&self, vertex: usize, out: &mut [u32]) -> usize {
        let version = &self.edge_versions[vertex];
        loop {
            let before = version.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }

            let base = self.edge_base(vertex);
            // Volatile: the compiler must not fuse or elide reads that race
            // with a writer; the version check below validates them.
            let count = (unsafe { ptr::read_volatile(base) } as usize).min(self.max_degree);
            unsafe { ptr::copy_nonoverlapping(base.add(1) as *const u32, out.as_mut_ptr(), count) };

            fence(Ordering::Acquire);
            if version.load(Ordering::Relaxed) == before {
                return count;
            }
        }
    }

    /// Replace a locked vertex's adjacency.
    pub(crate) fn set_neighbours(&self, vertex: usize, neighbours: &[u32]) {
        self.assert_locked(vertex);
        assert!(neighbours.len() <= self.max_degree);

        let base = self.edge_base(vertex);
        unsafe {
            ptr::copy_nonoverlapping(neighbours.as_ptr(), base.add(1), neighbours.len());
            ptr::write_volatile(base, neighbours.len() as u32);
        }
    }

    /// Append one neighbor to a locked vertex.
    pub(crate) fn append_neighbour(&self, vertex: usize, neighbour: u32) {
        self.assert_locked(vertex);

        let base = self.edge_base(vertex);
        let count = unsafe { ptr::read_volatile(base) } as usize;
        assert!(count + 1 <= self.max_degree);
        unsafe {
            ptr::write_volatile(base.add(1 + count), neighbour);
            ptr::write_volatile(base, (count + 1) as u32);
        }
    }

    /// Read and clear a locked vertex's adjacency. Returns the old degree.
    fn take_neighbours(&self, vertex: usize, out: &mut [u32]) -> usize {
        self.assert_locked(vertex);

        let base = self.edge_base(vertex);
        let count = (unsafe { ptr::read_volatile(base) } as usize).min(self.max_degree);
        unsafe {
            ptr::copy_nonoverlapping(base.add(1) as *const u32, out.as_mut_ptr(), count);
            ptr::write_volatile(base, 0);
        }
        count
    }

    // ----- construction -----

    /// Seed every vertex with `min(size - 1, max_degree)` random distinct
    /// neighbors. Draws come from one shuffled permutation shared across
    /// vertices, reshuffled when exhausted; self-loops and duplicates are
    /// skipped.
    pub(crate) fn generate_random_edges(&mut self, rng: &mut StdRng) {
        if self.size <= 1 {
            return;
        }

        let mut shuffled: Vec<u32> = (0..self.size as u32).collect();
        shuffled.shuffle(rng);
        let max_edges = (self.size - 1).min(self.max_degree);

        let mut cursor = 0usize;
        let mut picked: Vec<u32> = Vec::with_capacity(max_edges);

        for vertex in 0..self.size {
            picked.clear();
            while picked.len() < max_edges {
                let candidate = shuffled[cursor];
                cursor += 1;
                if cursor == self.size {
                    shuffled.shuffle(rng);
                    cursor = 0;
                }
                if candidate as usize == vertex || picked.contains(&candidate) {
                    continue;
                }
                picked.push(candidate);
            }

            let base = self.edge_base(vertex);
            unsafe {
                ptr::copy_nonoverlapping(picked.as_ptr(), base.add(1), picked.len());
                ptr::write_volatile(base, picked.len() as u32);
            }
        }
    }

    /// Local id of the vertex nearest the partition's mean vector. Computed
    /// once and cached.
    pub(crate) fn medoid(&mut self) -> u32 {
        if let Some(medoid) = self.medoid {
            return medoid;
        }
        let medoid = self.calculate_medoid();
        self.medoid = Some(medoid);
        medoid
    }

    fn calculate_medoid(&self) -> u32 {
        if self.size == 1 {
            return 0;
        }

        let mut mean = vec![0.0f32; self.dimensions];
        for vertex in 0..self.size {
            for (slot, &value) in mean.iter_mut().zip(self.vector(vertex)) {
                *slot += value;
            }
        }
        for slot in mean.iter_mut() {
            *slot /= self.size as f32;
        }

        let mut best = 0u32;
        let mut best_distance = f32::INFINITY;
        for vertex in 0..self.size {
            let distance = self.kind.distance(self.vector(vertex), &mean);
            if distance < best_distance {
                best_distance = distance;
                best = vertex as u32;
            }
        }
        best
    }

    /// Greedy best-first walk from `start` toward `vertex` over precise
    /// in-memory distances, recording every expanded candidate, then robust
    /// prune of `vertex` over the recorded set.
    pub(crate) fn greedy_search_prune(&self, start: u32, vertex: u32, scratch: &mut BuildScratch) {
        scratch.visited.clear();
        scratch.queue.clear();
        scratch.checked.clear();
        scratch.batch.clear();

        let query = self.vector(vertex as usize);
        let start_distance = self.kind.distance(self.vector(start as usize), query);
        scratch.queue.push(start, start_distance, false);
        scratch.visited.insert(start);

        let mut result = [0.0f32; 4];
        while let Some(position) = scratch.queue.next_not_checked() {
            let current = scratch.queue.id_at(position);
            scratch
                .checked
                .insert(current, scratch.queue.distance_at(position));

            let count = self.fetch_neighbours(current as usize, &mut scratch.neighbours);
            for i in 0..count {
                let neighbour = scratch.neighbours[i];
                if scratch.visited.insert(neighbour) {
                    scratch.batch.push(neighbour);
                    if scratch.batch.len() == 4 {
                        self.kind.distance4(
                            query,
                            self.vector(scratch.batch[0] as usize),
                            self.vector(scratch.batch[1] as usize),
                            self.vector(scratch.batch[2] as usize),
                            self.vector(scratch.batch[3] as usize),
                            &mut result,
                        );
                        for (lane, &id) in scratch.batch.iter().enumerate() {
                            scratch.queue.push(id, result[lane], false);
                        }
                        scratch.batch.clear();
                    }
                }
            }

            for i in 0..scratch.batch.len() {
                let id = scratch.batch[i];
                let distance = self.kind.distance(query, self.vector(id as usize));
                scratch.queue.push(id, distance, false);
            }
            scratch.batch.clear();
        }

        self.robust_prune(vertex, scratch);
    }

    /// Robust prune of `vertex` over the candidates in `scratch.checked`
    /// (distance NaN = not yet computed). Keeps at most `max_degree`
    /// neighbors balancing proximity against diversity; the diversity
    /// threshold escalates from 1.0 by factors of 1.2 up to the configured
    /// alpha whenever the keep list comes up short.
    pub(crate) fn robust_prune(&self, vertex: u32, scratch: &mut BuildScratch) {
        let v = vertex as usize;
        self.acquire_vertex(v);

        let BuildScratch {
            checked,
            neighbours,
            batch,
            pool,
            survivors,
            removed,
            kept,
            ..
        } = scratch;

        // Merge the current adjacency into the candidate set, distances
        // pending.
        let count = self.take_neighbours(v, neighbours);
        for &neighbour in neighbours[..count].iter() {
            checked.entry(neighbour).or_insert(f32::NAN);
        }
        checked.remove(&vertex);

        let query = self.vector(v);
        pool.clear();
        batch.clear();
        let mut result = [0.0f32; 4];

        for (&id, &distance) in checked.iter() {
            if distance.is_nan() {
                batch.push(id);
                if batch.len() == 4 {
                    self.kind.distance4(
                        query,
                        self.vector(batch[0] as usize),
                        self.vector(batch[1] as usize),
                        self.vector(batch[2] as usize),
                        self.vector(batch[3] as usize),
                        &mut result,
                    );
                    for (lane, &id) in batch.iter().enumerate() {
                        pool.push((id, result[lane]));
                    }
                    batch.clear();
                }
            } else {
                pool.push((id, distance));
            }
        }
        for &id in batch.iter() {
            pool.push((id, self.kind.distance(query, self.vector(id as usize))));
        }
        batch.clear();

        pool.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        kept.clear();
        removed.clear();

        let alpha = self.alpha as f64;
        let mut current_alpha = 1.0f64;
        'escalate: while current_alpha <= alpha {
            if !removed.is_empty() {
                pool.extend(removed.drain(..));
                pool.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            }

            while !pool.is_empty() {
                let (best, _) = pool.remove(0);
                kept.push(best);
                if kept.len() == self.max_degree {
                    break 'escalate;
                }

                let best_vector = self.vector(best as usize);
                survivors.clear();
                for chunk in pool.chunks(4) {
                    if chunk.len() == 4 {
                        self.kind.distance4(
                            best_vector,
                            self.vector(chunk[0].0 as usize),
                            self.vector(chunk[1].0 as usize),
                            self.vector(chunk[2].0 as usize),
                            self.vector(chunk[3].0 as usize),
                            &mut result,
                        );
                    } else {
                        for (lane, candidate) in chunk.iter().enumerate() {
                            result[lane] =
                                self.kind.distance(best_vector, self.vector(candidate.0 as usize));
                        }
                    }
                    for (lane, &candidate) in chunk.iter().enumerate() {
                        if result[lane] as f64 * current_alpha <= candidate.1 as f64 {
                            removed.push(candidate);
                        } else {
                            survivors.push(candidate);
                        }
                    }
                }
                std::mem::swap(pool, survivors);
            }

            current_alpha *= 1.2;
        }

        kept.reverse();
        self.set_neighbours(v, kept);
        self.release_vertex(v);

        checked.clear();
        pool.clear();
        removed.clear();
    }

    /// Back-edge handler: make `vertex` point at `neighbour`.
    ///
    /// Appends when there is room; a full vertex is re-pruned with the
    /// neighbour as an extra candidate. No-op when the edge already exists.
    /// Must only be called from the mutator owning `vertex`.
    pub(crate) fn insert_back_edge(&self, vertex: u32, neighbour: u32, scratch: &mut BuildScratch) {
        let v = vertex as usize;
        let count = self.fetch_neighbours(v, &mut scratch.neighbours);
        if scratch.neighbours[..count].contains(&neighbour) {
            return;
        }

        if count < self.max_degree {
            self.acquire_vertex(v);
            self.append_neighbour(v, neighbour);
            self.release_vertex(v);
        } else {
            scratch.checked.clear();
            scratch.checked.insert(neighbour, f32::NAN);
            self.robust_prune(vertex, scratch);
        }
    }

    // ----- post-build -----

    /// Copy every member vector into its final paged slot, skipping writes
    /// whose destination already matches, then free the in-memory copies.
    pub(crate) fn save_vectors_to_disk(&mut self, paged: &mut crate::disk::PagedFile) {
        for vertex in 0..self.size {
            let global_index = self.global_index(vertex);
            paged.write_vector_if_changed(global_index as usize, self.vector(vertex));
        }
        self.vectors = Vec::new();
    }

    /// Rewrite every edge from a partition-local id to its global id.
    pub(crate) fn convert_local_edges_to_global(&mut self) {
        let mut neighbours = vec![0u32; self.max_degree];
        for vertex in 0..self.size {
            let count = self.fetch_neighbours(vertex, &mut neighbours);
            for slot in neighbours[..count].iter_mut() {
                *slot = self.global_index(*slot as usize);
            }

            self.acquire_vertex(vertex);
            self.set_neighbours(vertex, &neighbours[..count]);
            self.release_vertex(vertex);
        }
    }

    /// Permute vertices so that local order matches ascending global id,
    /// walking each permutation cycle with a pair of swap buffers.
    pub(crate) fn sort_edges_by_global_index(&mut self) {
        let size = self.size;
        let mut indexes: Vec<u32> = (0..size as u32).collect();
        indexes.sort_by_key(|&i| self.global_index(i as usize));

        let mut inverted = vec![0u32; size];
        for (position, &index) in indexes.iter().enumerate() {
            inverted[index as usize] = position as u32;
        }

        let mut processed = vec![false; size];
        let mut incoming = vec![0u32; self.max_degree];
        let mut displaced = vec![0u32; self.max_degree];

        for start in 0..size {
            if processed[start] {
                continue;
            }

            let mut current = start;
            let source = indexes[current] as usize;
            let mut incoming_count = self.fetch_neighbours(source, &mut incoming);
            let mut global_to_assign = self.global_index(source);

            while !processed[current] {
                let displaced_count = self.fetch_neighbours(current, &mut displaced);
                let displaced_global = self.global_index(current);

                self.set_global_index(current, global_to_assign);
                self.acquire_vertex(current);
                self.set_neighbours(current, &incoming[..incoming_count]);
                self.release_vertex(current);

                std::mem::swap(&mut incoming, &mut displaced);
                incoming_count = displaced_count;
                global_to_assign = displaced_global;

                processed[current] = true;
                current = inverted[current] as usize;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn grid_graph(dir: &Path, vectors: &[(u32, [f32; 2])], max_degree: usize) -> PartitionGraph {
        let mut graph = PartitionGraph::new(
            vectors.len(),
            0,
            "test",
            dir,
            2,
            max_degree,
            DistanceKind::L2,
            1.2,
        )
        .unwrap();
        for (global, vector) in vectors {
            graph.add_vector(*global, vector);
        }
        graph
    }

    #[test]
    fn test_random_edges_are_valid() {
        let dir = tempdir().unwrap();
        let vectors: Vec<(u32, [f32; 2])> =
            (0..20).map(|i| (i, [i as f32, (i * 3 % 7) as f32])).collect();
        let mut graph = grid_graph(dir.path(), &vectors, 4);

        let mut rng = StdRng::seed_from_u64(1);
        graph.generate_random_edges(&mut rng);

        let mut buf = vec![0u32; 4];
        for v in 0..20 {
            let count = graph.fetch_neighbours(v, &mut buf);
            assert_eq!(count, 4);
            let edges = &buf[..count];
            assert!(!edges.contains(&(v as u32)), "self loop at {v}");
            let mut deduped = edges.to_vec();
            deduped.sort_unstable();
            deduped.dedup();
            assert_eq!(deduped.len(), count, "duplicate edge at {v}");
            assert!(edges.iter().all(|&e| (e as usize) < 20));
        }
    }

    #[test]
    fn test_medoid_of_line_is_middle() {
        let dir = tempdir().unwrap();
        let vectors: Vec<(u32, [f32; 2])> = (0..5).map(|i| (i, [i as f32, 0.0])).collect();
        let mut graph = grid_graph(dir.path(), &vectors, 3);
        assert_eq!(graph.medoid(), 2);
    }

    #[test]
    fn test_robust_prune_respects_degree_cap() {
        let dir = tempdir().unwrap();
        let vectors: Vec<(u32, [f32; 2])> = (0..30)
            .map(|i| (i, [(i % 6) as f32, (i / 6) as f32]))
            .collect();
        let mut graph = grid_graph(dir.path(), &vectors, 4);
        let mut rng = StdRng::seed_from_u64(2);
        graph.generate_random_edges(&mut rng);

        let mut scratch = BuildScratch::new(16, 4);
        let medoid = graph.medoid();
        for v in 0..30u32 {
            graph.greedy_search_prune(medoid, v, &mut scratch);
        }

        let mut buf = vec![0u32; 4];
        for v in 0..30 {
            let count = graph.fetch_neighbours(v, &mut buf);
            assert!(count <= 4);
            assert!(!buf[..count].contains(&(v as u32)));
        }
    }

    #[test]
    fn test_lock_protocol() {
        let dir = tempdir().unwrap();
        let vectors: Vec<(u32, [f32; 2])> = (0..2).map(|i| (i, [i as f32, 0.0])).collect();
        let graph = grid_graph(dir.path(), &vectors, 2);

        graph.acquire_vertex(0);
        graph.append_neighbour(0, 1);
        graph.release_vertex(0);

        let mut buf = vec![0u32; 2];
        assert_eq!(graph.fetch_neighbours(0, &mut buf), 1);
        assert_eq!(buf[0], 1);
    }

    #[test]
    #[should_panic(expected = "already acquired")]
    fn test_reentrant_acquire_panics() {
        let dir = tempdir().unwrap();
        let vectors: Vec<(u32, [f32; 2])> = vec![(0, [0.0, 0.0])];
        let graph = grid_graph(dir.path(), &vectors, 2);
        graph.acquire_vertex(0);
        graph.acquire_vertex(0);
    }

    #[test]
    fn test_sort_edges_by_global_index() {
        let dir = tempdir().unwrap();
        // Global ids deliberately out of order.
        let vectors = vec![
            (30u32, [0.0f32, 0.0]),
            (10, [1.0, 0.0]),
            (20, [2.0, 0.0]),
        ];
        let mut graph = grid_graph(dir.path(), &vectors, 2);

        // Ring in local ids: 0 -> 1, 1 -> 2, 2 -> 0.
        for (v, n) in [(0u32, 1u32), (1, 2), (2, 0)] {
            graph.acquire_vertex(v as usize);
            graph.append_neighbour(v as usize, n);
            graph.release_vertex(v as usize);
        }

        graph.convert_local_edges_to_global();
        graph.sort_edges_by_global_index();

        assert_eq!(
            (0..3).map(|v| graph.global_index(v)).collect::<Vec<_>>(),
            vec![10, 20, 30]
        );

        // Edges are global ids and still describe the same ring.
        let mut buf = vec![0u32; 2];
        assert_eq!(graph.fetch_neighbours(0, &mut buf), 1); // gid 10 -> gid 20
        assert_eq!(buf[0], 20);
        assert_eq!(graph.fetch_neighbours(1, &mut buf), 1); // gid 20 -> gid 30
        assert_eq!(buf[0], 30);
        assert_eq!(graph.fetch_neighbours(2, &mut buf), 1); // gid 30 -> gid 10
        assert_eq!(buf[0], 10);
    }

    #[test]
    fn test_scratch_files_deleted_on_drop() {
        let dir = tempdir().unwrap();
        {
            let vectors: Vec<(u32, [f32; 2])> = vec![(0, [0.0, 0.0])];
            let _graph = grid_graph(dir.path(), &vectors, 2);
            assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_adjacency() {
        let dir = tempdir().unwrap();
        let vectors: Vec<(u32, [f32; 2])> = (0..8).map(|i| (i, [i as f32, 0.0])).collect();
        let graph = grid_graph(dir.path(), &vectors, 8);

        std::thread::scope(|scope| {
            let graph = &graph;
            let reader = scope.spawn(move || {
                let mut buf = vec![0u32; 8];
                for _ in 0..20_000 {
                    let count = graph.fetch_neighbours(0, &mut buf);
                    // The writer only ever installs all-same adjacencies, so
                    // a mixed read means a torn snapshot.
                    let edges = &buf[..count];
                    assert!(edges.windows(2).all(|w| w[0] == w[1]), "torn read: {edges:?}");
                }
            });

            for round in 0u32..2_000 {
                let value = 1 + (round % 7);
                let edges = vec![value; (round % 8) as usize];
                graph.acquire_vertex(0);
                graph.set_neighbours(0, &edges);
                graph.release_vertex(0);
            }
            reader.join().unwrap();
        });
    }
}
