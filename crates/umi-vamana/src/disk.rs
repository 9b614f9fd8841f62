//! Paged on-disk graph layout and beam search.
//!
//! The index file is a sequence of fixed-size pages. Every page starts with
//! the total vertex count as a native-endian u32, followed by packed records
//! of `{ vector: [f32; D], edges: [u32; M], degree: u8 }`, padded to 4-byte
//! alignment. Vertex `g` lives at page `g / vertices_per_page`, record
//! `g % vertices_per_page`; offsets are stable and computed in O(1).
//!
//! Byte order is the machine's native order, so index files are not portable
//! across architectures of different endianness.
//!
//! Search walks the graph best-first: candidates enter the beam with PQ
//! estimated distances, and are re-scored in batches of four with precise
//! distances read from the mapped records before any of them is expanded.

use crate::candidates::BoundedGreedyVertexQueue;
use crate::pq::PqCodec;
use crate::Result;
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::Path;
use tracing::debug;
use umi_vector::DistanceKind;

/// Pages are multiples of this size; a record always fits in one page.
const PAGE_SIZE_MULTIPLIER: usize = 4 * 1024;

/// Derived sizes and offsets of the paged record layout.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordLayout {
    pub(crate) page_size: usize,
    pub(crate) record_size: usize,
    pub(crate) vertices_per_page: usize,
    /// Byte offset of the edge array inside a record.
    edges_offset: usize,
    /// Byte offset of the degree byte inside a record.
    degree_offset: usize,
}

impl RecordLayout {
    pub(crate) fn new(dimensions: usize, max_degree: usize) -> Self {
        let raw = dimensions * 4 + max_degree * 4 + 1;
        // Pad the record to the alignment of its widest field.
        let record_size = (raw + 3) & !3;

        let page_size = if record_size > PAGE_SIZE_MULTIPLIER - 4 {
            ((record_size + PAGE_SIZE_MULTIPLIER - 1 - 4) / (PAGE_SIZE_MULTIPLIER - 4))
                * PAGE_SIZE_MULTIPLIER
        } else {
            PAGE_SIZE_MULTIPLIER
        };

        Self {
            page_size,
            record_size,
            vertices_per_page: (page_size - 4) / record_size,
            edges_offset: dimensions * 4,
            degree_offset: dimensions * 4 + max_degree * 4,
        }
    }

    pub(crate) fn pages_for(&self, count: usize) -> usize {
        count.div_ceil(self.vertices_per_page)
    }

    #[inline]
    fn record_offset(&self, index: usize) -> usize {
        let page = index / self.vertices_per_page;
        let slot = index % self.vertices_per_page;
        page * self.page_size + 4 + slot * self.record_size
    }
}

/// The memory-mapped paged index file.
///
/// Written by a single thread during build (vector save, merge), read-only
/// afterwards. Record offsets are 4-byte aligned by construction; vectors are
/// handed to the distance kernels as raw byte regions, edges are viewed as
/// `u32` words.
pub(crate) struct PagedFile {
    mmap: MmapMut,
    layout: RecordLayout,
    dimensions: usize,
    max_degree: usize,
    count: usize,
}

impl PagedFile {
    /// Create the file sized for `count` vertices and stamp the vertex count
    /// into every page header. Fails if the file already exists.
    pub(crate) fn create(
        path: &Path,
        count: usize,
        dimensions: usize,
        max_degree: usize,
    ) -> Result<Self> {
        let layout = RecordLayout::new(dimensions, max_degree);
        let pages = layout.pages_for(count);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len((pages * layout.page_size) as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        for page in 0..pages {
            let offset = page * layout.page_size;
            mmap[offset..offset + 4].copy_from_slice(&(count as u32).to_ne_bytes());
        }

        debug!(
            path = %path.display(),
            pages,
            page_size = layout.page_size,
            record_size = layout.record_size,
            "created paged index file"
        );

        Ok(Self {
            mmap,
            layout,
            dimensions,
            max_degree,
            count,
        })
    }

    pub(crate) fn vertex_count(&self) -> usize {
        self.count
    }

    pub(crate) fn max_degree(&self) -> usize {
        self.max_degree
    }

    /// The stored vector of vertex `index` as the raw bytes of its record
    /// (native byte order, 4-byte aligned by construction). Score it with
    /// the byte-region distance kernels.
    #[inline]
    pub(crate) fn vector_bytes(&self, index: usize) -> &[u8] {
        debug_assert!(index < self.count);
        let offset = self.layout.record_offset(index);
        &self.mmap[offset..offset + self.dimensions * 4]
    }

    /// Copy `vector` into the record of vertex `index`, skipping elements
    /// whose destination already matches to avoid dirtying clean pages.
    pub(crate) fn write_vector_if_changed(&mut self, index: usize, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dimensions);
        let offset = self.layout.record_offset(index);
        let stored = &mut self.mmap[offset..offset + self.dimensions * 4];
        for (slot, &value) in stored.chunks_exact_mut(4).zip(vector) {
            let bytes = value.to_ne_bytes();
            if *slot != bytes {
                slot.copy_from_slice(&bytes);
            }
        }
    }

    /// Degree of vertex `index`.
    #[inline]
    pub(crate) fn degree(&self, index: usize) -> usize {
        let offset = self.layout.record_offset(index) + self.layout.degree_offset;
        self.mmap[offset] as usize
    }

    /// The edge array of vertex `index`, `degree` entries.
    #[inline]
    pub(crate) fn edges(&self, index: usize) -> &[u32] {
        let degree = self.degree(index).min(self.max_degree);
        let offset = self.layout.record_offset(index) + self.layout.edges_offset;
        unsafe {
            std::slice::from_raw_parts(self.mmap.as_ptr().add(offset) as *const u32, degree)
        }
    }

    /// Write a vertex's degree byte and edge array. Slots past the degree are
    /// left as-is and never read.
    pub(crate) fn write_edges(&mut self, index: usize, edges: &[u32]) {
        assert!(edges.len() <= self.max_degree);
        let record = self.layout.record_offset(index);

        let edge_offset = record + self.layout.edges_offset;
        unsafe {
            std::ptr::copy_nonoverlapping(
                edges.as_ptr(),
                self.mmap.as_mut_ptr().add(edge_offset) as *mut u32,
                edges.len(),
            );
        }
        let degree_offset = record + self.layout.degree_offset;
        self.mmap[degree_offset] = edges.len() as u8;
    }

    /// Flush dirty pages to disk.
    pub(crate) fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

/// Accumulated precise-vs-PQ re-scoring error, in percent.
#[derive(Debug, Default)]
pub(crate) struct PqErrorStat {
    pub(crate) recalculated: u64,
    pub(crate) error_sum: f64,
}

/// Per-thread search scratch: visited set, candidate queue, PQ lookup table
/// and re-scoring batches. Created once per thread per index and reset
/// between queries; never shared across threads.
pub(crate) struct SearchContext {
    visited: HashSet<u32>,
    queue: BoundedGreedyVertexQueue,
    lookup: Vec<f32>,
    /// Queue positions of PQ candidates pending precise re-scoring.
    positions: Vec<usize>,
    /// Neighbor ids pending PQ estimation.
    batch: Vec<u32>,
}

impl SearchContext {
    pub(crate) fn new(search_list_size: usize, lookup_len: usize) -> Self {
        Self {
            visited: HashSet::with_capacity(8 * 1024),
            queue: BoundedGreedyVertexQueue::new(search_list_size),
            lookup: vec![0.0f32; lookup_len],
            positions: Vec::with_capacity(4),
            batch: Vec::with_capacity(4),
        }
    }
}

/// Read side of the paged graph: best-first beam search from the medoid.
pub(crate) struct DiskGraph {
    paged: PagedFile,
    medoid: u32,
    kind: DistanceKind,
}

impl DiskGraph {
    pub(crate) fn new(paged: PagedFile, medoid: u32, kind: DistanceKind) -> Self {
        Self { paged, medoid, kind }
    }

    pub(crate) fn medoid(&self) -> u32 {
        self.medoid
    }

    /// Top-K search. Fills `out` with up to `out.len()` global ids in
    /// ascending distance order and returns how many were written.
    pub(crate) fn search(
        &self,
        query: &[f32],
        out: &mut [u32],
        codec: &PqCodec,
        codes: &[u8],
        ctx: &mut SearchContext,
        stats: &Mutex<PqErrorStat>,
    ) -> usize {
        ctx.visited.clear();
        ctx.queue.clear();
        ctx.positions.clear();
        ctx.batch.clear();

        let start = self.medoid;
        let start_distance = self
            .kind
            .distance_to_bytes(query, self.paged.vector_bytes(start as usize));
        ctx.queue.push(start, start_distance, false);
        ctx.visited.insert(start);

        let mut lookup_built = false;
        let capacity = ctx.queue.capacity();

        loop {
            // Select the next vertex to expand. PQ-estimated candidates are
            // collected in batches of up to four and re-scored precisely
            // before a winner is declared; a candidate that already carries a
            // precise distance wins immediately when no batch is pending.
            let mut current = None;
            'selection: loop {
                ctx.positions.clear();
                while ctx.positions.len() < 4 {
                    let Some(position) = ctx.queue.next_not_checked() else {
                        if ctx.positions.is_empty() {
                            break 'selection;
                        }
                        self.recalculate(query, ctx, stats);
                        continue;
                    };

                    if ctx.queue.is_pq(position) {
                        ctx.positions.push(position);
                    } else if !ctx.positions.is_empty() {
                        // Re-offer the precise candidate once the pending
                        // batch has settled at its true ranks.
                        ctx.queue.uncheck(position);
                        self.recalculate(query, ctx, stats);
                    } else {
                        current = Some(ctx.queue.id_at(position));
                        break 'selection;
                    }
                }
                if !ctx.positions.is_empty() {
                    self.recalculate(query, ctx, stats);
                }
            }

            let Some(current) = current else { break };

            // Expand: admit unseen neighbors with PQ-estimated distances,
            // in groups of four.
            let edges = self.paged.edges(current as usize);
            for &neighbour in edges {
                if !ctx.visited.insert(neighbour) {
                    continue;
                }
                if !lookup_built {
                    codec.build_lookup_table(query, &mut ctx.lookup);
                    lookup_built = true;
                }

                ctx.batch.push(neighbour);
                if ctx.batch.len() == 4 {
                    let mut estimates = [0.0f32; 4];
                    codec.estimate4(
                        codes,
                        [ctx.batch[0], ctx.batch[1], ctx.batch[2], ctx.batch[3]],
                        &ctx.lookup,
                        &mut estimates,
                    );
                    for (lane, &id) in ctx.batch.iter().enumerate() {
                        admit(&mut ctx.queue, capacity, id, estimates[lane]);
                    }
                    ctx.batch.clear();
                }
            }

            for i in 0..ctx.batch.len() {
                let id = ctx.batch[i];
                let estimate = codec.estimate(codes, id as usize, &ctx.lookup);
                admit(&mut ctx.queue, capacity, id, estimate);
            }
            ctx.batch.clear();
        }

        ctx.queue.fill_results(out)
    }

    /// Re-score the queued PQ candidates in `ctx.positions` with precise
    /// distances from the mapped file and move each to its true rank.
    fn recalculate(&self, query: &[f32], ctx: &mut SearchContext, stats: &Mutex<PqErrorStat>) {
        let mut precise = [0.0f32; 4];
        let pending = ctx.positions.len();

        if pending == 4 {
            self.kind.distance4_bytes(
                query,
                self.paged.vector_bytes(ctx.queue.id_at(ctx.positions[0]) as usize),
                self.paged.vector_bytes(ctx.queue.id_at(ctx.positions[1]) as usize),
                self.paged.vector_bytes(ctx.queue.id_at(ctx.positions[2]) as usize),
                self.paged.vector_bytes(ctx.queue.id_at(ctx.positions[3]) as usize),
                &mut precise,
            );
        } else {
            for i in 0..pending {
                let id = ctx.queue.id_at(ctx.positions[i]);
                precise[i] = self
                    .kind
                    .distance_to_bytes(query, self.paged.vector_bytes(id as usize));
            }
        }

        let mut stats = stats.lock();
        for i in 0..pending {
            let position = ctx.positions[i];
            let pq_distance = ctx.queue.distance_at(position);
            let new_position = ctx.queue.resort(position, precise[i]);

            // A move to or past a pending position shifts it down by one.
            for later in ctx.positions[i + 1..].iter_mut() {
                if new_position >= *later {
                    *later -= 1;
                }
            }

            if precise[i] != 0.0 {
                stats.recalculated += 1;
                stats.error_sum += 100.0 * f64::from((precise[i] - pq_distance).abs())
                    / f64::from(precise[i]);
            }
        }

        ctx.positions.clear();
    }
}

/// Beam admission: accept while the beam has room, otherwise only when the
/// estimate does not exceed the current worst candidate.
#[inline]
fn admit(queue: &mut BoundedGreedyVertexQueue, capacity: usize, id: u32, estimate: f32) {
    if queue.len() < capacity || queue.max_distance() >= estimate {
        queue.push(id, estimate, true);
    }
}
