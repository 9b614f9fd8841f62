//! The public index type: build orchestration and query entry points.

use crate::builder;
use crate::config::VamanaConfig;
use crate::disk::{DiskGraph, PagedFile, PqErrorStat, SearchContext};
use crate::graph::PartitionGraph;
use crate::kmeans;
use crate::merge;
use crate::pq::PqCodec;
use crate::{Result, VamanaError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};
use umi_vector::{DistanceKind, VectorReader};

static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Per-thread search scratch, one entry per live index instance.
    static SEARCH_CONTEXTS: RefCell<HashMap<u64, SearchContext>> = RefCell::new(HashMap::new());
}

enum IndexState {
    Unbuilt,
    /// Built over an empty source: no file on disk, queries return nothing.
    Empty,
    Built(Built),
}

struct Built {
    graph: DiskGraph,
    codec: PqCodec,
    /// PQ codes for the whole dataset, vector-major.
    codes: Vec<u8>,
}

/// A disk-resident Vamana index.
///
/// Create with [`VamanaIndex::new`], populate once with
/// [`VamanaIndex::build_index`], then query with [`VamanaIndex::nearest`]
/// from any number of threads. The paged index file lives at
/// `<path>/<name>.graph` and is unmapped when the index is dropped.
pub struct VamanaIndex {
    name: String,
    dir: PathBuf,
    dimensions: usize,
    kind: DistanceKind,
    config: VamanaConfig,
    quantizers: usize,
    sub_dim: usize,
    instance: u64,
    state: IndexState,
    stats: Mutex<PqErrorStat>,
}

impl VamanaIndex {
    /// Create an unbuilt index. Validates the configuration against the
    /// vector dimension; nothing touches the filesystem until
    /// [`VamanaIndex::build_index`].
    pub fn new(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        dimensions: usize,
        kind: DistanceKind,
        config: VamanaConfig,
    ) -> Result<Self> {
        let name = name.into();
        let (quantizers, sub_dim) = config.validate(dimensions)?;

        info!(
            name,
            dimensions,
            quantizers,
            sub_dim,
            compression = config.pq_compression,
            "vector index initialized"
        );

        Ok(Self {
            name,
            dir: dir.into(),
            dimensions,
            kind,
            config,
            quantizers,
            sub_dim,
            instance: INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed),
            state: IndexState::Unbuilt,
            stats: Mutex::new(PqErrorStat::default()),
        })
    }

    /// Index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Vector dimension.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Build the index over `reader`, splitting the dataset into
    /// `partitions` build partitions. Replaces any previous build and any
    /// existing `<name>.graph` file.
    pub fn build_index(&mut self, partitions: usize, reader: &dyn VectorReader) -> Result<()> {
        if partitions == 0 {
            return Err(VamanaError::Config("partitions must be positive".into()));
        }
        if reader.size() > 0 && reader.dimensions() != self.dimensions {
            return Err(VamanaError::DimensionMismatch {
                expected: self.dimensions,
                actual: reader.dimensions(),
            });
        }

        let total = reader.size();
        if total == 0 {
            info!(name = %self.name, "no vectors to index, stopping index build");
            self.state = IndexState::Empty;
            return Ok(());
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let build_start = Instant::now();

        info!(name = %self.name, total, "generating PQ codes for vectors");
        let pq_start = Instant::now();
        let codec = PqCodec::fit(
            reader,
            self.quantizers,
            self.sub_dim,
            self.kind,
            self.config.pq_kmeans_iterations,
            self.config.pq_training_sample_size,
            &mut rng,
        );
        let codes = codec.encode_all(reader);
        info!(elapsed_ms = pq_start.elapsed().as_millis() as u64, "PQ codes generated");

        // Global centroid: a single PQ-space cluster, mapped back to float
        // space; its nearest dataset vector becomes the search entry point.
        let tables = codec.distance_tables();
        let global_code =
            kmeans::calculate_partitions(&codec, &codes, total, 1, 1, &tables, &mut rng);
        let centroid = codec.decode_code(&global_code);

        info!(partitions, "splitting vectors into partitions");
        let split_start = Instant::now();
        let partition_centroids =
            kmeans::calculate_partitions(&codec, &codes, total, partitions, 50, &tables, &mut rng);

        let mut members: Vec<Vec<u32>> = vec![Vec::with_capacity(total / partitions + 1); partitions];
        for i in 0..total {
            let (first, second) =
                kmeans::find_two_closest(&tables, self.quantizers, &codes, i, &partition_centroids);
            assert!(
                first != second || partitions == 1,
                "partition assignment returned a single partition for vector {i}"
            );
            members[first].push(i as u32);
            if first != second {
                members[second].push(i as u32);
            }
        }
        info!(
            elapsed_ms = split_start.elapsed().as_millis() as u64,
            "vectors split into partitions"
        );
        for (p, list) in members.iter().enumerate() {
            info!(partition = p, vectors = list.len(), "partition distribution");
        }

        let path = self.dir.join(format!("{}.graph", self.name));
        if path.exists() {
            warn!(path = %path.display(), "index file already exists and will be deleted");
            std::fs::remove_file(&path)?;
        }
        let mut paged = PagedFile::create(&path, total, self.dimensions, self.config.max_degree)?;

        let mut medoid = 0u32;
        let mut medoid_distance = f32::INFINITY;
        let mut graphs: Vec<PartitionGraph> = Vec::with_capacity(partitions);

        for (p, list) in members.iter().enumerate() {
            if list.is_empty() {
                continue;
            }

            info!(partition = p, vectors = list.len(), "building search graph for partition");
            let mut graph = PartitionGraph::new(
                list.len(),
                p,
                &self.name,
                &self.dir,
                self.dimensions,
                self.config.max_degree,
                self.kind,
                self.config.alpha,
            )?;

            for &global_index in list {
                let vector = reader.read(global_index as usize);
                graph.add_vector(global_index, vector);

                let distance = self.kind.distance(vector, &centroid);
                if distance < medoid_distance {
                    medoid_distance = distance;
                    medoid = global_index;
                }
            }

            graph.generate_random_edges(&mut rng);
            let partition_medoid = graph.medoid();

            let prune_start = Instant::now();
            builder::prune_graph(
                &graph,
                partition_medoid,
                self.config.search_list_size,
                &self.name,
                &mut rng,
            );
            info!(
                partition = p,
                elapsed_ms = prune_start.elapsed().as_millis() as u64,
                "partition graph pruned"
            );

            let save_start = Instant::now();
            graph.save_vectors_to_disk(&mut paged);
            graph.convert_local_edges_to_global();
            graph.sort_edges_by_global_index();
            info!(
                partition = p,
                elapsed_ms = save_start.elapsed().as_millis() as u64,
                "partition vectors saved to disk"
            );

            graphs.push(graph);
        }

        let merge_start = Instant::now();
        merge::merge_partitions(&mut paged, &graphs, &mut rng)?;
        info!(
            elapsed_ms = merge_start.elapsed().as_millis() as u64,
            "partitions merged and stored on disk"
        );
        drop(graphs);

        self.state = IndexState::Built(Built {
            graph: DiskGraph::new(paged, medoid, self.kind),
            codec,
            codes,
        });

        info!(
            name = %self.name,
            total,
            elapsed_ms = build_start.elapsed().as_millis() as u64,
            "index build finished"
        );
        Ok(())
    }

    /// Top-K nearest-neighbor query.
    ///
    /// Fills `out` with up to `out.len()` global vector ids in ascending
    /// distance order and returns how many were written (less than
    /// `out.len()` when the index holds fewer vectors; the remaining slots
    /// are untouched).
    pub fn nearest(&self, query: &[f32], out: &mut [u32]) -> Result<usize> {
        let built = match &self.state {
            IndexState::Unbuilt => return Err(VamanaError::NotBuilt),
            IndexState::Empty => return Ok(0),
            IndexState::Built(built) => built,
        };
        if query.len() != self.dimensions {
            return Err(VamanaError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }

        Ok(SEARCH_CONTEXTS.with(|contexts| {
            let mut contexts = contexts.borrow_mut();
            let ctx = contexts.entry(self.instance).or_insert_with(|| {
                SearchContext::new(self.config.search_list_size, built.codec.lookup_table_len())
            });
            built
                .graph
                .search(query, out, &built.codec, &built.codes, ctx, &self.stats)
        }))
    }

    /// Global id of the search entry point (the dataset vector nearest the
    /// PQ global centroid). Only meaningful after a build.
    pub fn medoid(&self) -> Result<u32> {
        match &self.state {
            IndexState::Built(built) => Ok(built.graph.medoid()),
            _ => Err(VamanaError::NotBuilt),
        }
    }

    /// Average relative error, in percent, between PQ estimates and the
    /// precise distances that replaced them during searches since the last
    /// reset.
    pub fn pq_error_avg(&self) -> f64 {
        let stats = self.stats.lock();
        if stats.recalculated == 0 {
            return 0.0;
        }
        stats.error_sum / stats.recalculated as f64
    }

    /// Reset the PQ error accumulator.
    pub fn reset_pq_error_stat(&self) {
        let mut stats = self.stats.lock();
        *stats = PqErrorStat::default();
    }
}
