//! Product Quantization codec.
//!
//! Splits every vector into `Q` sub-vectors of length `S` and quantizes each
//! sub-vector against a 256-entry codebook trained with k-means, producing
//! one byte per quantizer. Distances are approximated by summing per-quantizer
//! table lookups, which keeps the search hot loop entirely in memory.
//!
//! The compression ratio is expressed as *source bytes per code byte*:
//! `compression = 32` encodes eight `f32`s (32 bytes) into one byte.

use crate::{Result, VamanaError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use umi_vector::{DistanceKind, VectorReader};

/// Entries per sub-codebook; codes are a single byte.
pub(crate) const CODE_BOOK_SIZE: usize = 256;

/// Derive the PQ shape `(quantizers, sub_dim)` from the vector dimension and
/// the configured compression ratio.
pub(crate) fn pq_parameters(dimensions: usize, compression: usize) -> Result<(usize, usize)> {
    if compression == 0 || compression % std::mem::size_of::<f32>() != 0 {
        return Err(VamanaError::Config(format!(
            "pq_compression ({compression}) must be a positive multiple of 4"
        )));
    }
    let sub_dim = compression / std::mem::size_of::<f32>();
    if dimensions % sub_dim != 0 {
        return Err(VamanaError::Config(format!(
            "vector dimension ({dimensions}) must be divisible by the PQ sub-vector length ({sub_dim})"
        )));
    }
    Ok((dimensions / sub_dim, sub_dim))
}

/// Trained PQ codebooks for one dataset.
pub(crate) struct PqCodec {
    dimensions: usize,
    quantizers: usize,
    sub_dim: usize,
    kind: DistanceKind,
    /// Flat `[quantizer][code][sub_dim]` centroid storage.
    codebooks: Vec<f32>,
}

impl PqCodec {
    /// Fit one 256-centroid codebook per quantizer by running k-means over
    /// the quantizer's column slice of the training set.
    ///
    /// When the source exceeds `sample_cap` vectors, a seeded random sample of
    /// that size is used for training; encoding always covers the full set.
    pub(crate) fn fit(
        reader: &dyn VectorReader,
        quantizers: usize,
        sub_dim: usize,
        kind: DistanceKind,
        iterations: usize,
        sample_cap: usize,
        rng: &mut StdRng,
    ) -> Self {
        let dimensions = quantizers * sub_dim;
        let total = reader.size();

        let sample: Vec<usize> = if total > sample_cap {
            let mut indices: Vec<usize> = (0..total).collect();
            indices.shuffle(rng);
            indices.truncate(sample_cap);
            indices
        } else {
            (0..total).collect()
        };

        let mut codebooks = Vec::with_capacity(quantizers * CODE_BOOK_SIZE * sub_dim);
        let mut column = vec![0.0f32; sample.len() * sub_dim];

        for q in 0..quantizers {
            let start = q * sub_dim;
            for (row, &i) in sample.iter().enumerate() {
                let vector = reader.read(i);
                column[row * sub_dim..(row + 1) * sub_dim]
                    .copy_from_slice(&vector[start..start + sub_dim]);
            }

            let centroids = kmeans(&column, sample.len(), sub_dim, CODE_BOOK_SIZE, iterations, kind, rng);
            codebooks.extend_from_slice(&centroids);
        }

        Self {
            dimensions,
            quantizers,
            sub_dim,
            kind,
            codebooks,
        }
    }

    /// Number of quantizers (code bytes per vector).
    pub(crate) fn quantizers(&self) -> usize {
        self.quantizers
    }

    #[inline]
    fn centroid(&self, quantizer: usize, code: usize) -> &[f32] {
        let start = (quantizer * CODE_BOOK_SIZE + code) * self.sub_dim;
        &self.codebooks[start..start + self.sub_dim]
    }

    /// Encode a vector into `quantizers` code bytes.
    pub(crate) fn encode_into(&self, vector: &[f32], out: &mut [u8]) {
        debug_assert_eq!(vector.len(), self.dimensions);
        debug_assert_eq!(out.len(), self.quantizers);

        for q in 0..self.quantizers {
            let start = q * self.sub_dim;
            let sub = &vector[start..start + self.sub_dim];

            let mut best = 0usize;
            let mut best_distance = f32::MAX;
            for c in 0..CODE_BOOK_SIZE {
                let distance = self.kind.distance(sub, self.centroid(q, c));
                if distance < best_distance {
                    best_distance = distance;
                    best = c;
                }
            }
            out[q] = best as u8;
        }
    }

    /// Encode the whole source into a contiguous code array of
    /// `size * quantizers` bytes, vector-major.
    pub(crate) fn encode_all(&self, reader: &dyn VectorReader) -> Vec<u8> {
        let total = reader.size();
        let mut codes = vec![0u8; total * self.quantizers];
        for i in 0..total {
            let out = &mut codes[i * self.quantizers..(i + 1) * self.quantizers];
            self.encode_into(reader.read(i), out);
        }
        codes
    }

    /// Length of a per-query lookup table.
    pub(crate) fn lookup_table_len(&self) -> usize {
        self.quantizers * CODE_BOOK_SIZE
    }

    /// Fill the per-query lookup table: `table[q * 256 + c]` is the
    /// sub-distance between the query's q-th sub-vector and centroid `c`.
    /// Sub-distances are additive across quantizers for both kinds.
    pub(crate) fn build_lookup_table(&self, query: &[f32], table: &mut [f32]) {
        debug_assert_eq!(table.len(), self.lookup_table_len());

        for q in 0..self.quantizers {
            let start = q * self.sub_dim;
            let sub = &query[start..start + self.sub_dim];
            let row = &mut table[q * CODE_BOOK_SIZE..(q + 1) * CODE_BOOK_SIZE];
            for (c, slot) in row.iter_mut().enumerate() {
                *slot = self.kind.distance(sub, self.centroid(q, c));
            }
        }
    }

    /// Estimate the distance from the table-owning query to vector `index`.
    #[inline]
    pub(crate) fn estimate(&self, codes: &[u8], index: usize, table: &[f32]) -> f32 {
        let base = index * self.quantizers;
        let mut sum = 0.0f32;
        for q in 0..self.quantizers {
            let code = codes[base + q] as usize;
            sum += table[q * CODE_BOOK_SIZE + code];
        }
        sum
    }

    /// Estimate four distances in one pass over the quantizers, keeping four
    /// independent accumulator streams.
    pub(crate) fn estimate4(
        &self,
        codes: &[u8],
        indexes: [u32; 4],
        table: &[f32],
        out: &mut [f32; 4],
    ) {
        let base0 = indexes[0] as usize * self.quantizers;
        let base1 = indexes[1] as usize * self.quantizers;
        let base2 = indexes[2] as usize * self.quantizers;
        let base3 = indexes[3] as usize * self.quantizers;

        let mut s0 = 0.0f32;
        let mut s1 = 0.0f32;
        let mut s2 = 0.0f32;
        let mut s3 = 0.0f32;

        for q in 0..self.quantizers {
            let row = q * CODE_BOOK_SIZE;
            s0 += table[row + codes[base0 + q] as usize];
            s1 += table[row + codes[base1 + q] as usize];
            s2 += table[row + codes[base2 + q] as usize];
            s3 += table[row + codes[base3 + q] as usize];
        }

        *out = [s0, s1, s2, s3];
    }

    /// All pairwise sub-centroid distances, flat
    /// `[quantizer][code_a][code_b]`. Used by PQ-space k-means and partition
    /// assignment.
    pub(crate) fn distance_tables(&self) -> Vec<f32> {
        let mut tables = vec![0.0f32; self.quantizers * CODE_BOOK_SIZE * CODE_BOOK_SIZE];
        for q in 0..self.quantizers {
            for a in 0..CODE_BOOK_SIZE {
                let row = (q * CODE_BOOK_SIZE + a) * CODE_BOOK_SIZE;
                for b in 0..CODE_BOOK_SIZE {
                    tables[row + b] = self.kind.distance(self.centroid(q, a), self.centroid(q, b));
                }
            }
        }
        tables
    }

    /// Map a PQ code back to float space by concatenating its sub-centroids.
    pub(crate) fn decode_code(&self, code: &[u8]) -> Vec<f32> {
        debug_assert_eq!(code.len(), self.quantizers);
        let mut vector = Vec::with_capacity(self.dimensions);
        for q in 0..self.quantizers {
            vector.extend_from_slice(self.centroid(q, code[q] as usize));
        }
        vector
    }
}

/// Plain Lloyd k-means over `count` points of `dim` floats each.
///
/// Centroids are seeded from a shuffled pass over the points (cycling when
/// there are fewer points than clusters), refined until assignments stop
/// changing or `iterations` is reached. Empty clusters keep their previous
/// centroid; distance ties resolve to the lower centroid index.
fn kmeans(
    points: &[f32],
    count: usize,
    dim: usize,
    k: usize,
    iterations: usize,
    kind: DistanceKind,
    rng: &mut StdRng,
) -> Vec<f32> {
    let mut centroids = vec![0.0f32; k * dim];
    if count == 0 {
        return centroids;
    }

    let mut order: Vec<usize> = (0..count).collect();
    order.shuffle(rng);
    for c in 0..k {
        let row = order[c % count];
        centroids[c * dim..(c + 1) * dim].copy_from_slice(&points[row * dim..(row + 1) * dim]);
    }

    let mut assignments = vec![usize::MAX; count];
    let mut sums = vec![0.0f64; k * dim];
    let mut counts = vec![0usize; k];

    for _ in 0..iterations {
        let mut changed = false;

        for (i, assignment) in assignments.iter_mut().enumerate() {
            let point = &points[i * dim..(i + 1) * dim];
            let mut best = 0usize;
            let mut best_distance = f32::MAX;
            for c in 0..k {
                let distance = kind.distance(point, &centroids[c * dim..(c + 1) * dim]);
                if distance < best_distance {
                    best_distance = distance;
                    best = c;
                }
            }
            if *assignment != best {
                *assignment = best;
                changed = true;
            }
        }

        if !changed {
            break;
        }

        sums.fill(0.0);
        counts.fill(0);
        for (i, &assignment) in assignments.iter().enumerate() {
            counts[assignment] += 1;
            let point = &points[i * dim..(i + 1) * dim];
            let sum = &mut sums[assignment * dim..(assignment + 1) * dim];
            for (slot, &value) in sum.iter_mut().zip(point) {
                *slot += value as f64;
            }
        }

        for c in 0..k {
            if counts[c] == 0 {
                continue;
            }
            let centroid = &mut centroids[c * dim..(c + 1) * dim];
            let sum = &sums[c * dim..(c + 1) * dim];
            for (slot, &total) in centroid.iter_mut().zip(sum) {
                *slot = (total / counts[c] as f64) as f32;
            }
        }
    }

    centroids
}
