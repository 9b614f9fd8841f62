//! k-means in PQ code space.
//!
//! Clusters vectors without ever touching their full-precision form: points
//! are PQ codes, centroids are PQ codes, and every distance is a sum of
//! precomputed sub-centroid table lookups. The update step picks, per
//! quantizer, the code byte minimizing the summed table distance to the
//! cluster's members (a frequency-histogram argmin), so centroids stay valid
//! codes throughout.
//!
//! Used for the global search entry point (`clusters = 1`) and for carving
//! the dataset into build partitions.

use crate::pq::{PqCodec, CODE_BOOK_SIZE};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Distance between two PQ codes under the pairwise sub-centroid tables.
#[inline]
pub(crate) fn code_distance(tables: &[f32], quantizers: usize, a: &[u8], b: &[u8]) -> f32 {
    let mut sum = 0.0f32;
    for q in 0..quantizers {
        let row = (q * CODE_BOOK_SIZE + a[q] as usize) * CODE_BOOK_SIZE;
        sum += tables[row + b[q] as usize];
    }
    sum
}

/// Cluster `count` encoded vectors into `clusters` PQ-code centroids.
///
/// Returns the centroid codes, `clusters * quantizers` bytes. Centroids are
/// seeded from the codes of randomly drawn vectors (cycling when the dataset
/// is smaller than the cluster count); iteration stops early once no
/// assignment changes. Ties resolve to the lower cluster or code index.
pub(crate) fn calculate_partitions(
    codec: &PqCodec,
    codes: &[u8],
    count: usize,
    clusters: usize,
    iterations: usize,
    tables: &[f32],
    rng: &mut StdRng,
) -> Vec<u8> {
    let quantizers = codec.quantizers();
    let mut centroids = vec![0u8; clusters * quantizers];
    if count == 0 {
        return centroids;
    }

    let mut order: Vec<usize> = (0..count).collect();
    order.shuffle(rng);
    for c in 0..clusters {
        let row = order[c % count];
        centroids[c * quantizers..(c + 1) * quantizers]
            .copy_from_slice(&codes[row * quantizers..(row + 1) * quantizers]);
    }

    let mut assignments = vec![usize::MAX; count];
    // Per-cluster, per-quantizer code frequency histograms.
    let mut histograms = vec![0u32; clusters * quantizers * CODE_BOOK_SIZE];

    for _ in 0..iterations {
        let mut changed = false;

        for (i, assignment) in assignments.iter_mut().enumerate() {
            let code = &codes[i * quantizers..(i + 1) * quantizers];
            let mut best = 0usize;
            let mut best_distance = f32::MAX;
            for c in 0..clusters {
                let centroid = &centroids[c * quantizers..(c + 1) * quantizers];
                let distance = code_distance(tables, quantizers, code, centroid);
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

        histograms.fill(0);
        for (i, &assignment) in assignments.iter().enumerate() {
            let code = &codes[i * quantizers..(i + 1) * quantizers];
            let base = assignment * quantizers * CODE_BOOK_SIZE;
            for q in 0..quantizers {
                histograms[base + q * CODE_BOOK_SIZE + code[q] as usize] += 1;
            }
        }

        for c in 0..clusters {
            let base = c * quantizers * CODE_BOOK_SIZE;
            for q in 0..quantizers {
                let histogram = &histograms[base + q * CODE_BOOK_SIZE..base + (q + 1) * CODE_BOOK_SIZE];
                if histogram.iter().all(|&n| n == 0) {
                    // Empty cluster keeps its previous centroid.
                    continue;
                }

                let mut best = 0usize;
                let mut best_cost = f32::MAX;
                for candidate in 0..CODE_BOOK_SIZE {
                    let mut cost = 0.0f32;
                    for (member, &frequency) in histogram.iter().enumerate() {
                        if frequency != 0 {
                            let row = (q * CODE_BOOK_SIZE + member) * CODE_BOOK_SIZE;
                            cost += frequency as f32 * tables[row + candidate];
                        }
                    }
                    if cost < best_cost {
                        best_cost = cost;
                        best = candidate;
                    }
                }
                centroids[c * quantizers + q] = best as u8;
            }
        }
    }

    centroids
}

/// The two partition centroids closest to the vector at `index`.
///
/// With two or more centroids the result is always a distinct pair; with a
/// single centroid both slots name it.
pub(crate) fn find_two_closest(
    tables: &[f32],
    quantizers: usize,
    codes: &[u8],
    index: usize,
    centroids: &[u8],
) -> (usize, usize) {
    let clusters = centroids.len() / quantizers;
    let code = &codes[index * quantizers..(index + 1) * quantizers];

    let mut first = 0usize;
    let mut first_distance = f32::MAX;
    let mut second = 0usize;
    let mut second_distance = f32::MAX;

    for c in 0..clusters {
        let centroid = &centroids[c * quantizers..(c + 1) * quantizers];
        let distance = code_distance(tables, quantizers, code, centroid);
        if distance < first_distance {
            second = first;
            second_distance = first_distance;
            first = c;
            first_distance = distance;
        } else if distance < second_distance {
            second = c;
            second_distance = distance;
        }
    }

    if clusters < 2 {
        (first, first)
    } else {
        (first, second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use umi_vector::{DistanceKind, SliceVectorReader, VectorReader};

    /// Two well-separated blobs in 8 dimensions.
    fn blob_data() -> Vec<f32> {
        let mut data = Vec::new();
        for i in 0..40 {
            let offset = if i < 20 { 0.0 } else { 50.0 };
            for j in 0..8 {
                data.push(offset + ((i * 7 + j) % 5) as f32 * 0.1);
            }
        }
        data
    }

    fn codec_for(data: &[f32]) -> PqCodec {
        let reader = SliceVectorReader::new(data, 8).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        PqCodec::fit(&reader, 4, 2, DistanceKind::L2, 10, 10_000, &mut rng)
    }

    #[test]
    fn test_two_blobs_split_into_two_clusters() {
        let data = blob_data();
        let codec = codec_for(&data);
        let reader = SliceVectorReader::new(&data, 8).unwrap();
        let codes = codec.encode_all(&reader);
        let tables = codec.distance_tables();

        let mut rng = StdRng::seed_from_u64(4);
        let centroids =
            calculate_partitions(&codec, &codes, reader.size(), 2, 25, &tables, &mut rng);

        // Members of one blob must agree on their nearest centroid.
        let quantizers = codec.quantizers();
        let nearest = |i: usize| find_two_closest(&tables, quantizers, &codes, i, &centroids).0;
        let low = nearest(0);
        for i in 1..20 {
            assert_eq!(nearest(i), low);
        }
        let high = nearest(20);
        assert_ne!(low, high);
        for i in 21..40 {
            assert_eq!(nearest(i), high);
        }
    }

    #[test]
    fn test_two_closest_are_distinct() {
        let data = blob_data();
        let codec = codec_for(&data);
        let reader = SliceVectorReader::new(&data, 8).unwrap();
        let codes = codec.encode_all(&reader);
        let tables = codec.distance_tables();

        let mut rng = StdRng::seed_from_u64(5);
        let centroids =
            calculate_partitions(&codec, &codes, reader.size(), 4, 25, &tables, &mut rng);

        for i in 0..reader.size() {
            let (first, second) =
                find_two_closest(&tables, codec.quantizers(), &codes, i, &centroids);
            assert_ne!(first, second);
        }
    }

    #[test]
    fn test_single_cluster_names_itself_twice() {
        let data = blob_data();
        let codec = codec_for(&data);
        let reader = SliceVectorReader::new(&data, 8).unwrap();
        let codes = codec.encode_all(&reader);
        let tables = codec.distance_tables();

        let mut rng = StdRng::seed_from_u64(6);
        let centroids =
            calculate_partitions(&codec, &codes, reader.size(), 1, 1, &tables, &mut rng);
        assert_eq!(centroids.len(), codec.quantizers());

        let (first, second) = find_two_closest(&tables, codec.quantizers(), &codes, 0, &centroids);
        assert_eq!(first, 0);
        assert_eq!(second, 0);
    }

    #[test]
    fn test_centroids_are_valid_codes() {
        let data = blob_data();
        let codec = codec_for(&data);
        let reader = SliceVectorReader::new(&data, 8).unwrap();
        let codes = codec.encode_all(&reader);
        let tables = codec.distance_tables();

        let mut rng = StdRng::seed_from_u64(7);
        let centroids =
            calculate_partitions(&codec, &codes, reader.size(), 3, 25, &tables, &mut rng);

        // Decoding must not panic and must yield full-dimension vectors.
        for c in 0..3 {
            let code = &centroids[c * codec.quantizers()..(c + 1) * codec.quantizers()];
            assert_eq!(codec.decode_code(code).len(), 8);
        }
    }
}
