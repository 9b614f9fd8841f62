//! Vector-source trait consumed by index builds.
//!
//! A `VectorReader` gives the index random access to the source vectors and
//! their optional external ids for the duration of a build. The index never
//! retains vectors beyond the build; large sources can therefore be backed by
//! files or network fetches without blowing up resident memory.

use crate::{Result, VectorError};

/// Random access to a dataset of fixed-dimension `f32` vectors.
pub trait VectorReader {
    /// Number of vectors in the source.
    fn size(&self) -> usize;

    /// Dimension of every vector in the source.
    fn dimensions(&self) -> usize;

    /// Borrow the vector at `index`.
    ///
    /// # Panics
    ///
    /// Implementations may panic when `index >= size()`.
    fn read(&self, index: usize) -> &[f32];

    /// External id of the vector at `index`, if the source carries ids.
    fn id(&self, _index: usize) -> Result<u64> {
        Err(VectorError::IdsUnsupported)
    }
}

/// A `VectorReader` over a flat, borrowed `f32` buffer.
///
/// Vectors are laid out contiguously, `dimensions` floats each. Optional
/// external ids can be attached with [`SliceVectorReader::with_ids`].
pub struct SliceVectorReader<'a> {
    data: &'a [f32],
    dimensions: usize,
    ids: Option<&'a [u64]>,
}

impl<'a> SliceVectorReader<'a> {
    /// Create a reader over `data`, which must hold a whole number of
    /// `dimensions`-dimensional vectors.
    pub fn new(data: &'a [f32], dimensions: usize) -> Result<Self> {
        if dimensions == 0 || data.len() % dimensions != 0 {
            return Err(VectorError::RaggedBuffer {
                len: data.len(),
                dimensions,
            });
        }
        Ok(Self {
            data,
            dimensions,
            ids: None,
        })
    }

    /// Attach external ids, one per vector.
    pub fn with_ids(mut self, ids: &'a [u64]) -> Result<Self> {
        if ids.len() != self.size() {
            return Err(VectorError::DimensionMismatch {
                expected: self.size(),
                actual: ids.len(),
            });
        }
        self.ids = Some(ids);
        Ok(self)
    }
}

impl VectorReader for SliceVectorReader<'_> {
    fn size(&self) -> usize {
        self.data.len() / self.dimensions
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn read(&self, index: usize) -> &[f32] {
        let start = index * self.dimensions;
        &self.data[start..start + self.dimensions]
    }

    fn id(&self, index: usize) -> Result<u64> {
        match self.ids {
            Some(ids) => Ok(ids[index]),
            None => Err(VectorError::IdsUnsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_reader_basic() {
        let data = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let reader = SliceVectorReader::new(&data, 3).unwrap();

        assert_eq!(reader.size(), 2);
        assert_eq!(reader.dimensions(), 3);
        assert_eq!(reader.read(0), &[1.0, 2.0, 3.0]);
        assert_eq!(reader.read(1), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_slice_reader_rejects_ragged() {
        let data = [1.0f32, 2.0, 3.0, 4.0, 5.0];
        assert!(SliceVectorReader::new(&data, 3).is_err());
        assert!(SliceVectorReader::new(&data, 0).is_err());
    }

    #[test]
    fn test_slice_reader_ids() {
        let data = [1.0f32, 2.0, 3.0, 4.0];
        let reader = SliceVectorReader::new(&data, 2).unwrap();
        assert!(matches!(reader.id(0), Err(VectorError::IdsUnsupported)));

        let ids = [10u64, 20];
        let reader = SliceVectorReader::new(&data, 2).unwrap().with_ids(&ids).unwrap();
        assert_eq!(reader.id(1).unwrap(), 20);
    }

    #[test]
    fn test_empty_source() {
        let data: [f32; 0] = [];
        let reader = SliceVectorReader::new(&data, 4).unwrap();
        assert_eq!(reader.size(), 0);
    }
}
