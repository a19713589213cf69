use super::distances::{ByteOrder, INV_SHORT_MAX, read_quantized_rows};
use super::source::{ByteSource, SourceError};
use crate::config::MatrixLayout;
use std::ops::Range;

/// Per-entry weights for the rows one process owns.
///
/// Most runs weight every pair equally, so the uniform case stores nothing.
/// Dense weights share the quantized layout of the distance file and decode as
/// `q * INV_SHORT_MAX`; negative values read as weight 0.
#[derive(Debug, Clone)]
pub enum WeightMatrix {
    Uniform(f64),
    Dense {
        rows: Range<usize>,
        points: usize,
        values: Vec<i16>,
    },
}

impl WeightMatrix {
    pub fn load(
        source: &dyn ByteSource,
        layout: MatrixLayout,
        order: ByteOrder,
        points: usize,
        rows: Range<usize>,
    ) -> Result<Self, SourceError> {
        let values = read_quantized_rows(source, layout, order, points, rows.clone())?;
        Ok(Self::Dense {
            rows,
            points,
            values,
        })
    }

    /// Weight of entry `(row, col)`; `row` must be owned by this block.
    #[inline]
    pub fn weight(&self, row: usize, col: usize) -> f64 {
        match self {
            Self::Uniform(w) => *w,
            Self::Dense {
                rows,
                points,
                values,
            } => {
                let q = values[(row - rows.start) * points + col];
                if q > 0 { q as f64 * INV_SHORT_MAX } else { 0.0 }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::distances::{Quantizer, encode_matrix};
    use crate::shared::source::MemorySource;
    use ndarray::Array2;

    #[test]
    fn dense_weights_decode_in_unit_scale() {
        let mut w = Array2::from_elem((3, 3), 0.5);
        w[[0, 2]] = -1.0;
        w[[2, 0]] = -1.0;
        let bytes = encode_matrix(w.view(), MatrixLayout::Full, ByteOrder::Little, Quantizer::new(1.0));
        let source = MemorySource::from(bytes);
        let weights =
            WeightMatrix::load(&source, MatrixLayout::Full, ByteOrder::Little, 3, 1..3).unwrap();
        assert!((weights.weight(1, 0) - 0.5).abs() < 1e-4);
        assert_eq!(weights.weight(2, 0), 0.0);
        assert_eq!(weights.weight(2, 2), 0.0);
        assert_eq!(WeightMatrix::Uniform(1.0).weight(7, 3), 1.0);
    }
}
