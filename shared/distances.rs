use super::source::{ByteSource, SourceError};
use crate::config::MatrixLayout;
use ndarray::ArrayView2;
use std::ops::Range;

/// Largest value of the 16-bit quantized domain.
pub const SHORT_MAX: i16 = i16::MAX;
/// `1 / SHORT_MAX`, the step of the quantized domain when the scale is 1.
pub const INV_SHORT_MAX: f64 = 1.0 / SHORT_MAX as f64;

/// Byte order of the 16-bit values on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    pub fn from_big_endian(big_endian: bool) -> Self {
        if big_endian { Self::Big } else { Self::Little }
    }

    #[inline]
    fn decode(self, bytes: [u8; 2]) -> i16 {
        match self {
            Self::Big => i16::from_be_bytes(bytes),
            Self::Little => i16::from_le_bytes(bytes),
        }
    }

    #[inline]
    fn encode(self, value: i16) -> [u8; 2] {
        match self {
            Self::Big => value.to_be_bytes(),
            Self::Little => value.to_le_bytes(),
        }
    }
}

/// Maps real distances in `[0, max_distance]` onto `[0, SHORT_MAX]`.
/// Negative quantized values mean "missing".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantizer {
    max_distance: f64,
}

impl Quantizer {
    pub fn new(max_distance: f64) -> Self {
        Self { max_distance }
    }

    pub fn max_distance(&self) -> f64 {
        self.max_distance
    }

    /// Width of one quantization step in the real domain.
    pub fn step(&self) -> f64 {
        self.max_distance * INV_SHORT_MAX
    }

    /// Quantizes a real distance, clamping to the representable range. Missing
    /// values (negative or NaN) encode as -1.
    pub fn encode(&self, value: f64) -> i16 {
        if value.is_nan() || value < 0.0 {
            return -1;
        }
        let scaled = (value / self.max_distance * SHORT_MAX as f64).round();
        scaled.min(SHORT_MAX as f64) as i16
    }

    #[inline]
    pub fn decode(&self, value: i16) -> Option<f64> {
        (value >= 0).then(|| value as f64 * self.step())
    }
}

/// Byte offset of entry `(row, col)` in the given layout. `None` for the
/// diagonal of an upper-triangular file, which is not stored.
fn entry_index(layout: MatrixLayout, points: usize, row: usize, col: usize) -> Option<usize> {
    match layout {
        MatrixLayout::Full => Some(row * points + col),
        MatrixLayout::UpperTriangular => {
            if row == col {
                return None;
            }
            let (a, b) = if row < col { (row, col) } else { (col, row) };
            Some(a * (2 * points - a - 1) / 2 + (b - a - 1))
        }
    }
}

fn stored_entries(layout: MatrixLayout, points: usize) -> usize {
    match layout {
        MatrixLayout::Full => points * points,
        MatrixLayout::UpperTriangular => points * (points - 1) / 2,
    }
}

/// Reads the quantized values of global rows `rows` of an N x N matrix into a
/// row-major `rows.len() x N` buffer. Diagonal entries are always 0.
pub fn read_quantized_rows(
    source: &dyn ByteSource,
    layout: MatrixLayout,
    order: ByteOrder,
    points: usize,
    rows: Range<usize>,
) -> Result<Vec<i16>, SourceError> {
    let expected = (stored_entries(layout, points) * 2) as u64;
    if source.len() != expected {
        return Err(SourceError::SizeMismatch {
            expected,
            found: source.len(),
        });
    }

    let mut values = vec![0i16; rows.len() * points];
    let mut bytes = vec![0u8; points * 2];
    for (local, row) in rows.clone().enumerate() {
        let out = &mut values[local * points..(local + 1) * points];
        match layout {
            MatrixLayout::Full => {
                source.read_at((row * points * 2) as u64, &mut bytes)?;
                for (dst, pair) in out.iter_mut().zip(bytes.chunks_exact(2)) {
                    *dst = order.decode([pair[0], pair[1]]);
                }
            }
            MatrixLayout::UpperTriangular => {
                // Entries right of the diagonal are contiguous in the file.
                let tail = points - row - 1;
                if let Some(start) = entry_index(layout, points, row, row + 1).filter(|_| tail > 0) {
                    let seg = &mut bytes[..tail * 2];
                    source.read_at((start * 2) as u64, seg)?;
                    for (dst, pair) in out[row + 1..].iter_mut().zip(seg.chunks_exact(2)) {
                        *dst = order.decode([pair[0], pair[1]]);
                    }
                }
                let mut pair = [0u8; 2];
                for (col, dst) in out[..row].iter_mut().enumerate() {
                    if let Some(idx) = entry_index(layout, points, row, col) {
                        source.read_at((idx * 2) as u64, &mut pair)?;
                        *dst = order.decode(pair);
                    }
                }
            }
        }
        out[row] = 0;
    }
    Ok(values)
}

/// The quantized distances of the rows one process owns.
///
/// Values stay in their 16-bit form and are decoded on access, so a block
/// costs two bytes per entry.
#[derive(Debug, Clone)]
pub struct DistanceBlock {
    rows: Range<usize>,
    points: usize,
    values: Vec<i16>,
    quantizer: Quantizer,
    transform: Option<f64>,
}

impl DistanceBlock {
    pub fn load(
        source: &dyn ByteSource,
        layout: MatrixLayout,
        order: ByteOrder,
        points: usize,
        rows: Range<usize>,
        quantizer: Quantizer,
        transform: Option<f64>,
    ) -> Result<Self, SourceError> {
        let values = read_quantized_rows(source, layout, order, points, rows.clone())?;
        Ok(Self {
            rows,
            points,
            values,
            quantizer,
            transform,
        })
    }

    /// Builds a block straight from a real matrix, quantizing on the way in.
    pub fn from_matrix(
        matrix: ArrayView2<f64>,
        rows: Range<usize>,
        quantizer: Quantizer,
        transform: Option<f64>,
    ) -> Self {
        let points = matrix.ncols();
        let mut values = Vec::with_capacity(rows.len() * points);
        for row in rows.clone() {
            values.extend(
                (0..points).map(|col| if row == col { 0 } else { quantizer.encode(matrix[[row, col]]) }),
            );
        }
        Self {
            rows,
            points,
            values,
            quantizer,
            transform,
        }
    }

    pub fn rows(&self) -> Range<usize> {
        self.rows.clone()
    }

    pub fn points(&self) -> usize {
        self.points
    }

    /// Quantized values of global row `row`, which must be owned by this block.
    #[inline]
    pub fn row(&self, row: usize) -> &[i16] {
        let local = row - self.rows.start;
        &self.values[local * self.points..(local + 1) * self.points]
    }

    /// Real distance of a quantized value, `None` when it is missing.
    #[inline]
    pub fn delta(&self, value: i16) -> Option<f64> {
        let d = self.quantizer.decode(value)?;
        Some(match self.transform {
            Some(power) => d.powf(power),
            None => d,
        })
    }

    /// Largest real distance in the block, 0 when everything is missing.
    pub fn max_delta(&self) -> f64 {
        self.values
            .iter()
            .filter_map(|&q| self.delta(q))
            .fold(0.0, f64::max)
    }
}

/// Serializes a real N x N matrix into the quantized on-disk layout.
/// Negative or NaN entries are written as missing.
pub fn encode_matrix(
    matrix: ArrayView2<f64>,
    layout: MatrixLayout,
    order: ByteOrder,
    quantizer: Quantizer,
) -> Vec<u8> {
    let points = matrix.nrows();
    let mut out = vec![0u8; stored_entries(layout, points) * 2];
    for row in 0..points {
        for col in 0..points {
            if let Some(idx) = entry_index(layout, points, row, col) {
                if layout == MatrixLayout::UpperTriangular && row > col {
                    continue;
                }
                let value = if row == col { 0 } else { quantizer.encode(matrix[[row, col]]) };
                out[idx * 2..idx * 2 + 2].copy_from_slice(&order.encode(value));
            }
        }
    }
    out
}
