// ========================================================================================
//
//                        INPUT SOURCES & OUTPUT FILES
//
// ========================================================================================
//
// Byte-addressable access to the quantized distance and weight matrices, the
// row-block views built from them, and the plain-text point files.

pub mod distances;
pub mod points;
pub mod source;
pub mod weights;

pub use distances::{ByteOrder, DistanceBlock, Quantizer, encode_matrix};
pub use points::{read_labels, read_points, write_points};
pub use source::{ByteSource, MemorySource, MmapSource, SourceError, open_source};
pub use weights::WeightMatrix;
