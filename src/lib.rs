//! ics - Image Cytometry Standard file reading and writing
//!
//! A pure Rust implementation of the ICS scientific image container used in
//! microscopy and cytometry. A dataset is a text header plus a binary body
//! of N-dimensional sample data: side by side as `.ics`/`.ids` files
//! (version 1) or in a single `.ics` file (version 2).
//!
//! # Features
//!
//! - Up to 10-dimensional images with per-dimension labels, scales and units
//! - Uncompressed, gzip and legacy compress(1) bodies (the latter read-only)
//! - Streaming block reads, forward/backward seeks, sub-sampled ROI reads
//! - Strided reads and writes for non-contiguous caller buffers
//! - Byte-order translation between the file's declared order and the host
//! - In-place header updates that preserve embedded body bytes
//!
//! # Example
//!
//! ```rust,no_run
//! use ics::{DataType, Ics};
//!
//! # fn example() -> ics::IcsResult<()> {
//! let pixels: Vec<u8> = vec![0; 24];
//! let mut ics = Ics::open("myimage", "w1")?;
//! ics.set_layout(DataType::U16, &[4, 3])?;
//! ics.set_data(&pixels)?;
//! ics.close()?;
//!
//! let mut ics = Ics::open("myimage", "r")?;
//! let (_, dims) = ics.layout()?;
//! let mut back = vec![0u8; ics.data_size()];
//! ics.get_data(&mut back)?;
//! ics.close()?;
//! # let _ = dims;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod compression;
pub mod error;
pub mod layout;
pub mod types;

mod compress;
mod gzip;
mod header;
mod io;
mod utils;

// Re-exports
pub use access::{FileMode, Ics, Version};
pub use compression::{CompressionLevel, CompressionMethod};
pub use error::{IcsError, IcsResult, Warning};
pub use layout::{DimensionDescriptor, ImelDescriptor};
pub use types::{ByteOrder, DataType};

/// Version of this implementation
pub const ICS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum number of image dimensions
pub const MAX_DIM: usize = 10;

/// Maximum sample size in bytes; bounds the byte-order vector
pub const MAX_IMEL_SIZE: usize = 32;

/// Scratch size for the streaming codecs
pub(crate) const BUF_SIZE: usize = 16 * 1024;
