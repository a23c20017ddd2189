//! Dimension and imel descriptors for the dataset layout

use serde::{Deserialize, Serialize};

use crate::types::DataType;

/// Default order names for the first five dimensions.
pub const DEFAULT_ORDER: [&str; 5] = ["x", "y", "z", "t", "probe"];

/// Default display labels matching [`DEFAULT_ORDER`].
pub const DEFAULT_LABEL: [&str; 5] = [
    "x-position",
    "y-position",
    "z-position",
    "time",
    "probe",
];

/// Default unit string for dimensions whose unit was never set.
pub const UNITS_UNDEFINED: &str = "undefined";

/// Default unit string for imel values.
pub const UNITS_RELATIVE: &str = "relative";

/// Default coordinate-system name.
pub const COORD_VIDEO: &str = "video";

/// One dimension of the image: its extent plus positional metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionDescriptor {
    /// Number of samples along this dimension
    pub size: usize,
    /// Short order name ("x", "y", ..., or "dim_i")
    pub order: String,
    /// Display label
    pub label: String,
    /// Real-world position of the first sample
    pub origin: f64,
    /// Real-world distance between samples
    pub scale: f64,
    /// Unit of measurement
    pub unit: String,
}

impl DimensionDescriptor {
    /// Descriptor for dimension `index` with the canonical default order
    /// name and label.
    pub fn new(index: usize, size: usize) -> Self {
        let (order, label) = if index < DEFAULT_ORDER.len() {
            (
                DEFAULT_ORDER[index].to_string(),
                DEFAULT_LABEL[index].to_string(),
            )
        } else {
            let name = format!("dim_{}", index);
            (name.clone(), name)
        };
        Self {
            size,
            order,
            label,
            origin: 0.0,
            scale: 1.0,
            unit: UNITS_UNDEFINED.to_string(),
        }
    }
}

/// Describes one image element (pixel/voxel) of the dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImelDescriptor {
    /// Sample type
    pub data_type: DataType,
    /// Number of significant bits, at most `8 * size_in_bytes`
    pub sig_bits: usize,
    /// Offset applied to stored values
    pub origin: f64,
    /// Scaling applied to stored values
    pub scale: f64,
    /// Unit of the values
    pub unit: String,
}

impl Default for ImelDescriptor {
    fn default() -> Self {
        Self {
            data_type: DataType::Unknown,
            sig_bits: 0,
            origin: 0.0,
            scale: 1.0,
            unit: UNITS_RELATIVE.to_string(),
        }
    }
}

/// Number of imels described by a dimension list. Zero for an empty list.
pub fn image_size(dims: &[DimensionDescriptor]) -> usize {
    if dims.is_empty() {
        return 0;
    }
    dims.iter().map(|d| d.size).product()
}

/// Total body size in bytes for a dimension list and sample type.
pub fn data_size(dims: &[DimensionDescriptor], data_type: DataType) -> usize {
    image_size(dims) * data_type.size_in_bytes()
}

/// Contiguous row-major strides, in imels, for a dimension list.
pub fn contiguous_strides(dims: &[DimensionDescriptor]) -> Vec<usize> {
    let mut strides = Vec::with_capacity(dims.len());
    let mut acc = 1usize;
    for d in dims {
        strides.push(acc);
        acc *= d.size;
    }
    strides
}
