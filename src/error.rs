//! Error types for ICS operations

use thiserror::Error;

/// Main error type for ICS operations.
///
/// The set is closed and flat; every failure an operation can report is one
/// of these values. Two outcomes that complete usefully are *not* errors and
/// are reported as [`Warning`] instead.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcsError {
    #[error("Image size conflicts with bytes per sample")]
    SampleSizeMismatch,

    #[error("It is not possible to read compress-compressed data in blocks")]
    BlockNotAllowed,

    #[error("The buffer was too small to hold the given ROI")]
    BufferTooSmall,

    #[error("Some error occurred during compression")]
    CompressionProblem,

    #[error("The compressed input stream is corrupted")]
    CorruptedStream,

    #[error("Some error occurred during decompression")]
    DecompressionProblem,

    #[error("The dataset already has a data source attached")]
    DuplicateData,

    #[error("Unexpected end of stream")]
    EndOfStream,

    #[error("File close error on the image data file")]
    CloseData,

    #[error("Failed to copy image data from the temporary file")]
    CopyData,

    #[error("File open error on the header file")]
    OpenHeader,

    #[error("File open error on the image data file")]
    OpenData,

    #[error("File read error on the header file")]
    ReadHeader,

    #[error("File read error on the image data file")]
    ReadData,

    #[error("Failed to rename the header file opened for updating")]
    TempMove,

    #[error("File write error on the header file")]
    WriteHeader,

    #[error("File write error on the image data file")]
    WriteData,

    #[error("The given ROI extends outside the image")]
    IllegalRoi,

    #[error("A parameter has a value that is not legal or does not match a value previously given")]
    IllParameter,

    #[error("There is no data attached to write")]
    MissingData,

    #[error("Layout parameters missing or not defined")]
    NoLayout,

    #[error("There is no SCIL_TYPE string for this data type")]
    NoScilType,

    #[error("Not an ICS file")]
    NotIcsFile,

    #[error("The operation is not valid on this dataset")]
    NotValidAction,

    #[error("Data has too many dimensions")]
    TooManyDims,

    #[error("Unknown compression type")]
    UnknownCompression,

    #[error("The data type is not recognized")]
    UnknownDataType,
}

/// Non-fatal outcome of an operation that completed usefully.
///
/// Returned inside the `Ok` variant so it never collides with the fatal
/// error channel: the handle remains valid and the operation's effect stands.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warning {
    /// The attached buffer length disagreed with the layout; the buffer was
    /// attached anyway.
    SizeConflict,
    /// The ROI completed but the output buffer was larger than needed.
    OutputNotFilled,
}

/// Specialized Result type for ICS operations.
pub type IcsResult<T = ()> = std::result::Result<T, IcsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_text_is_total() {
        let all = [
            IcsError::SampleSizeMismatch,
            IcsError::BlockNotAllowed,
            IcsError::BufferTooSmall,
            IcsError::CompressionProblem,
            IcsError::CorruptedStream,
            IcsError::DecompressionProblem,
            IcsError::DuplicateData,
            IcsError::EndOfStream,
            IcsError::CloseData,
            IcsError::CopyData,
            IcsError::OpenHeader,
            IcsError::OpenData,
            IcsError::ReadHeader,
            IcsError::ReadData,
            IcsError::TempMove,
            IcsError::WriteHeader,
            IcsError::WriteData,
            IcsError::IllegalRoi,
            IcsError::IllParameter,
            IcsError::MissingData,
            IcsError::NoLayout,
            IcsError::NoScilType,
            IcsError::NotIcsFile,
            IcsError::NotValidAction,
            IcsError::TooManyDims,
            IcsError::UnknownCompression,
            IcsError::UnknownDataType,
        ];
        for err in all {
            assert!(!err.to_string().is_empty());
        }
    }

    #[test]
    fn test_warnings_are_not_errors() {
        let ok: IcsResult<Option<Warning>> = Ok(Some(Warning::SizeConflict));
        assert!(ok.is_ok());
    }
}
