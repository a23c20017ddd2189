//! Binary body I/O: plain writers, the block reader, and the body copy
//! used by the update transaction

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::compress::read_compress;
use crate::compression::CompressionMethod;
use crate::error::{IcsError, IcsResult};
use crate::gzip::ZipReader;
use crate::utils::LineWalker;
use crate::BUF_SIZE;

/// Upper bound for a single write call. Some hosts mishandle single writes
/// in the multi-gigabyte range; chunking is cheap.
const WRITE_CHUNK: usize = 1 << 30;

/// Write a contiguous buffer, chunked at [`WRITE_CHUNK`].
pub(crate) fn write_plain<W: Write>(src: &[u8], w: &mut W) -> IcsResult<()> {
    for chunk in src.chunks(WRITE_CHUNK) {
        w.write_all(chunk).map_err(|_| IcsError::WriteData)?;
    }
    Ok(())
}

/// Write a strided source, one line along dimension 0 at a time. Strides
/// are in imels. Lines with unit stride go out in a single call; otherwise
/// each imel is written on its own.
pub(crate) fn write_plain_strided<W: Write>(
    src: &[u8],
    dims: &[usize],
    strides: &[usize],
    width: usize,
    w: &mut W,
) -> IcsResult<()> {
    let mut walker = LineWalker::new(dims);
    loop {
        let base = walker.offset(strides) * width;
        if strides[0] == 1 {
            w.write_all(&src[base..base + dims[0] * width])
                .map_err(|_| IcsError::WriteData)?;
        } else {
            for j in 0..dims[0] {
                let off = base + j * strides[0] * width;
                w.write_all(&src[off..off + width])
                    .map_err(|_| IcsError::WriteData)?;
            }
        }
        if !walker.advance() {
            break;
        }
    }
    Ok(())
}

/// Append the bytes of `from`, starting at `offset`, onto `to`. Used by the
/// update transaction to carry the body of a version-2 file over to the
/// freshly written header.
pub(crate) fn copy_body(from: &Path, offset: u64, to: &Path) -> IcsResult<()> {
    let mut input = File::open(from).map_err(|_| IcsError::CopyData)?;
    input
        .seek(SeekFrom::Start(offset))
        .map_err(|_| IcsError::CopyData)?;
    let mut output = OpenOptions::new()
        .append(true)
        .open(to)
        .map_err(|_| IcsError::CopyData)?;

    let mut buffer = vec![0u8; BUF_SIZE];
    loop {
        let n = input.read(&mut buffer).map_err(|_| IcsError::CopyData)?;
        if n == 0 {
            break;
        }
        output
            .write_all(&buffer[..n])
            .map_err(|_| IcsError::CopyData)?;
    }
    Ok(())
}

#[derive(Debug)]
enum ReadState {
    Plain,
    Gzip(ZipReader),
    Compress { consumed: bool },
}

/// An open body stream positioned for sequential block reads.
///
/// Owns the file descriptor and whatever codec context the declared
/// compression requires. Kept on the dataset handle only while a streaming
/// read is in flight.
#[derive(Debug)]
pub(crate) struct BlockReader {
    file: File,
    path: PathBuf,
    offset: u64,
    state: ReadState,
}

impl BlockReader {
    pub fn open(path: &Path, offset: u64, compression: CompressionMethod) -> IcsResult<Self> {
        debug!(
            "opening body stream {:?} at offset {} ({})",
            path,
            offset,
            compression.as_str()
        );
        let mut file = File::open(path).map_err(|_| IcsError::OpenData)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|_| IcsError::ReadData)?;
        let state = match compression {
            CompressionMethod::Uncompressed => ReadState::Plain,
            CompressionMethod::Gzip => ReadState::Gzip(ZipReader::open(&mut file)?),
            CompressionMethod::Compress => ReadState::Compress { consumed: false },
        };
        Ok(Self {
            file,
            path: path.to_path_buf(),
            offset,
            state,
        })
    }

    fn reopen(&mut self) -> IcsResult<()> {
        self.file = File::open(&self.path).map_err(|_| IcsError::OpenData)?;
        self.file
            .seek(SeekFrom::Start(self.offset))
            .map_err(|_| IcsError::ReadData)?;
        self.state = match self.state {
            ReadState::Plain => ReadState::Plain,
            ReadState::Gzip(_) => ReadState::Gzip(ZipReader::open(&mut self.file)?),
            ReadState::Compress { .. } => ReadState::Compress { consumed: false },
        };
        Ok(())
    }

    /// Read exactly `dest.len()` decoded bytes.
    pub fn read_block(&mut self, dest: &mut [u8]) -> IcsResult<()> {
        match &mut self.state {
            ReadState::Plain => self.file.read_exact(dest).map_err(|e| {
                if e.kind() == ErrorKind::UnexpectedEof {
                    IcsError::EndOfStream
                } else {
                    IcsError::ReadData
                }
            }),
            ReadState::Gzip(zip) => zip.read_block(&mut self.file, dest),
            ReadState::Compress { consumed } => {
                if *consumed {
                    return Err(IcsError::BlockNotAllowed);
                }
                let result = read_compress(&mut self.file, dest);
                *consumed = true;
                result
            }
        }
    }

    /// Move the stream position. `SeekFrom::End` is never supported; for
    /// gzip, backward movement closes and reopens the stream and forward
    /// movement decompresses into the void.
    pub fn set_block(&mut self, pos: SeekFrom) -> IcsResult<()> {
        if matches!(pos, SeekFrom::End(_)) {
            return Err(IcsError::IllParameter);
        }
        let total_out = match self.state {
            ReadState::Plain => {
                return self.file.seek(pos).map(|_| ()).map_err(|e| {
                    if e.kind() == ErrorKind::InvalidInput {
                        IcsError::EndOfStream
                    } else {
                        IcsError::ReadData
                    }
                });
            }
            ReadState::Compress { .. } => return Err(IcsError::BlockNotAllowed),
            ReadState::Gzip(ref zip) => zip.total_out(),
        };

        let skip: u64 = match pos {
            SeekFrom::Current(n) if n >= 0 => n as u64,
            SeekFrom::Current(n) => {
                let absolute = total_out as i64 + n;
                if absolute < 0 {
                    return Err(IcsError::IllParameter);
                }
                self.reopen()?;
                absolute as u64
            }
            SeekFrom::Start(n) => {
                self.reopen()?;
                n
            }
            SeekFrom::End(_) => return Err(IcsError::IllParameter),
        };
        let mut remaining = skip as usize;
        if remaining == 0 {
            return Ok(());
        }
        let mut scratch = vec![0u8; remaining.min(BUF_SIZE)];
        while remaining > 0 {
            let n = remaining.min(BUF_SIZE);
            self.read_block(&mut scratch[..n])?;
            remaining -= n;
        }
        Ok(())
    }

    /// Skip `n` decoded bytes forward from the current position.
    pub fn skip_block(&mut self, n: u64) -> IcsResult<()> {
        self.set_block(SeekFrom::Current(n as i64))
    }
}
