//! Streaming gzip codec for ICS image data
//!
//! The framing is hand-rolled rather than delegated to a gzip encoder: a
//! minimal fixed header, a raw deflate stream, and a little-endian CRC-32 +
//! length trailer. This keeps the on-disk bytes identical regardless of
//! which deflate backend produced them, and lets the reader stop exactly at
//! the trailer so the file offset afterwards is predictable.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use flate2::{Compress, Compression, Crc, Decompress, FlushCompress, FlushDecompress, Status};

use crate::compression::CompressionLevel;
use crate::error::{IcsError, IcsResult};
use crate::utils::LineWalker;
use crate::BUF_SIZE;

const GZ_MAGIC: [u8; 2] = [0x1f, 0x8b];
const METHOD_DEFLATE: u8 = 8;
const OS_CODE: u8 = if cfg!(windows) { 0x0b } else { 0x03 };

// gzip flag byte
const FLAG_HEAD_CRC: u8 = 0x02;
const FLAG_EXTRA_FIELD: u8 = 0x04;
const FLAG_ORIG_NAME: u8 = 0x08;
const FLAG_COMMENT: u8 = 0x10;
const FLAG_RESERVED: u8 = 0xe0;

/// Fixed ten-byte gzip header: magic, deflate, no flags, zero mtime and
/// xflags, OS code. No extra field, name, comment, or header CRC.
fn write_gzip_header<W: Write>(w: &mut W) -> IcsResult<()> {
    let header = [
        GZ_MAGIC[0],
        GZ_MAGIC[1],
        METHOD_DEFLATE,
        0,
        0,
        0,
        0,
        0,
        0,
        OS_CODE,
    ];
    w.write_all(&header).map_err(|_| IcsError::WriteData)
}

/// Trailer: CRC-32 of the uncompressed stream, then its length, both
/// little-endian. The length is kept 32-bit for compatibility even though
/// the stream may be longer.
fn write_gzip_trailer<W: Write>(w: &mut W, crc: u32, len: u64) -> IcsResult<()> {
    w.write_all(&crc.to_le_bytes())
        .and_then(|_| w.write_all(&(len as u32).to_le_bytes()))
        .map_err(|_| IcsError::WriteData)
}

/// Feed one input slice to the deflate stream, writing whatever output is
/// produced. With `FlushCompress::None` returns once the slice is consumed;
/// with `FlushCompress::Finish` keeps draining until the stream ends.
fn deflate_chunk<W: Write>(
    stream: &mut Compress,
    chunk: &[u8],
    out_buf: &mut [u8],
    flush: FlushCompress,
    w: &mut W,
) -> IcsResult<()> {
    let finish = matches!(flush, FlushCompress::Finish);
    let mut pos = 0;
    loop {
        let before_in = stream.total_in();
        let before_out = stream.total_out();
        let status = stream
            .compress(&chunk[pos..], out_buf, flush)
            .map_err(|_| IcsError::CompressionProblem)?;
        let consumed = (stream.total_in() - before_in) as usize;
        let produced = (stream.total_out() - before_out) as usize;
        pos += consumed;
        w.write_all(&out_buf[..produced])
            .map_err(|_| IcsError::WriteData)?;
        if finish {
            if matches!(status, Status::StreamEnd) {
                return Ok(());
            }
        } else if pos >= chunk.len() {
            return Ok(());
        }
        if consumed == 0 && produced == 0 && !finish {
            return Err(IcsError::CompressionProblem);
        }
    }
}

/// Write a contiguous buffer as a gzip member.
pub(crate) fn write_zip<W: Write>(
    src: &[u8],
    w: &mut W,
    level: CompressionLevel,
) -> IcsResult<()> {
    let mut out_buf = vec![0u8; BUF_SIZE];
    let mut stream = Compress::new(Compression::new(level.value() as u32), false);
    let mut crc = Crc::new();

    write_gzip_header(w)?;

    let mut total = 0usize;
    loop {
        let chunk_end = (total + BUF_SIZE).min(src.len());
        let chunk = &src[total..chunk_end];
        crc.update(chunk);
        let flush = if chunk_end >= src.len() {
            FlushCompress::Finish
        } else {
            FlushCompress::None
        };
        deflate_chunk(&mut stream, chunk, &mut out_buf, flush, w)?;
        total = chunk_end;
        if total >= src.len() {
            break;
        }
    }

    write_gzip_trailer(w, crc.sum(), src.len() as u64)
}

/// Write a strided source as a gzip member, gathering one line along
/// dimension 0 at a time. Strides are in imels.
pub(crate) fn write_zip_strided<W: Write>(
    src: &[u8],
    dims: &[usize],
    strides: &[usize],
    width: usize,
    w: &mut W,
    level: CompressionLevel,
) -> IcsResult<()> {
    let contiguous = strides[0] == 1;
    let line_len = dims[0] * width;
    let mut out_buf = vec![0u8; BUF_SIZE];
    let mut line_buf = if contiguous {
        Vec::new()
    } else {
        vec![0u8; line_len]
    };
    let mut stream = Compress::new(Compression::new(level.value() as u32), false);
    let mut crc = Crc::new();

    write_gzip_header(w)?;

    let mut total: u64 = 0;
    let mut walker = LineWalker::new(dims);
    loop {
        let base = walker.offset(strides) * width;
        if !contiguous {
            for j in 0..dims[0] {
                let off = base + j * strides[0] * width;
                line_buf[j * width..(j + 1) * width].copy_from_slice(&src[off..off + width]);
            }
        }
        let line: &[u8] = if contiguous {
            &src[base..base + line_len]
        } else {
            &line_buf
        };
        crc.update(line);
        total += line_len as u64;
        deflate_chunk(&mut stream, line, &mut out_buf, FlushCompress::None, w)?;
        if !walker.advance() {
            break;
        }
    }
    deflate_chunk(&mut stream, &[], &mut out_buf, FlushCompress::Finish, w)?;

    write_gzip_trailer(w, crc.sum(), total)
}

fn read_u8(file: &mut File) -> IcsResult<u8> {
    let mut b = [0u8; 1];
    file.read_exact(&mut b)
        .map_err(|_| IcsError::CorruptedStream)?;
    Ok(b[0])
}

fn read_u32_le(file: &mut File) -> IcsResult<u32> {
    let mut b = [0u8; 4];
    file.read_exact(&mut b)
        .map_err(|_| IcsError::CorruptedStream)?;
    Ok(u32::from_le_bytes(b))
}

/// Open gzip-compressed data for block reads.
///
/// Owns the inflate context, its refillable input scratch, and the running
/// CRC over all bytes produced so far. The underlying file handle stays with
/// the caller; after every [`read_block`](ZipReader::read_block) its offset
/// is left at the first compressed byte not yet consumed.
#[derive(Debug)]
pub(crate) struct ZipReader {
    stream: Decompress,
    in_buf: Vec<u8>,
    crc: Crc,
}

impl ZipReader {
    /// Validate the gzip header at the current file position and set up the
    /// inflate context. Any optional header fields are skipped.
    pub fn open(file: &mut File) -> IcsResult<Self> {
        if read_u8(file)? != GZ_MAGIC[0] || read_u8(file)? != GZ_MAGIC[1] {
            return Err(IcsError::CorruptedStream);
        }
        let method = read_u8(file)?;
        let flags = read_u8(file)?;
        if method != METHOD_DEFLATE || flags & FLAG_RESERVED != 0 {
            return Err(IcsError::CorruptedStream);
        }
        // Discard mtime, xflags and OS code.
        file.seek(SeekFrom::Current(6))
            .map_err(|_| IcsError::CorruptedStream)?;
        if flags & FLAG_EXTRA_FIELD != 0 {
            let len = read_u8(file)? as i64 | (read_u8(file)? as i64) << 8;
            file.seek(SeekFrom::Current(len))
                .map_err(|_| IcsError::CorruptedStream)?;
        }
        if flags & FLAG_ORIG_NAME != 0 {
            while read_u8(file)? != 0 {}
        }
        if flags & FLAG_COMMENT != 0 {
            while read_u8(file)? != 0 {}
        }
        if flags & FLAG_HEAD_CRC != 0 {
            file.seek(SeekFrom::Current(2))
                .map_err(|_| IcsError::CorruptedStream)?;
        }

        Ok(Self {
            stream: Decompress::new(false),
            in_buf: vec![0u8; BUF_SIZE],
            crc: Crc::new(),
        })
    }

    /// Total uncompressed bytes produced since open.
    pub fn total_out(&self) -> u64 {
        self.stream.total_out()
    }

    /// Inflate exactly `dest.len()` bytes from the file into `dest`.
    ///
    /// Refills the input scratch from the file as needed and rewinds the
    /// file by any input left unconsumed before returning. When the deflate
    /// stream ends, the eight trailer bytes are read and checked; a CRC or
    /// length mismatch is [`IcsError::CorruptedStream`], and a stream that
    /// ends before `dest` is filled is [`IcsError::EndOfStream`].
    pub fn read_block(&mut self, file: &mut File, dest: &mut [u8]) -> IcsResult<()> {
        enum StreamState {
            More,
            End,
            Broken,
        }

        if dest.is_empty() {
            return Ok(());
        }

        let len = dest.len();
        let mut todo = len;
        let prev_out = self.stream.total_out();
        let mut state = StreamState::More;

        let unread = loop {
            let filled = file
                .read(&mut self.in_buf)
                .map_err(|_| IcsError::ReadData)?;
            let mut in_pos = 0usize;
            if filled == 0 && todo > 0 {
                state = StreamState::Broken;
                break 0;
            }
            loop {
                if todo == 0 {
                    break;
                }
                let bufsize = todo.min(BUF_SIZE);
                let out_start = len - todo;
                let before_in = self.stream.total_in();
                let before_out = self.stream.total_out();
                // Status::BufError is benign here: it only means more input
                // is needed, which the outer loop provides.
                let status = self
                    .stream
                    .decompress(
                        &self.in_buf[in_pos..filled],
                        &mut dest[out_start..out_start + bufsize],
                        FlushDecompress::None,
                    )
                    .map_err(|_| IcsError::CorruptedStream)?;
                let consumed = (self.stream.total_in() - before_in) as usize;
                let produced = (self.stream.total_out() - before_out) as usize;
                in_pos += consumed;
                todo -= produced;
                self.crc.update(&dest[out_start..out_start + produced]);
                if matches!(status, Status::StreamEnd) {
                    state = StreamState::End;
                    break;
                }
                if produced < bufsize {
                    break; // need more input
                }
            }
            match state {
                StreamState::More if todo > 0 => continue,
                _ => break (filled - in_pos) as i64,
            }
        };

        // Put back input we read but did not consume, so the next call (or a
        // subsequent open of the same file) starts at the right offset.
        file.seek(SeekFrom::Current(-unread))
            .map_err(|_| IcsError::ReadData)?;

        if let StreamState::End = state {
            // All data decompressed: verify CRC and original length.
            if read_u32_le(file)? != self.crc.sum() {
                state = StreamState::Broken;
            } else if read_u32_le(file)? != self.stream.total_out() as u32 {
                state = StreamState::Broken;
            }
        }

        match state {
            StreamState::Broken => Err(IcsError::CorruptedStream),
            StreamState::End => {
                if len as u64 != self.stream.total_out() - prev_out {
                    Err(IcsError::EndOfStream)
                } else {
                    Ok(())
                }
            }
            StreamState::More => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn roundtrip_contiguous(payload: &[u8], level: u8) -> Vec<u8> {
        let mut tmp = NamedTempFile::new().unwrap();
        write_zip(payload, tmp.as_file_mut(), CompressionLevel::new(level)).unwrap();
        tmp.as_file_mut().flush().unwrap();

        let mut file = tmp.reopen().unwrap();
        let mut reader = ZipReader::open(&mut file).unwrap();
        let mut out = vec![0u8; payload.len()];
        reader.read_block(&mut file, &mut out).unwrap();
        out
    }

    #[test]
    fn test_header_bytes() {
        let mut sink = Vec::new();
        write_zip(b"abc", &mut sink, CompressionLevel::default()).unwrap();
        assert_eq!(&sink[..3], &[0x1f, 0x8b, 0x08]);
        assert_eq!(&sink[3..9], &[0, 0, 0, 0, 0, 0]);
        // sink[9] is the OS code, host dependent.
    }

    #[test]
    fn test_roundtrip_all_levels() {
        let payload: Vec<u8> = (0..2048u32).map(|i| (i * 7 % 251) as u8).collect();
        for level in 1..=9 {
            assert_eq!(roundtrip_contiguous(&payload, level), payload);
        }
    }

    #[test]
    fn test_roundtrip_empty() {
        assert_eq!(roundtrip_contiguous(&[], 6), Vec::<u8>::new());
    }

    #[test]
    fn test_strided_write_matches_contiguous() {
        // 4x3 of u16 with identity strides must produce the same member as
        // the contiguous writer.
        let payload: Vec<u8> = (0..24).collect();
        let mut contiguous = Vec::new();
        write_zip(&payload, &mut contiguous, CompressionLevel::default()).unwrap();
        let mut strided = Vec::new();
        write_zip_strided(
            &payload,
            &[4, 3],
            &[1, 4],
            2,
            &mut strided,
            CompressionLevel::default(),
        )
        .unwrap();
        assert_eq!(contiguous, strided);
    }

    #[test]
    fn test_reads_past_member_report_end_of_stream() {
        let payload: Vec<u8> = (0..100).collect();
        let mut tmp = NamedTempFile::new().unwrap();
        write_zip(&payload, tmp.as_file_mut(), CompressionLevel::default()).unwrap();
        tmp.as_file_mut().flush().unwrap();

        let mut file = tmp.reopen().unwrap();
        let mut reader = ZipReader::open(&mut file).unwrap();
        let mut out = vec![0u8; 150];
        assert_eq!(
            reader.read_block(&mut file, &mut out).unwrap_err(),
            IcsError::EndOfStream
        );
    }

    #[test]
    fn test_trailer_crc_mismatch_is_corrupted_stream() {
        let payload: Vec<u8> = (0..100).collect();
        let mut member = Vec::new();
        write_zip(&payload, &mut member, CompressionLevel::default()).unwrap();
        let crc_pos = member.len() - 8;
        member[crc_pos] ^= 0xff;

        let mut tmp = NamedTempFile::new().unwrap();
        tmp.as_file_mut().write_all(&member).unwrap();
        let mut file = tmp.reopen().unwrap();
        let mut reader = ZipReader::open(&mut file).unwrap();
        let mut out = vec![0u8; payload.len()];
        assert_eq!(
            reader.read_block(&mut file, &mut out).unwrap_err(),
            IcsError::CorruptedStream
        );
    }
}
