//! Read-only decoder for the historical compress(1) LZW format
//!
//! Version-1 datasets produced by old pipelines may carry a `.ids.Z` body.
//! The whole body is decoded in a single shot; block and seek operations are
//! rejected at the dispatch layer. Writing this format is not supported.

use std::fs::File;
use std::io::Read;

use crate::error::{IcsError, IcsResult};

const LZW_MAGIC: [u8; 2] = [0x1f, 0x9d];
const BIT_MASK: u8 = 0x1f;
const BLOCK_MODE: u8 = 0x80;
const INIT_BITS: usize = 9;
const MAX_BITS: usize = 16;
const CLEAR: usize = 256;
const FIRST: usize = 257;

/// `n_bits`-wide code at bit position `posbits`, LSB-first packing.
fn read_code(body: &[u8], posbits: usize, n_bits: usize) -> usize {
    let byte = posbits >> 3;
    let mut v = body[byte] as u32;
    if byte + 1 < body.len() {
        v |= (body[byte + 1] as u32) << 8;
    }
    if byte + 2 < body.len() {
        v |= (body[byte + 2] as u32) << 16;
    }
    ((v >> (posbits & 7)) as usize) & ((1 << n_bits) - 1)
}

/// Compressed streams pad the input to a whole group of codes whenever the
/// code width changes; skip to that boundary.
fn align_to_code_group(posbits: usize, n_bits: usize) -> usize {
    let group = n_bits << 3;
    if posbits == 0 {
        0
    } else {
        ((posbits - 1) / group + 1) * group
    }
}

/// Decompress the remainder of `file` into `dest` in one shot.
///
/// Stops once `dest` is full; an input stream that runs dry first is
/// [`IcsError::EndOfStream`].
pub(crate) fn read_compress(file: &mut File, dest: &mut [u8]) -> IcsResult<()> {
    let mut data = Vec::new();
    file.read_to_end(&mut data).map_err(|_| IcsError::ReadData)?;

    if data.len() < 3 || data[0] != LZW_MAGIC[0] || data[1] != LZW_MAGIC[1] {
        return Err(IcsError::CorruptedStream);
    }
    let maxbits = (data[2] & BIT_MASK) as usize;
    let block_mode = data[2] & BLOCK_MODE != 0;
    if maxbits > MAX_BITS {
        return Err(IcsError::DecompressionProblem);
    }
    let maxmaxcode = 1usize << maxbits;
    let body = &data[3..];
    let total_bits = body.len() * 8;

    let mut prefix = vec![0u16; maxmaxcode];
    let mut suffix = vec![0u8; maxmaxcode];
    for (i, s) in suffix.iter_mut().enumerate().take(256) {
        *s = i as u8;
    }

    let mut n_bits = INIT_BITS;
    let mut maxcode = (1usize << n_bits) - 1;
    let mut free_ent = if block_mode { FIRST } else { 256 };
    let mut oldcode: Option<usize> = None;
    let mut finchar = 0u8;
    let mut posbits = 0usize;
    let mut outpos = 0usize;
    let mut stack = Vec::new();

    while outpos < dest.len() {
        if free_ent > maxcode {
            posbits = align_to_code_group(posbits, n_bits);
            n_bits += 1;
            maxcode = if n_bits == maxbits {
                maxmaxcode
            } else {
                (1 << n_bits) - 1
            };
        }
        if posbits + n_bits > total_bits {
            return Err(IcsError::EndOfStream);
        }
        let incode = read_code(body, posbits, n_bits);
        posbits += n_bits;

        let prev = match oldcode {
            None => {
                // First code must be a literal.
                if incode >= 256 {
                    return Err(IcsError::CorruptedStream);
                }
                oldcode = Some(incode);
                finchar = incode as u8;
                dest[outpos] = finchar;
                outpos += 1;
                continue;
            }
            Some(prev) => prev,
        };

        if incode == CLEAR && block_mode {
            free_ent = FIRST - 1;
            posbits = align_to_code_group(posbits, n_bits);
            n_bits = INIT_BITS;
            maxcode = (1 << n_bits) - 1;
            continue;
        }

        let mut code = incode;
        stack.clear();
        if code >= free_ent {
            // KwKwK: the code about to be defined.
            if code > free_ent {
                return Err(IcsError::CorruptedStream);
            }
            stack.push(finchar);
            code = prev;
        }
        while code >= 256 {
            stack.push(suffix[code]);
            code = prefix[code] as usize;
        }
        finchar = suffix[code];
        stack.push(finchar);

        for &b in stack.iter().rev() {
            if outpos >= dest.len() {
                break;
            }
            dest[outpos] = b;
            outpos += 1;
        }

        if free_ent < maxmaxcode {
            prefix[free_ent] = prev as u16;
            suffix[free_ent] = finchar;
            free_ent += 1;
        }
        oldcode = Some(incode);
    }

    Ok(())
}
