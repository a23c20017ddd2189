//! Minimal `.ics` text-header reader and emitter
//!
//! The full header taxonomy (sensor parameters, history, ...) belongs to a
//! richer metadata layer; the codec engine only needs the fields that drive
//! the binary pipeline: layout, sample representation, compression, byte
//! order, and the source-file pointer. Unknown categories are preserved on
//! read by skipping them.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::compression::CompressionMethod;
use crate::error::{IcsError, IcsResult};
use crate::layout::{DimensionDescriptor, ImelDescriptor};
use crate::types::{ByteOrder, DataType};

const SEPARATOR: char = '\t';

/// Header path for a dataset name. Unless forced, the `.ics` suffix
/// replaces whatever extension the caller supplied.
pub(crate) fn ics_path(path: &Path, force_name: bool) -> PathBuf {
    if force_name {
        path.to_path_buf()
    } else {
        path.with_extension("ics")
    }
}

/// Sidecar binary path for a version-1 dataset.
pub(crate) fn ids_path(path: &Path) -> PathBuf {
    path.with_extension("ids")
}

/// Everything the binary pipeline consumes from (or persists into) the
/// text header.
#[derive(Debug)]
pub(crate) struct HeaderFields {
    pub version: u8,
    pub filename: String,
    pub dims: Vec<DimensionDescriptor>,
    pub imel: ImelDescriptor,
    pub coord: String,
    pub scil_type: String,
    pub byte_order: ByteOrder,
    pub compression: CompressionMethod,
    /// Explicit `source` lines, for bodies living in another file.
    pub source: Option<(PathBuf, u64)>,
}

fn format_keyword(data_type: DataType) -> (&'static str, &'static str) {
    let format = if data_type.is_complex() {
        "complex"
    } else if data_type.is_float() {
        "real"
    } else {
        "integer"
    };
    let sign = if data_type.is_signed() {
        "signed"
    } else {
        "unsigned"
    };
    (format, sign)
}

fn resolve_data_type(format: &str, sign: &str, bits: usize) -> IcsResult<DataType> {
    let signed = sign == "signed";
    match (format, bits) {
        ("integer", 8) => Ok(if signed { DataType::S8 } else { DataType::U8 }),
        ("integer", 16) => Ok(if signed { DataType::S16 } else { DataType::U16 }),
        ("integer", 32) => Ok(if signed { DataType::S32 } else { DataType::U32 }),
        ("real", 32) => Ok(DataType::F32),
        ("real", 64) => Ok(DataType::F64),
        ("complex", 64) => Ok(DataType::C32),
        ("complex", 128) => Ok(DataType::C64),
        _ => Err(IcsError::UnknownDataType),
    }
}

/// Emit the header to `path`, truncating any previous contents. Returns the
/// byte offset just past the `end` line, where an embedded version-2 body
/// would begin.
pub(crate) fn write_header(fields: &HeaderFields, path: &Path) -> IcsResult<u64> {
    let file = File::create(path).map_err(|_| IcsError::OpenHeader)?;
    let mut w = CountingWriter {
        inner: BufWriter::new(file),
        written: 0,
    };
    emit(fields, &mut w).map_err(|_| IcsError::WriteHeader)?;
    w.inner.flush().map_err(|_| IcsError::WriteHeader)?;
    Ok(w.written)
}

struct CountingWriter {
    inner: BufWriter<File>,
    written: u64,
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn emit<W: Write>(fields: &HeaderFields, w: &mut W) -> std::io::Result<()> {
    let s = SEPARATOR;
    let width = fields.imel.data_type.size_in_bytes();

    writeln!(w, "{}", s)?;
    writeln!(w, "ics_version{}{}.0", s, fields.version)?;
    writeln!(w, "filename{}{}", s, fields.filename)?;

    writeln!(w, "layout{}parameters{}{}", s, s, fields.dims.len() + 1)?;
    write!(w, "layout{}order{}bits", s, s)?;
    for d in &fields.dims {
        write!(w, "{}{}", s, d.order)?;
    }
    writeln!(w)?;
    write!(w, "layout{}sizes{}{}", s, s, width * 8)?;
    for d in &fields.dims {
        write!(w, "{}{}", s, d.size)?;
    }
    writeln!(w)?;
    writeln!(w, "layout{}coordinates{}{}", s, s, fields.coord)?;
    writeln!(
        w,
        "layout{}significant_bits{}{}",
        s, s, fields.imel.sig_bits
    )?;

    let (format, sign) = format_keyword(fields.imel.data_type);
    writeln!(w, "representation{}format{}{}", s, s, format)?;
    writeln!(w, "representation{}sign{}{}", s, s, sign)?;
    writeln!(
        w,
        "representation{}compression{}{}",
        s,
        s,
        fields.compression.as_str()
    )?;
    write!(w, "representation{}byte_order", s)?;
    for &e in fields.byte_order.entries(fields.imel.data_type.sample_width()) {
        write!(w, "{}{}", s, e)?;
    }
    writeln!(w)?;
    if !fields.scil_type.is_empty() {
        writeln!(w, "representation{}SCIL_TYPE{}{}", s, s, fields.scil_type)?;
    }

    write!(w, "parameter{}origin{}{}", s, s, fields.imel.origin)?;
    for d in &fields.dims {
        write!(w, "{}{}", s, d.origin)?;
    }
    writeln!(w)?;
    write!(w, "parameter{}scale{}{}", s, s, fields.imel.scale)?;
    for d in &fields.dims {
        write!(w, "{}{}", s, d.scale)?;
    }
    writeln!(w)?;
    write!(w, "parameter{}units{}{}", s, s, fields.imel.unit)?;
    for d in &fields.dims {
        write!(w, "{}{}", s, d.unit)?;
    }
    writeln!(w)?;
    write!(w, "parameter{}labels{}intensity", s, s)?;
    for d in &fields.dims {
        write!(w, "{}{}", s, d.label)?;
    }
    writeln!(w)?;

    if let Some((src, offset)) = &fields.source {
        writeln!(w, "source{}file{}{}", s, s, src.display())?;
        writeln!(w, "source{}offset{}{}", s, s, offset)?;
    }

    writeln!(w, "end")?;
    Ok(())
}

struct LineReader {
    inner: BufReader<File>,
    consumed: u64,
    buf: Vec<u8>,
}

impl LineReader {
    fn next_line(&mut self) -> IcsResult<Option<String>> {
        self.buf.clear();
        let n = self
            .inner
            .read_until(b'\n', &mut self.buf)
            .map_err(|_| IcsError::ReadHeader)?;
        if n == 0 {
            return Ok(None);
        }
        self.consumed += n as u64;
        let mut line = String::from_utf8_lossy(&self.buf).into_owned();
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }
}

fn parse_usize(token: &str) -> IcsResult<usize> {
    token.trim().parse().map_err(|_| IcsError::NotIcsFile)
}

fn parse_f64(token: &str) -> IcsResult<f64> {
    token.trim().parse().map_err(|_| IcsError::NotIcsFile)
}

/// Read the header of the file at `path`. Returns the parsed fields and the
/// byte offset just past the `end` line.
pub(crate) fn read_header(path: &Path) -> IcsResult<(HeaderFields, u64)> {
    let file = File::open(path).map_err(|_| IcsError::OpenHeader)?;
    let mut reader = LineReader {
        inner: BufReader::new(file),
        consumed: 0,
        buf: Vec::new(),
    };

    // First line declares the separator characters.
    let sep_line = reader.next_line()?.ok_or(IcsError::NotIcsFile)?;
    let sep = sep_line.chars().next().unwrap_or(SEPARATOR);

    let mut version = 0u8;
    let mut filename = String::new();
    let mut dims: Vec<DimensionDescriptor> = Vec::new();
    let mut bits: Option<usize> = None;
    let mut format = String::from("integer");
    let mut sign = String::from("unsigned");
    let mut sig_bits: Option<usize> = None;
    let mut coord = String::new();
    let mut scil_type = String::new();
    let mut byte_order = ByteOrder::unspecified();
    let mut compression = CompressionMethod::Uncompressed;
    let mut imel_origin = 0.0f64;
    let mut imel_scale = 1.0f64;
    let mut imel_unit = String::new();
    let mut source_file: Option<PathBuf> = None;
    let mut source_offset = 0u64;

    fn ensure_dims(dims: &mut Vec<DimensionDescriptor>, n: usize) {
        while dims.len() < n {
            let index = dims.len();
            dims.push(DimensionDescriptor::new(index, 0));
        }
    }

    loop {
        let line = match reader.next_line()? {
            Some(line) => line,
            None => return Err(IcsError::NotIcsFile), // no `end` keyword
        };
        let tokens: Vec<&str> = line.split(sep).collect();
        match tokens.first().map(|t| t.trim()) {
            Some("end") => break,
            Some("ics_version") => {
                let value = tokens.get(1).unwrap_or(&"").trim();
                version = if value.starts_with('1') {
                    1
                } else if value.starts_with('2') {
                    2
                } else {
                    return Err(IcsError::NotIcsFile);
                };
            }
            Some("filename") => {
                filename = tokens.get(1).unwrap_or(&"").trim().to_string();
            }
            Some("layout") => match tokens.get(1).map(|t| t.trim()) {
                Some("parameters") => {
                    let n = parse_usize(tokens.get(2).ok_or(IcsError::NotIcsFile)?)?;
                    if n == 0 {
                        return Err(IcsError::NotIcsFile);
                    }
                    ensure_dims(&mut dims, n - 1);
                }
                Some("order") => {
                    // First entry is the imel pseudo-dimension "bits".
                    ensure_dims(&mut dims, tokens.len().saturating_sub(3));
                    for (i, t) in tokens.iter().skip(3).enumerate() {
                        dims[i].order = t.trim().to_string();
                    }
                }
                Some("sizes") => {
                    bits = Some(parse_usize(tokens.get(2).ok_or(IcsError::NotIcsFile)?)?);
                    ensure_dims(&mut dims, tokens.len().saturating_sub(3));
                    for (i, t) in tokens.iter().skip(3).enumerate() {
                        dims[i].size = parse_usize(t)?;
                    }
                }
                Some("coordinates") => {
                    coord = tokens.get(2).unwrap_or(&"").trim().to_string();
                }
                Some("significant_bits") => {
                    sig_bits = Some(parse_usize(tokens.get(2).ok_or(IcsError::NotIcsFile)?)?);
                }
                _ => {}
            },
            Some("representation") => match tokens.get(1).map(|t| t.trim()) {
                Some("format") => {
                    format = tokens.get(2).unwrap_or(&"").trim().to_string();
                }
                Some("sign") => {
                    sign = tokens.get(2).unwrap_or(&"").trim().to_string();
                }
                Some("compression") => {
                    let keyword = tokens.get(2).unwrap_or(&"").trim();
                    compression = CompressionMethod::from_str_opt(keyword)
                        .ok_or(IcsError::UnknownCompression)?;
                }
                Some("byte_order") => {
                    let entries: Vec<usize> = tokens
                        .iter()
                        .skip(2)
                        .filter(|t| !t.trim().is_empty())
                        .map(|t| parse_usize(t))
                        .collect::<IcsResult<_>>()?;
                    byte_order = ByteOrder::from_entries(&entries);
                }
                Some("SCIL_TYPE") => {
                    scil_type = tokens.get(2).unwrap_or(&"").trim().to_string();
                }
                _ => {}
            },
            Some("parameter") => {
                let values = &tokens[2.min(tokens.len())..];
                match tokens.get(1).map(|t| t.trim()) {
                    Some("origin") => {
                        if let Some(first) = values.first() {
                            imel_origin = parse_f64(first)?;
                        }
                        ensure_dims(&mut dims, values.len().saturating_sub(1));
                        for (i, t) in values.iter().skip(1).enumerate() {
                            dims[i].origin = parse_f64(t)?;
                        }
                    }
                    Some("scale") => {
                        if let Some(first) = values.first() {
                            imel_scale = parse_f64(first)?;
                        }
                        ensure_dims(&mut dims, values.len().saturating_sub(1));
                        for (i, t) in values.iter().skip(1).enumerate() {
                            dims[i].scale = parse_f64(t)?;
                        }
                    }
                    Some("units") => {
                        if let Some(first) = values.first() {
                            imel_unit = first.trim().to_string();
                        }
                        ensure_dims(&mut dims, values.len().saturating_sub(1));
                        for (i, t) in values.iter().skip(1).enumerate() {
                            dims[i].unit = t.trim().to_string();
                        }
                    }
                    Some("labels") => {
                        ensure_dims(&mut dims, values.len().saturating_sub(1));
                        for (i, t) in values.iter().skip(1).enumerate() {
                            dims[i].label = t.trim().to_string();
                        }
                    }
                    _ => {}
                }
            }
            Some("source") => match tokens.get(1).map(|t| t.trim()) {
                Some("file") => {
                    source_file = Some(PathBuf::from(tokens.get(2).unwrap_or(&"").trim()));
                }
                Some("offset") => {
                    source_offset = parse_usize(tokens.get(2).ok_or(IcsError::NotIcsFile)?)? as u64;
                }
                _ => {}
            },
            // history and anything else the engine does not consume
            _ => {}
        }
    }

    if version == 0 {
        return Err(IcsError::NotIcsFile);
    }
    if dims.is_empty() || dims.iter().any(|d| d.size == 0) {
        return Err(IcsError::NoLayout);
    }
    let bits = bits.ok_or(IcsError::NoLayout)?;
    let data_type = resolve_data_type(&format, &sign, bits)?;

    let imel = ImelDescriptor {
        data_type,
        sig_bits: sig_bits.unwrap_or(bits),
        origin: imel_origin,
        scale: imel_scale,
        unit: imel_unit,
    };

    let fields = HeaderFields {
        version,
        filename,
        dims,
        imel,
        coord,
        scil_type,
        byte_order,
        compression,
        source: source_file.map(|f| (f, source_offset)),
    };
    Ok((fields, reader.consumed))
}
