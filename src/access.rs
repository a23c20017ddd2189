//! Dataset handle and the access API
//!
//! An [`Ics`] owns the in-memory metadata record, the open-for-read or
//! open-for-write state, and the body stream while a read is in flight. All
//! operations are synchronous; the handle is not meant to be shared between
//! threads.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::compression::{CompressionLevel, CompressionMethod};
use crate::error::{IcsError, IcsResult, Warning};
use crate::gzip;
use crate::header::{self, HeaderFields};
use crate::io::{self, BlockReader};
use crate::layout::{self, DimensionDescriptor, ImelDescriptor};
use crate::types::{ByteOrder, DataType};
use crate::utils::{self, LineWalker};
use crate::MAX_DIM;

/// ICS format version of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// Text header in `.ics`, binary body in a sibling `.ids`
    V1,
    /// Single file: text header followed by the body
    V2,
}

impl Version {
    fn number(&self) -> u8 {
        match self {
            Version::V1 => 1,
            Version::V2 => 2,
        }
    }
}

/// What the handle was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    /// Rewrite the header of an existing dataset, preserving its body
    Update,
}

/// A caller-attached source buffer for a pending write. Borrowed, never
/// copied; it must stay valid until the handle is closed.
#[derive(Debug)]
struct DataSource<'buf> {
    buf: &'buf [u8],
    strides: Option<Vec<usize>>,
}

#[derive(Debug)]
struct OpenMode {
    reading: bool,
    writing: bool,
    force_name: bool,
    force_locale: bool,
    version: Option<Version>,
}

fn parse_mode(mode: &str) -> IcsResult<OpenMode> {
    let mut m = OpenMode {
        reading: false,
        writing: false,
        force_name: false,
        force_locale: true,
        version: None,
    };
    for c in mode.chars() {
        match c {
            'r' => {
                if m.reading {
                    return Err(IcsError::IllParameter);
                }
                m.reading = true;
            }
            'w' => {
                if m.writing {
                    return Err(IcsError::IllParameter);
                }
                m.writing = true;
            }
            'f' => {
                if m.force_name {
                    return Err(IcsError::IllParameter);
                }
                m.force_name = true;
            }
            'l' => {
                if !m.force_locale {
                    return Err(IcsError::IllParameter);
                }
                m.force_locale = false;
            }
            '1' => {
                if m.version.is_some() {
                    return Err(IcsError::IllParameter);
                }
                m.version = Some(Version::V1);
            }
            '2' => {
                if m.version.is_some() {
                    return Err(IcsError::IllParameter);
                }
                m.version = Some(Version::V2);
            }
            _ => return Err(IcsError::IllParameter),
        }
    }
    if !m.reading && !m.writing {
        return Err(IcsError::IllParameter);
    }
    Ok(m)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// An open ICS dataset.
///
/// The lifetime parameter ties any buffer attached with
/// [`set_data`](Ics::set_data) to the handle: the buffer is borrowed, not
/// copied, and is read when the handle is closed.
#[derive(Debug)]
pub struct Ics<'buf> {
    version: Version,
    mode: FileMode,
    path: PathBuf,
    source: Option<(PathBuf, u64)>,
    imel: ImelDescriptor,
    dims: Vec<DimensionDescriptor>,
    coord: String,
    scil_type: String,
    byte_order: ByteOrder,
    compression: CompressionMethod,
    level: CompressionLevel,
    data: Option<DataSource<'buf>>,
    reader: Option<BlockReader>,
}

impl<'buf> Ics<'buf> {
    /// Open a dataset.
    ///
    /// The mode string contains `r` for reading, `w` for writing, or both
    /// for updating an existing file in place. `f` skips the `.ics`/`.ids`
    /// suffix synthesis, `l` disables locale forcing during header I/O, and
    /// `1`/`2` pin the format version for writing. Duplicate or unknown
    /// characters, or a string with neither `r` nor `w`, are rejected.
    pub fn open(path: impl AsRef<Path>, mode: &str) -> IcsResult<Self> {
        let m = parse_mode(mode)?;
        if !m.force_locale {
            // Rust numeric parsing never consults the process locale, so
            // there is nothing to disable; the flag is accepted for
            // compatibility.
            debug!("C locale forcing disabled for header I/O");
        }
        let header_path = header::ics_path(path.as_ref(), m.force_name);

        if m.reading {
            let (fields, data_offset) = header::read_header(&header_path)?;
            let version = if fields.version == 1 {
                Version::V1
            } else {
                Version::V2
            };
            let source = match fields.source {
                Some(source) => Some(source),
                None if version == Version::V2 => Some((header_path.clone(), data_offset)),
                None => None,
            };
            let file_mode = if m.writing {
                FileMode::Update
            } else {
                FileMode::Read
            };
            debug!(
                "opened {:?} (\"{}\") for {:?} (version {})",
                header_path,
                fields.filename,
                file_mode,
                version.number()
            );
            Ok(Self {
                version,
                mode: file_mode,
                path: header_path,
                source,
                imel: fields.imel,
                dims: fields.dims,
                coord: fields.coord,
                scil_type: fields.scil_type,
                byte_order: fields.byte_order,
                compression: fields.compression,
                level: CompressionLevel::default(),
                data: None,
                reader: None,
            })
        } else {
            let version = m.version.unwrap_or(Version::V2);
            debug!(
                "opened {:?} for writing (version {})",
                header_path,
                version.number()
            );
            Ok(Self {
                version,
                mode: FileMode::Write,
                path: header_path,
                source: None,
                imel: ImelDescriptor::default(),
                dims: Vec::new(),
                coord: String::new(),
                scil_type: String::new(),
                byte_order: ByteOrder::unspecified(),
                compression: CompressionMethod::default(),
                level: CompressionLevel::default(),
                data: None,
                reader: None,
            })
        }
    }

    /// The format version of this dataset.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The mode the dataset was opened in.
    pub fn mode(&self) -> FileMode {
        self.mode
    }

    /// The resolved header path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_data_read(&self) -> IcsResult<()> {
        match self.mode {
            FileMode::Read | FileMode::Update => Ok(()),
            FileMode::Write => Err(IcsError::NotValidAction),
        }
    }

    fn check_data_write(&self) -> IcsResult<()> {
        match self.mode {
            FileMode::Write => Ok(()),
            _ => Err(IcsError::NotValidAction),
        }
    }

    fn check_meta_write(&self) -> IcsResult<()> {
        match self.mode {
            FileMode::Write | FileMode::Update => Ok(()),
            FileMode::Read => Err(IcsError::NotValidAction),
        }
    }

    // ------------------------------------------------------------------
    // Layout
    // ------------------------------------------------------------------

    /// Sample type, dimension count and sizes. Valid when reading or
    /// updating.
    pub fn layout(&self) -> IcsResult<(DataType, Vec<usize>)> {
        self.check_data_read()?;
        Ok((
            self.imel.data_type,
            self.dims.iter().map(|d| d.size).collect(),
        ))
    }

    /// Store the layout for a dataset being written. Installs the default
    /// order names and labels; sizes are fixed from here on.
    pub fn set_layout(&mut self, data_type: DataType, sizes: &[usize]) -> IcsResult<()> {
        self.check_data_write()?;
        if sizes.len() > MAX_DIM {
            return Err(IcsError::TooManyDims);
        }
        self.imel.data_type = data_type;
        self.imel.sig_bits = data_type.size_in_bytes() * 8;
        self.dims = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| DimensionDescriptor::new(i, size))
            .collect();
        self.byte_order = ByteOrder::native(data_type.sample_width());
        Ok(())
    }

    /// Body size in bytes. Zero when no layout is set.
    pub fn data_size(&self) -> usize {
        layout::data_size(&self.dims, self.imel.data_type)
    }

    /// Size of one imel in bytes.
    pub fn imel_size(&self) -> usize {
        self.imel.data_type.size_in_bytes()
    }

    /// Number of imels in the image. Zero when no layout is set.
    pub fn image_size(&self) -> usize {
        layout::image_size(&self.dims)
    }

    // ------------------------------------------------------------------
    // Body reading
    // ------------------------------------------------------------------

    fn open_ids(&mut self) -> IcsResult<()> {
        self.reader = None;
        let (body_path, offset) = match self.version {
            Version::V1 => {
                let mut body = header::ids_path(&self.path);
                if !body.exists() {
                    let gz = append_suffix(&body, ".gz");
                    let z = append_suffix(&body, ".Z");
                    if gz.exists() {
                        debug!("{:?} missing, falling back to {:?}", body, gz);
                        self.compression = CompressionMethod::Gzip;
                        body = gz;
                    } else if z.exists() {
                        debug!("{:?} missing, falling back to {:?}", body, z);
                        self.compression = CompressionMethod::Compress;
                        body = z;
                    } else {
                        return Err(IcsError::OpenData);
                    }
                }
                (body, 0)
            }
            Version::V2 => self.source.clone().ok_or(IcsError::MissingData)?,
        };
        self.reader = Some(BlockReader::open(&body_path, offset, self.compression)?);
        Ok(())
    }

    fn read_ids_block(&mut self, dest: &mut [u8]) -> IcsResult<()> {
        let reader = self.reader.as_mut().ok_or(IcsError::NotValidAction)?;
        reader.read_block(dest)?;
        utils::reorder_samples(dest, &self.byte_order, self.imel.data_type.sample_width())
    }

    fn skip_ids(&mut self, n: u64) -> IcsResult<()> {
        let reader = self.reader.as_mut().ok_or(IcsError::NotValidAction)?;
        reader.skip_block(n)
    }

    /// Stream the whole body into `dest`: open, read, close.
    pub fn get_data(&mut self, dest: &mut [u8]) -> IcsResult<()> {
        self.check_data_read()?;
        if dest.is_empty() {
            return Ok(());
        }
        self.open_ids()?;
        let result = self.read_ids_block(dest);
        self.reader = None;
        result
    }

    /// Read the next `dest.len()` body bytes. Opens the body stream on the
    /// first call; reads and skips may be interleaved.
    pub fn get_data_block(&mut self, dest: &mut [u8]) -> IcsResult<()> {
        self.check_data_read()?;
        if dest.is_empty() {
            return Ok(());
        }
        if self.reader.is_none() {
            self.open_ids()?;
        }
        self.read_ids_block(dest)
    }

    /// Skip `n` decoded body bytes forward.
    pub fn skip_data_block(&mut self, n: u64) -> IcsResult<()> {
        self.check_data_read()?;
        if n == 0 {
            return Ok(());
        }
        if self.reader.is_none() {
            self.open_ids()?;
        }
        self.skip_ids(n)
    }

    /// Read a rectangular, optionally sub-sampled region of the image.
    ///
    /// Defaults: offset all-zero, size to the end of each dimension,
    /// sampling one. The output holds `ceil(size_i / sampling_i)` samples
    /// per dimension; a larger destination completes with
    /// [`Warning::OutputNotFilled`], a smaller one fails with
    /// [`IcsError::BufferTooSmall`].
    pub fn get_roi_data(
        &mut self,
        offset: Option<&[usize]>,
        size: Option<&[usize]>,
        sampling: Option<&[usize]>,
        dest: &mut [u8],
    ) -> IcsResult<Option<Warning>> {
        self.check_data_read()?;
        if dest.is_empty() {
            return Ok(None);
        }
        let p = self.dims.len();
        for arg in [offset, size, sampling].into_iter().flatten() {
            if arg.len() != p {
                return Err(IcsError::IllParameter);
            }
        }
        let offset: Vec<usize> = match offset {
            Some(o) => o.to_vec(),
            None => vec![0; p],
        };
        let size: Vec<usize> = match size {
            Some(s) => s.to_vec(),
            None => self
                .dims
                .iter()
                .zip(&offset)
                .map(|(d, &o)| d.size - o.min(d.size))
                .collect(),
        };
        let sampling: Vec<usize> = match sampling {
            Some(s) => s.to_vec(),
            None => vec![1; p],
        };
        for i in 0..p {
            if sampling[i] < 1 || offset[i] + size[i] > self.dims[i].size {
                return Err(IcsError::IllegalRoi);
            }
        }

        let width = self.imel.data_type.size_in_bytes();
        let roi_size = width
            * size
                .iter()
                .zip(&sampling)
                .map(|(&s, &g)| (s + g - 1) / g)
                .product::<usize>();
        let mut size_conflict = false;
        if dest.len() != roi_size {
            size_conflict = true;
            if dest.len() < roi_size {
                return Err(IcsError::BufferTooSmall);
            }
        }

        let strides = layout::contiguous_strides(&self.dims);
        let line_len = width * size[0];
        self.open_ids()?;
        let result = (|| -> IcsResult<()> {
            let mut walker = LineWalker::with_region(&offset, &size, &sampling);
            let mut cur_loc = 0u64;
            let mut out_pos = 0usize;
            if sampling[0] > 1 {
                // Read each line into a scratch, then keep every
                // sampling[0]-th imel.
                let mut line = vec![0u8; line_len];
                loop {
                    let new_loc = (walker.offset(&strides) * width) as u64;
                    if cur_loc < new_loc {
                        self.skip_ids(new_loc - cur_loc)?;
                        cur_loc = new_loc;
                    }
                    self.read_ids_block(&mut line)?;
                    cur_loc += line_len as u64;
                    let mut j = 0;
                    while j < size[0] {
                        dest[out_pos..out_pos + width]
                            .copy_from_slice(&line[j * width..(j + 1) * width]);
                        out_pos += width;
                        j += sampling[0];
                    }
                    if !walker.advance() {
                        break;
                    }
                }
            } else {
                // No sub-sampling along dimension 0: read straight into dest.
                loop {
                    let new_loc = (walker.offset(&strides) * width) as u64;
                    if cur_loc < new_loc {
                        self.skip_ids(new_loc - cur_loc)?;
                        cur_loc = new_loc;
                    }
                    self.read_ids_block(&mut dest[out_pos..out_pos + line_len])?;
                    cur_loc += line_len as u64;
                    out_pos += line_len;
                    if !walker.advance() {
                        break;
                    }
                }
            }
            Ok(())
        })();
        self.reader = None;
        result?;

        Ok(size_conflict.then_some(Warning::OutputNotFilled))
    }

    /// Read the whole body into a caller-strided destination. Strides are
    /// in imels; identity strides are used when none are given.
    pub fn get_data_with_strides(
        &mut self,
        dest: &mut [u8],
        strides: Option<&[usize]>,
    ) -> IcsResult<()> {
        self.check_data_read()?;
        if dest.is_empty() {
            return Ok(());
        }
        let p = self.dims.len();
        if let Some(s) = strides {
            if s.len() != p {
                return Err(IcsError::IllParameter);
            }
        }
        let strides: Vec<usize> = match strides {
            Some(s) => s.to_vec(),
            None => layout::contiguous_strides(&self.dims),
        };
        let width = self.imel.data_type.size_in_bytes();
        let last_pixel: usize = self
            .dims
            .iter()
            .zip(&strides)
            .map(|(d, &s)| (d.size - 1) * s)
            .sum();
        if (last_pixel + 1) * width > dest.len() {
            return Err(IcsError::IllParameter);
        }

        let dim_sizes: Vec<usize> = self.dims.iter().map(|d| d.size).collect();
        let line_len = width * dim_sizes[0];
        self.open_ids()?;
        let result = (|| -> IcsResult<()> {
            let mut walker = LineWalker::new(&dim_sizes);
            if strides[0] > 1 {
                // Scatter each line imel by imel.
                let mut line = vec![0u8; line_len];
                loop {
                    let out_base = walker.offset(&strides) * width;
                    self.read_ids_block(&mut line)?;
                    for j in 0..dim_sizes[0] {
                        let off = out_base + j * strides[0] * width;
                        dest[off..off + width]
                            .copy_from_slice(&line[j * width..(j + 1) * width]);
                    }
                    if !walker.advance() {
                        break;
                    }
                }
            } else {
                loop {
                    let out_base = walker.offset(&strides) * width;
                    self.read_ids_block(&mut dest[out_base..out_base + line_len])?;
                    if !walker.advance() {
                        break;
                    }
                }
            }
            Ok(())
        })();
        self.reader = None;
        result
    }

    // ------------------------------------------------------------------
    // Body writing
    // ------------------------------------------------------------------

    /// Attach `src` as the body for the pending write. The buffer is
    /// borrowed until close. A length that disagrees with the layout is
    /// reported as [`Warning::SizeConflict`] but the buffer is attached
    /// anyway.
    pub fn set_data(&mut self, src: &'buf [u8]) -> IcsResult<Option<Warning>> {
        self.check_data_write()?;
        if self.source.is_some() || self.data.is_some() {
            return Err(IcsError::DuplicateData);
        }
        if self.dims.is_empty() {
            return Err(IcsError::NoLayout);
        }
        let warning = (src.len() != self.data_size()).then_some(Warning::SizeConflict);
        self.data = Some(DataSource {
            buf: src,
            strides: None,
        });
        Ok(warning)
    }

    /// Attach `src` with explicit strides (in imels) describing how to walk
    /// it. Use this when the image is not one contiguous block or when
    /// dimensions should be swapped on the way out.
    pub fn set_data_with_strides(
        &mut self,
        src: &'buf [u8],
        strides: &[usize],
    ) -> IcsResult<Option<Warning>> {
        self.check_data_write()?;
        if self.source.is_some() || self.data.is_some() {
            return Err(IcsError::DuplicateData);
        }
        if self.dims.is_empty() {
            return Err(IcsError::NoLayout);
        }
        if strides.len() != self.dims.len() {
            return Err(IcsError::IllParameter);
        }
        let last_pixel: usize = self
            .dims
            .iter()
            .zip(strides)
            .map(|(d, &s)| (d.size - 1) * s)
            .sum();
        if (last_pixel + 1) * self.imel.data_type.size_in_bytes() > src.len() {
            return Err(IcsError::IllParameter);
        }
        let warning = (src.len() != self.data_size()).then_some(Warning::SizeConflict);
        self.data = Some(DataSource {
            buf: src,
            strides: Some(strides.to_vec()),
        });
        Ok(warning)
    }

    /// Name an external file (and offset) as the body source instead of an
    /// in-memory buffer. Only version-2 datasets can point elsewhere.
    pub fn set_source(&mut self, path: impl Into<PathBuf>, offset: u64) -> IcsResult<()> {
        self.check_data_write()?;
        if self.version == Version::V1 {
            return Err(IcsError::NotValidAction);
        }
        if self.source.is_some() || self.data.is_some() {
            return Err(IcsError::DuplicateData);
        }
        self.source = Some((path.into(), offset));
        Ok(())
    }

    /// Record the compression method and level for the pending write.
    /// Writing compress(1) data is not supported; it is silently upgraded
    /// to gzip.
    pub fn set_compression(
        &mut self,
        mut method: CompressionMethod,
        level: CompressionLevel,
    ) -> IcsResult<()> {
        self.check_data_write()?;
        if method == CompressionMethod::Compress {
            debug!("compress(1) output not supported, writing gzip instead");
            method = CompressionMethod::Gzip;
        }
        self.compression = method;
        self.level = level;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Positional metadata
    // ------------------------------------------------------------------

    /// Origin, scale and unit of a dimension. An unset unit reads as
    /// `"undefined"`.
    pub fn position(&self, dimension: usize) -> IcsResult<(f64, f64, &str)> {
        let d = self
            .dims
            .get(dimension)
            .ok_or(IcsError::NotValidAction)?;
        let unit = if d.unit.is_empty() {
            layout::UNITS_UNDEFINED
        } else {
            &d.unit
        };
        Ok((d.origin, d.scale, unit))
    }

    /// Set origin, scale and unit of a dimension. An empty unit falls back
    /// to `"undefined"`.
    pub fn set_position(
        &mut self,
        dimension: usize,
        origin: f64,
        scale: f64,
        units: Option<&str>,
    ) -> IcsResult<()> {
        self.check_meta_write()?;
        let d = self
            .dims
            .get_mut(dimension)
            .ok_or(IcsError::NotValidAction)?;
        d.origin = origin;
        d.scale = scale;
        d.unit = match units {
            Some(u) if !u.is_empty() => u.to_string(),
            _ => layout::UNITS_UNDEFINED.to_string(),
        };
        Ok(())
    }

    /// Order name and label of a dimension.
    pub fn order(&self, dimension: usize) -> IcsResult<(&str, &str)> {
        let d = self
            .dims
            .get(dimension)
            .ok_or(IcsError::NotValidAction)?;
        Ok((&d.order, &d.label))
    }

    /// Rename a dimension. A missing label defaults to the order name; an
    /// empty order with a label updates only the label.
    pub fn set_order(
        &mut self,
        dimension: usize,
        order: &str,
        label: Option<&str>,
    ) -> IcsResult<()> {
        self.check_meta_write()?;
        let d = self
            .dims
            .get_mut(dimension)
            .ok_or(IcsError::NotValidAction)?;
        let label = label.filter(|l| !l.is_empty());
        if !order.is_empty() {
            d.order = order.to_string();
            d.label = label.unwrap_or(order).to_string();
            Ok(())
        } else if let Some(label) = label {
            d.label = label.to_string();
            Ok(())
        } else {
            Err(IcsError::NotValidAction)
        }
    }

    /// Coordinate-system name; `"video"` when never set.
    pub fn coordinate_system(&self) -> &str {
        if self.coord.is_empty() {
            layout::COORD_VIDEO
        } else {
            &self.coord
        }
    }

    /// Set the coordinate-system name; empty resets to `"video"`.
    pub fn set_coordinate_system(&mut self, coord: &str) -> IcsResult<()> {
        self.check_meta_write()?;
        self.coord = if coord.is_empty() {
            layout::COORD_VIDEO.to_string()
        } else {
            coord.to_string()
        };
        Ok(())
    }

    /// Number of significant bits per imel.
    pub fn significant_bits(&self) -> IcsResult<usize> {
        self.check_data_read()?;
        Ok(self.imel.sig_bits)
    }

    /// Set the number of significant bits, clamped to the sample width.
    pub fn set_significant_bits(&mut self, nbits: usize) -> IcsResult<()> {
        self.check_data_write()?;
        if self.dims.is_empty() {
            return Err(IcsError::NoLayout);
        }
        let max_bits = self.imel.data_type.size_in_bytes() * 8;
        self.imel.sig_bits = nbits.min(max_bits);
        Ok(())
    }

    /// Origin, scale and unit of the imel values. An unset unit reads as
    /// `"relative"`.
    pub fn imel_units(&self) -> (f64, f64, &str) {
        let unit = if self.imel.unit.is_empty() {
            layout::UNITS_RELATIVE
        } else {
            &self.imel.unit
        };
        (self.imel.origin, self.imel.scale, unit)
    }

    /// Set origin, scale and unit of the imel values; an empty unit falls
    /// back to `"relative"`.
    pub fn set_imel_units(
        &mut self,
        origin: f64,
        scale: f64,
        units: Option<&str>,
    ) -> IcsResult<()> {
        self.check_meta_write()?;
        self.imel.origin = origin;
        self.imel.scale = scale;
        self.imel.unit = match units {
            Some(u) if !u.is_empty() => u.to_string(),
            _ => layout::UNITS_RELATIVE.to_string(),
        };
        Ok(())
    }

    /// The SCIL_TYPE tag, empty when never set.
    pub fn scil_type(&self) -> &str {
        &self.scil_type
    }

    /// Set the SCIL_TYPE tag.
    pub fn set_scil_type(&mut self, scil_type: &str) -> IcsResult<()> {
        self.check_meta_write()?;
        self.scil_type = scil_type.to_string();
        Ok(())
    }

    /// Derive the SCIL_TYPE tag from the sample type and dimensionality.
    /// Only g/f/c prefixes exist, and only for 2-D and 3-D images.
    pub fn guess_scil_type(&mut self) -> IcsResult<()> {
        self.check_meta_write()?;
        let prefix = match self.imel.data_type {
            DataType::U8 | DataType::S8 | DataType::U16 | DataType::S16 => 'g',
            DataType::F32 => 'f',
            DataType::C32 => 'c',
            DataType::U32 | DataType::S32 | DataType::F64 | DataType::C64 => {
                return Err(IcsError::NoScilType)
            }
            DataType::Unknown => {
                self.scil_type.clear();
                return Err(IcsError::NotValidAction);
            }
        };
        if self.dims.len() > 3 {
            self.scil_type.clear();
            return Err(IcsError::NoScilType);
        }
        let suffix = if self.dims.len() == 3 { '3' } else { '2' };
        self.scil_type = format!("{}{}d", prefix, suffix);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Close the dataset, flushing pending writes.
    ///
    /// Reading: finalizes any in-flight body stream. Writing: emits the
    /// header, then the body (to a sibling `.ids` for version 1, appended
    /// to the same file for version 2). Updating: rewrites the header in
    /// place, preserving the body; if anything fails after the original
    /// file was renamed aside, the original is restored.
    pub fn close(mut self) -> IcsResult<()> {
        match self.mode {
            FileMode::Read => {
                self.reader = None;
                Ok(())
            }
            FileMode::Write => {
                header::write_header(&self.header_fields(), &self.path)?;
                self.write_body()
            }
            FileMode::Update => self.close_update(),
        }
    }

    fn header_fields(&self) -> HeaderFields {
        let width = self.imel.data_type.sample_width();
        let byte_order = if self.byte_order.is_unspecified(width) {
            ByteOrder::native(width)
        } else {
            self.byte_order
        };
        // Only a body living in another file is named in the header; an
        // embedded body follows the `end` keyword instead.
        let source = match &self.source {
            Some((path, offset)) if *path != self.path => Some((path.clone(), *offset)),
            _ => None,
        };
        HeaderFields {
            version: self.version.number(),
            filename: self
                .path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default(),
            dims: self.dims.clone(),
            imel: self.imel.clone(),
            coord: self.coordinate_system().to_string(),
            scil_type: self.scil_type.clone(),
            byte_order,
            compression: self.compression,
            source,
        }
    }

    fn write_body(&self) -> IcsResult<()> {
        let (body_path, append) = match self.version {
            Version::V1 => (header::ids_path(&self.path), false),
            Version::V2 => {
                if self.source.is_some() {
                    // The body lives in another file; nothing to write.
                    return Ok(());
                }
                (self.path.clone(), true)
            }
        };
        let data = self.data.as_ref().ok_or(IcsError::MissingData)?;
        if data.buf.is_empty() {
            return Err(IcsError::MissingData);
        }

        let file = if append {
            OpenOptions::new().append(true).open(&body_path)
        } else {
            File::create(&body_path)
        }
        .map_err(|_| IcsError::OpenData)?;
        let mut writer = BufWriter::new(file);

        let width = self.imel.data_type.size_in_bytes();
        let dim_sizes: Vec<usize> = self.dims.iter().map(|d| d.size).collect();
        let result = match self.compression {
            CompressionMethod::Uncompressed => match &data.strides {
                Some(strides) => {
                    io::write_plain_strided(data.buf, &dim_sizes, strides, width, &mut writer)
                }
                None => io::write_plain(data.buf, &mut writer),
            },
            CompressionMethod::Gzip => match &data.strides {
                Some(strides) => gzip::write_zip_strided(
                    data.buf,
                    &dim_sizes,
                    strides,
                    width,
                    &mut writer,
                    self.level,
                ),
                None => gzip::write_zip(data.buf, &mut writer, self.level),
            },
            CompressionMethod::Compress => Err(IcsError::UnknownCompression),
        };

        // A close failure must not mask an earlier error.
        let flushed = writer.flush().map_err(|_| IcsError::CloseData);
        result.and(flushed)
    }

    fn close_update(&mut self) -> IcsResult<()> {
        self.reader = None;
        let embedded = self.version == Version::V2
            && matches!(&self.source, Some((path, _)) if *path == self.path);

        let mut tmp_path = None;
        let mut body_offset = 0u64;
        if embedded {
            let (_, offset) = self.source.take().ok_or(IcsError::NotValidAction)?;
            body_offset = offset;
            let tmp = tmp_sibling(&self.path);
            debug!("moving {:?} aside to {:?}", self.path, tmp);
            fs::rename(&self.path, &tmp).map_err(|_| IcsError::TempMove)?;
            tmp_path = Some(tmp);
        }

        let fields = self.header_fields();
        let result = (|| -> IcsResult<()> {
            header::write_header(&fields, &self.path)?;
            if let Some(tmp) = &tmp_path {
                io::copy_body(tmp, body_offset, &self.path)?;
                let _ = fs::remove_file(tmp);
            }
            Ok(())
        })();

        if let Err(err) = result {
            if let Some(tmp) = &tmp_path {
                // Put the original file back.
                let _ = fs::remove_file(&self.path);
                let _ = fs::rename(tmp, &self.path);
            }
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert!(parse_mode("r").is_ok());
        assert!(parse_mode("w").is_ok());
        assert!(parse_mode("rw").is_ok());
        assert!(parse_mode("w1").is_ok());
        assert!(parse_mode("w2").is_ok());
        assert!(parse_mode("rfl").is_ok());
        assert_eq!(parse_mode("").unwrap_err(), IcsError::IllParameter);
        assert_eq!(parse_mode("f").unwrap_err(), IcsError::IllParameter);
        assert_eq!(parse_mode("rr").unwrap_err(), IcsError::IllParameter);
        assert_eq!(parse_mode("ww").unwrap_err(), IcsError::IllParameter);
        assert_eq!(parse_mode("w12").unwrap_err(), IcsError::IllParameter);
        assert_eq!(parse_mode("rll").unwrap_err(), IcsError::IllParameter);
        assert_eq!(parse_mode("rx").unwrap_err(), IcsError::IllParameter);
    }

    #[test]
    fn test_mode_version_selection() {
        assert_eq!(parse_mode("w1").unwrap().version, Some(Version::V1));
        assert_eq!(parse_mode("w2").unwrap().version, Some(Version::V2));
        assert_eq!(parse_mode("w").unwrap().version, None);
    }

    #[test]
    fn test_tmp_sibling_appends_suffix() {
        assert_eq!(
            tmp_sibling(Path::new("a/b.ics")),
            PathBuf::from("a/b.ics.tmp")
        );
    }

    #[test]
    fn test_set_layout_guards() {
        let mut ics = Ics::open("scratch-layout", "w1").unwrap();
        assert_eq!(
            ics.set_layout(DataType::U8, &[1; MAX_DIM + 1]).unwrap_err(),
            IcsError::TooManyDims
        );
        ics.set_layout(DataType::U16, &[4, 3]).unwrap();
        assert_eq!(ics.data_size(), 24);
        assert_eq!(ics.image_size(), 12);
        assert_eq!(ics.imel_size(), 2);
        assert_eq!(ics.order(0).unwrap(), ("x", "x-position"));
        // Reading layout back is a read/update-mode operation.
        assert_eq!(ics.layout().unwrap_err(), IcsError::NotValidAction);
    }

    #[test]
    fn test_set_data_requires_layout() {
        let payload = [0u8; 4];
        let mut ics = Ics::open("scratch-nolayout", "w1").unwrap();
        assert_eq!(
            ics.set_data(&payload).unwrap_err(),
            IcsError::NoLayout
        );
    }

    #[test]
    fn test_set_data_twice_is_duplicate() {
        let payload = [0u8; 24];
        let mut ics = Ics::open("scratch-dup", "w1").unwrap();
        ics.set_layout(DataType::U16, &[4, 3]).unwrap();
        assert!(ics.set_data(&payload).unwrap().is_none());
        assert_eq!(
            ics.set_data(&payload).unwrap_err(),
            IcsError::DuplicateData
        );
    }

    #[test]
    fn test_set_data_size_conflict_still_attaches() {
        let payload = [0u8; 10];
        let mut ics = Ics::open("scratch-conflict", "w1").unwrap();
        ics.set_layout(DataType::U16, &[4, 3]).unwrap();
        assert_eq!(
            ics.set_data(&payload).unwrap(),
            Some(Warning::SizeConflict)
        );
        assert!(ics.data.is_some());
    }

    #[test]
    fn test_set_source_rejected_on_v1() {
        let mut ics = Ics::open("scratch-src", "w1").unwrap();
        assert_eq!(
            ics.set_source("other.ids", 0).unwrap_err(),
            IcsError::NotValidAction
        );
    }

    #[test]
    fn test_compress_writes_upgrade_to_gzip() {
        let mut ics = Ics::open("scratch-compr", "w1").unwrap();
        ics.set_compression(CompressionMethod::Compress, CompressionLevel::default())
            .unwrap();
        assert_eq!(ics.compression, CompressionMethod::Gzip);
    }

    #[test]
    fn test_guess_scil_type() {
        let mut ics = Ics::open("scratch-scil", "w1").unwrap();
        ics.set_layout(DataType::U16, &[4, 3]).unwrap();
        ics.guess_scil_type().unwrap();
        assert_eq!(ics.scil_type(), "g2d");

        ics.set_layout(DataType::F32, &[4, 3, 2]).unwrap();
        ics.guess_scil_type().unwrap();
        assert_eq!(ics.scil_type(), "f3d");

        ics.set_layout(DataType::C32, &[4, 3]).unwrap();
        ics.guess_scil_type().unwrap();
        assert_eq!(ics.scil_type(), "c2d");

        ics.set_layout(DataType::F64, &[4, 3]).unwrap();
        assert_eq!(ics.guess_scil_type().unwrap_err(), IcsError::NoScilType);

        ics.set_layout(DataType::U8, &[4, 3, 2, 2]).unwrap();
        assert_eq!(ics.guess_scil_type().unwrap_err(), IcsError::NoScilType);
    }

    #[test]
    fn test_set_order_semantics() {
        let mut ics = Ics::open("scratch-order", "w1").unwrap();
        ics.set_layout(DataType::U8, &[4, 3]).unwrap();
        ics.set_order(0, "z", None).unwrap();
        assert_eq!(ics.order(0).unwrap(), ("z", "z"));
        ics.set_order(0, "q", Some("depth")).unwrap();
        assert_eq!(ics.order(0).unwrap(), ("q", "depth"));
        ics.set_order(0, "", Some("relabeled")).unwrap();
        assert_eq!(ics.order(0).unwrap(), ("q", "relabeled"));
        assert_eq!(
            ics.set_order(0, "", None).unwrap_err(),
            IcsError::NotValidAction
        );
        assert_eq!(
            ics.set_order(5, "x", None).unwrap_err(),
            IcsError::NotValidAction
        );
    }

    #[test]
    fn test_defaults_on_get() {
        let mut ics = Ics::open("scratch-defaults", "w1").unwrap();
        ics.set_layout(DataType::U8, &[4]).unwrap();
        assert_eq!(ics.coordinate_system(), "video");
        let (_, _, unit) = ics.position(0).unwrap();
        assert_eq!(unit, "undefined");
        let (_, _, unit) = ics.imel_units();
        assert_eq!(unit, "relative");
    }

    #[test]
    fn test_significant_bits_clamped() {
        let mut ics = Ics::open("scratch-bits", "w1").unwrap();
        ics.set_layout(DataType::U16, &[4]).unwrap();
        ics.set_significant_bits(99).unwrap();
        assert_eq!(ics.imel.sig_bits, 16);
        ics.set_significant_bits(12).unwrap();
        assert_eq!(ics.imel.sig_bits, 12);
    }
}
