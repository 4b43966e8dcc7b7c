//! This library provides both high level readers and writers for the BGZF format as well as lower
//! level compressor and decompressor functions.
//!
//! BGZF is a multi-member gzip format that adds an extra field to each member's header recording
//! how large the complete block (header, compressed payload, and footer) is. Capping each block
//! at 2^16 bytes and advertising its size up front is what makes random access into the
//! decompressed byte stream possible: a reader can jump straight to any block without inflating
//! everything that comes before it. [`VirtualOffset`] is the address format used for that jump.
//!
//! # Examples
//!
//! ```rust
//! use bgzf::{Reader, Writer};
//! use std::error::Error;
//! use std::io::{self, Read, Write};
//!
//! fn main() -> Result<(), Box<dyn Error>> {
//!     let mut compressed = Vec::new();
//!     let mut writer = Writer::new(&mut compressed, 2.try_into()?);
//!     writer.write_all(b"hello\n")?;
//!     writer.finish()?;
//!
//!     let mut reader = Reader::new(compressed.as_slice());
//!     let mut data = Vec::new();
//!     reader.read_to_end(&mut data)?;
//!     assert_eq!(&data, b"hello\n");
//!     Ok(())
//! }
//! ```
#![forbid(unsafe_code)]
#![allow(clippy::must_use_candidate, clippy::missing_errors_doc, clippy::missing_panics_doc)]

// Re-export the reader and writer to the same level.
mod reader;
mod virtual_offset;
mod writer;
pub use reader::*;
pub use virtual_offset::VirtualOffset;
pub use writer::*;

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use libdeflater::CompressionLvl;
use thiserror::Error;

/// The default uncompressed chunk size a [`Writer`] slices its buffer into: the full 65536-byte
/// domain of a BGZF block's ISIZE field. The writer buffers input and, once it holds at least
/// this many bytes, emits one maximal block and carries the remainder forward; `finish` emits
/// whatever is left (including none) as one final, possibly short, block.
pub const BGZF_BLOCK_SIZE: usize = 65536;

/// 128 KB default buffer size, same as pigz.
pub const BUFSIZE: usize = 128 * 1024;

/// Default number of BGZF blocks an open [`Reader`] will keep cached for random access.
pub const DEFAULT_MAX_CACHE: usize = 100;

/// The hard ceiling on a block's on-disk size (`BSIZE`): 65536, since `BC`'s payload stores
/// `BSIZE - 1` in a u16. 65536 which is u16::MAX + 1.
pub(crate) const MAX_BGZF_BLOCK_SIZE: usize = 64 * 1024;

/// The largest a compressed payload may be and still leave room for the fixed
/// header/footer framing (18 + 8 = 26 bytes) within [`MAX_BGZF_BLOCK_SIZE`].
pub(crate) const MAX_COMPRESSED_PAYLOAD_SIZE: usize =
    MAX_BGZF_BLOCK_SIZE - BGZF_HEADER_SIZE - BGZF_FOOTER_SIZE;

pub(crate) static BGZF_EOF: &[u8] = &[
    0x1f, 0x8b, // ID1, ID2
    0x08, // CM = DEFLATE
    0x04, // FLG = FEXTRA
    0x00, 0x00, 0x00, 0x00, // MTIME = 0
    0x00, // XFL = 0
    0xff, // OS = 255 (unknown)
    0x06, 0x00, // XLEN = 6
    0x42, 0x43, // SI1, SI2
    0x02, 0x00, // SLEN = 2
    0x1b, 0x00, // BSIZE = 27
    0x03, 0x00, // CDATA
    0x00, 0x00, 0x00, 0x00, // CRC32 = 0x00000000
    0x00, 0x00, 0x00, 0x00, // ISIZE = 0
];

pub(crate) const BGZF_HEADER_SIZE: usize = 18;
pub(crate) const BGZF_FOOTER_SIZE: usize = 8;
pub(crate) const BGZF_MAGIC_BYTE_A: u8 = 31;
pub(crate) const BGZF_MAGIC_BYTE_B: u8 = 139;
pub(crate) const BGZF_COMPRESSION_METHOD: u8 = 8;
pub(crate) const BGZF_NAME_COMMENT_EXTRA_FLAG: u8 = 4;
pub(crate) const BGZF_DEFAULT_MTIME: u32 = 0;
pub(crate) const BGZF_DEFAULT_OS: u8 = 255;
pub(crate) const BGZF_EXTRA_FLAG_LEN: u16 = 6;
pub(crate) const BGZF_SUBFIELD_ID1: u8 = b'B';
pub(crate) const BGZF_SUBFIELD_ID2: u8 = b'C';
pub(crate) const BGZF_SUBFIELD_LEN: u16 = 2;

pub(crate) const BGZF_COMPRESSION_HINT_BEST: u8 = 2;
pub(crate) const BGZF_COMPRESSION_HINT_FASTEST: u8 = 4;
pub(crate) const BGZF_COMPRESSION_HINT_OTHER: u8 = 0;

/// Bytes of fixed framing outside the extra field and the deflate payload: the 12-byte header
/// up to and including `XLEN`, plus the 8-byte CRC32/ISIZE footer.
pub(crate) const BGZF_FIXED_FRAMING_SIZE: u64 = 20;

const EXTRA: f64 = 0.1;

/// Add 10% of the size of the input data to the size of the output amount to account for
/// compression levels that actually increase the output datasize for some inputs (i.e totally
/// random input data).
#[inline]
fn extra_amount(input_len: usize) -> usize {
    std::cmp::max(128, (input_len as f64 * EXTRA) as usize)
}

/// Convenience alias for a [`Result`] with [`BgzfError`] as its error type.
pub type BgzfResult<T> = Result<T, BgzfError>;

/// Errors produced while reading or writing BGZF data.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BgzfError {
    /// A compressed block would not fit in the 16-bit `BSIZE` field.
    #[error("Compressed block size ({0}) exceeds max allowed: ({1})")]
    BlockSizeExceeded(usize, usize),
    /// An invalid compression level (outside `1..=12`) was requested.
    #[error("Invalid compression level: {0}")]
    CompressionLevel(u8),
    /// An I/O error from the underlying source or sink.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The decompressed data's CRC-32 or length did not match the block's footer.
    #[error("Invalid checksum, found {found}, expected {expected}")]
    InvalidChecksum { found: u32, expected: u32 },
    /// libdeflate failed to compress a block.
    #[error("LibDeflater compression error: {0:?}")]
    LibDeflaterCompress(libdeflater::CompressionError),
    /// libdeflate failed to decompress a block.
    #[error(transparent)]
    LibDelfaterDecompress(#[from] libdeflater::DecompressionError),
    /// The byte stream was not validly-framed BGZF at the given source position.
    #[error("Malformed BGZF block at position {position}: {message}")]
    FormatError { message: String, position: u64 },
    /// A virtual offset, seek target, or other quantity fell outside its legal domain.
    #[error("Value out of range: {0}")]
    RangeError(String),
    /// An operation that this type or mode does not support was requested.
    #[error("Not supported: {0}")]
    NotSupported(&'static str),
}

impl From<BgzfError> for io::Error {
    fn from(e: BgzfError) -> Self {
        match e {
            BgzfError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// Level of compression to use for for the compressors.
///
/// Valid values are 1-12. See [libdeflater](https://github.com/ebiggers/libdeflate#compression-levels) documentation on levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(CompressionLvl);

#[allow(dead_code)]
impl CompressionLevel {
    /// Create a new [`CompressionLevel`] instance.
    ///
    /// Valid levels are 1-12.
    #[allow(clippy::cast_lossless)]
    pub fn new(level: u8) -> BgzfResult<Self> {
        // libdeflater::CompressionLvlError contains no information
        Ok(Self(
            CompressionLvl::new(level as i32).map_err(|_e| BgzfError::CompressionLevel(level))?,
        ))
    }

    /// The crate's default compression level (6), matching `bgzip`/`samtools`.
    pub fn default_level() -> Self {
        Self::new(6).expect("6 is always a valid compression level")
    }

    /// Get the inner compression level
    fn inner(&self) -> &libdeflater::CompressionLvl {
        &self.0
    }
}

impl TryFrom<u8> for CompressionLevel {
    type Error = BgzfError;

    /// Try to convert a `u8` to a compression level.
    ///
    /// # Example
    /// ```rust
    /// use bgzf::CompressionLevel;
    ///
    /// let level: CompressionLevel = 2.try_into().unwrap();
    /// assert_eq!(level, CompressionLevel::new(2).unwrap());
    /// ```
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CompressionLevel> for u8 {
    /// Convenience method vor converting [`CompressionLevel`] back to a [`u8`].
    fn from(level: CompressionLevel) -> Self {
        let inner: i32 = level.inner().into();
        inner as u8
    }
}

impl From<&CompressionLevel> for u8 {
    /// Convenience method vor converting [`CompressionLevel`] back to a [`u8`].
    fn from(level: &CompressionLevel) -> Self {
        let inner: i32 = level.inner().into();
        inner as u8
    }
}

/// [`Compressor`] will BGZF compress a block of bytes with the [`Compressor::compress`] method, allowing for reuse of the compressor itself.
///
/// # Example
///
/// ```rust
/// use bgzf::{Compressor, CompressionLevel};
///
/// let mut compressor = Compressor::new(2.try_into().unwrap());
/// let input = &[b'A'; 100];
/// let mut output_buffer = vec![];
/// compressor.compress(input, &mut output_buffer).unwrap();
/// assert!(input.len() > output_buffer.len());
/// ```
pub struct Compressor {
    inner: libdeflater::Compressor,
    level: CompressionLevel,
}

#[allow(dead_code)]
impl Compressor {
    /// Create a new [`Compressor`] with the given [`CompressionLevel`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use bgzf::Compressor;
    /// let compressor = Compressor::new(3.try_into().expect("Invalid compression level"));
    /// ```
    pub fn new(level: CompressionLevel) -> Self {
        Self { inner: libdeflater::Compressor::new(*level.inner()), level }
    }

    #[inline]
    fn inner_mut(&mut self) -> &mut libdeflater::Compressor {
        &mut self.inner
    }

    /// Compress a single block of at most 65536 bytes, writing a complete framed BGZF block
    /// (header, extra field, compressed payload, CRC-32, ISIZE) to `buffer`.
    ///
    /// # Errors
    ///
    /// Returns [`BgzfError::BlockSizeExceeded`] if the compressed payload would not fit in the
    /// 16-bit `BSIZE` field.
    #[inline]
    pub fn compress(&mut self, input: &[u8], buffer: &mut Vec<u8>) -> BgzfResult<()> {
        buffer.resize_with(
            BGZF_HEADER_SIZE + input.len() + extra_amount(input.len()) + BGZF_FOOTER_SIZE,
            || 0,
        );

        let bytes_written = self
            .inner_mut()
            .deflate_compress(input, &mut buffer[BGZF_HEADER_SIZE..])
            .map_err(BgzfError::LibDeflaterCompress)?;

        // The full block (header + payload + footer) must still fit the 16-bit BSIZE field.
        if bytes_written > MAX_COMPRESSED_PAYLOAD_SIZE {
            return Err(BgzfError::BlockSizeExceeded(bytes_written, MAX_COMPRESSED_PAYLOAD_SIZE));
        }
        let mut check = libdeflater::Crc::new();
        check.update(input);

        // Add header with total byte sizes
        let header = header_inner(self.level, bytes_written as u16);
        buffer[0..BGZF_HEADER_SIZE].copy_from_slice(&header);
        buffer.truncate(BGZF_HEADER_SIZE + bytes_written);

        buffer.write_u32::<LittleEndian>(check.sum())?;
        buffer.write_u32::<LittleEndian>(input.len() as u32)?;

        Ok(())
    }

    /// Append the EOF block.
    pub fn append_eof(bytes: &mut Vec<u8>) {
        bytes.extend(BGZF_EOF);
    }
}

/// A single parsed BGZF extra-field subfield: `(id1, id2, length, payload)`.
struct ExtraSubfield<'a> {
    id: [u8; 2],
    payload: &'a [u8],
}

/// Parse a gzip extra field into its subfields, requiring that they exactly cover `extra`.
fn parse_extra_subfields(extra: &[u8], position: u64) -> BgzfResult<Vec<ExtraSubfield<'_>>> {
    let mut fields = Vec::new();
    let mut cursor = 0usize;
    while cursor < extra.len() {
        if extra.len() - cursor < 4 {
            return Err(BgzfError::FormatError {
                message: "extra field subfield header truncated".to_string(),
                position,
            });
        }
        let id = [extra[cursor], extra[cursor + 1]];
        let len = LittleEndian::read_u16(&extra[cursor + 2..cursor + 4]) as usize;
        let payload_start = cursor + 4;
        let payload_end = payload_start + len;
        if payload_end > extra.len() {
            return Err(BgzfError::FormatError {
                message: "extra field subfield overruns XLEN".to_string(),
                position,
            });
        }
        fields.push(ExtraSubfield { id, payload: &extra[payload_start..payload_end] });
        cursor = payload_end;
    }
    if cursor != extra.len() {
        return Err(BgzfError::FormatError {
            message: "extra field subfields do not exactly cover XLEN".to_string(),
            position,
        });
    }
    Ok(fields)
}

/// Find the mandatory `BC` subfield and return the `BSIZE` it encodes (`payload + 1`).
fn find_bsize(fields: &[ExtraSubfield<'_>], position: u64) -> BgzfResult<u64> {
    let mut bsize = None;
    for field in fields {
        if field.id == [BGZF_SUBFIELD_ID1, BGZF_SUBFIELD_ID2] {
            if bsize.is_some() {
                return Err(BgzfError::FormatError {
                    message: "duplicate BC subfield".to_string(),
                    position,
                });
            }
            if field.payload.len() != 2 {
                return Err(BgzfError::FormatError {
                    message: "BC subfield payload must be 2 bytes".to_string(),
                    position,
                });
            }
            bsize = Some(u64::from(LittleEndian::read_u16(field.payload)) + 1);
        }
    }
    bsize.ok_or(BgzfError::FormatError { message: "missing BC subfield".to_string(), position })
}

/// [`BlockDecoder`] reads and validates one BGZF block at a time from a byte source.
///
/// This is the low-level counterpart to [`Compressor`]: it parses the gzip header, the `BC`
/// extra subfield, inflates the payload, and verifies the CRC-32/ISIZE trailer. [`Reader`] is
/// built on top of it to add block caching and virtual-offset seeking.
pub(crate) struct BlockDecoder {
    inner: libdeflater::Decompressor,
    header: Vec<u8>,
    extra: Vec<u8>,
    payload_and_footer: Vec<u8>,
}

impl BlockDecoder {
    fn new() -> Self {
        Self {
            inner: libdeflater::Decompressor::new(),
            // MTIME(4) + XFL(1) + OS(1) + XLEN(2), the fixed fields between the 4-byte magic
            // and the variable-length extra field.
            header: vec![0u8; 8],
            extra: Vec::new(),
            payload_and_footer: Vec::new(),
        }
    }

    /// Read one BGZF block from `source`, placing its decompressed bytes into `out`.
    ///
    /// Returns `Ok(Some(block_raw_length))` (the on-disk `BSIZE`) on success, or `Ok(None)` if
    /// `source` was already at a clean end of stream (no bytes read at all). `position` is the
    /// source offset this block is expected to start at, used only to annotate errors.
    fn read_block<R: Read>(
        &mut self,
        source: &mut R,
        position: u64,
        out: &mut Vec<u8>,
    ) -> BgzfResult<Option<u64>> {
        let mut magic = [0u8; 4];
        let n = read_fill(source, &mut magic)?;
        if n == 0 {
            return Ok(None);
        }
        if n < 4
            || magic[0] != BGZF_MAGIC_BYTE_A
            || magic[1] != BGZF_MAGIC_BYTE_B
            || magic[2] != BGZF_COMPRESSION_METHOD
            || magic[3] & BGZF_NAME_COMMENT_EXTRA_FLAG == 0
        {
            return Err(BgzfError::FormatError {
                message: format!("bad BGZF magic bytes {magic:02x?}"),
                position,
            });
        }

        source.read_exact(&mut self.header)?;
        let xlen = LittleEndian::read_u16(&self.header[6..8]) as usize;

        self.extra.clear();
        self.extra.resize(xlen, 0);
        source.read_exact(&mut self.extra)?;
        let fields = parse_extra_subfields(&self.extra, position)?;
        let bsize = find_bsize(&fields, position)?;

        let deflate_size = bsize
            .checked_sub(BGZF_FIXED_FRAMING_SIZE + xlen as u64)
            .ok_or(BgzfError::FormatError {
                message: format!("BSIZE {bsize} too small for XLEN {xlen}"),
                position,
            })?;

        // Read the deflate payload together with the 8-byte CRC32/ISIZE trailer: ISIZE is only
        // known once the trailer has been read, but sizing the decompression output requires it.
        self.payload_and_footer.clear();
        self.payload_and_footer.resize((deflate_size as usize) + BGZF_FOOTER_SIZE, 0);
        source.read_exact(&mut self.payload_and_footer)?;

        let footer_start = self.payload_and_footer.len() - BGZF_FOOTER_SIZE;
        let expected_crc = LittleEndian::read_u32(&self.payload_and_footer[footer_start..footer_start + 4]);
        let expected_isize = LittleEndian::read_u32(&self.payload_and_footer[footer_start + 4..]);

        out.clear();
        out.resize(expected_isize as usize, 0);
        if expected_isize != 0 {
            let deflate_payload = &self.payload_and_footer[..footer_start];
            let bytes_decompressed = self.inner.deflate_decompress(deflate_payload, out)?;
            if bytes_decompressed != out.len() {
                return Err(BgzfError::FormatError {
                    message: format!(
                        "decompressed {bytes_decompressed} bytes, expected ISIZE {expected_isize}"
                    ),
                    position,
                });
            }
        }

        let mut crc = libdeflater::Crc::new();
        crc.update(out);
        if crc.sum() != expected_crc {
            return Err(BgzfError::InvalidChecksum { found: crc.sum(), expected: expected_crc });
        }

        Ok(Some(bsize))
    }
}

/// Like [`Read::read_exact`] but reports how many bytes were actually read before EOF instead of
/// erroring, so callers can distinguish "clean end of stream" (0 bytes) from "truncated block".
fn read_fill<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = source.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Create an Bgzf style header.
#[inline]
fn header_inner(
    compression_level: CompressionLevel,
    compressed_size: u16,
) -> [u8; BGZF_HEADER_SIZE] {
    // Determine hint to place in header
    // From https://github.com/rust-lang/flate2-rs/blob/b2e976da21c18c8f31132e93a7f803b5e32f2b6d/src/gz/mod.rs#L235
    let comp_value = if compression_level.inner() >= &CompressionLvl::best() {
        BGZF_COMPRESSION_HINT_BEST
    } else if compression_level.inner() <= &CompressionLvl::fastest() {
        BGZF_COMPRESSION_HINT_FASTEST
    } else {
        BGZF_COMPRESSION_HINT_OTHER
    };

    let mut header = [0u8; BGZF_HEADER_SIZE];
    let mut cursor = std::io::Cursor::new(&mut header[..]);
    cursor.write_u8(BGZF_MAGIC_BYTE_A).unwrap(); // magic byte
    cursor.write_u8(BGZF_MAGIC_BYTE_B).unwrap(); // magic byte
    cursor.write_u8(BGZF_COMPRESSION_METHOD).unwrap(); // compression method
    cursor.write_u8(BGZF_NAME_COMMENT_EXTRA_FLAG).unwrap(); // name / comment / extraflag
    cursor.write_u32::<LittleEndian>(BGZF_DEFAULT_MTIME).unwrap(); // mtime
    cursor.write_u8(comp_value).unwrap(); // compression value
    cursor.write_u8(BGZF_DEFAULT_OS).unwrap(); // OS
    cursor.write_u16::<LittleEndian>(BGZF_EXTRA_FLAG_LEN).unwrap(); // Extra flag len
    cursor.write_u8(BGZF_SUBFIELD_ID1).unwrap(); // Bgzf subfield ID 1
    cursor.write_u8(BGZF_SUBFIELD_ID2).unwrap(); // Bgzf subfield ID2
    cursor.write_u16::<LittleEndian>(BGZF_SUBFIELD_LEN).unwrap(); // Bgzf subfield len
    cursor
        .write_u16::<LittleEndian>(
            compressed_size + BGZF_HEADER_SIZE as u16 + BGZF_FOOTER_SIZE as u16 - 1,
        )
        .unwrap(); // Size of block including header and footer - 1 BLEN

    header
}

/// Open a BGZF file for reading or writing, dispatching on `mode` the way the standard library's
/// `File::options()`/Python's `open()` do.
///
/// `mode` recognizes `"r"`/`"rb"` for reading and `"w"`/`"wb"` for writing (at
/// [`CompressionLevel::default_level`]). Anything else is a [`BgzfError::NotSupported`].
pub fn open<P: AsRef<Path>>(path: P, mode: &str) -> BgzfResult<BgzfHandle> {
    if mode.contains('r') {
        Ok(BgzfHandle::Reader(Box::new(Reader::from_path(path)?)))
    } else if mode.contains('w') {
        Ok(BgzfHandle::Writer(Box::new(Writer::from_path(path, CompressionLevel::default_level())?)))
    } else {
        Err(BgzfError::NotSupported("mode must contain 'r' or 'w'"))
    }
}

/// A BGZF file opened via [`open`], in either read or write mode.
pub enum BgzfHandle {
    /// A BGZF file opened for reading.
    Reader(Box<Reader<File>>),
    /// A BGZF file opened for writing.
    Writer(Box<Writer<File>>),
}
