//! A random-access reader for BGZF compressed data.
use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    num::NonZeroUsize,
    path::Path,
    rc::Rc,
};

use lru::LruCache;

use crate::{BgzfError, BgzfResult, BlockDecoder, VirtualOffset, DEFAULT_MAX_CACHE};

/// Decompressed bytes of one block together with the block's on-disk length (`BSIZE`), as kept
/// in a [`Reader`]'s cache.
type CachedBlock = (Rc<[u8]>, u64);

/// A BGZF reader supporting both sequential decompression and random access via
/// [`VirtualOffset`]s.
///
/// Decompressed blocks are kept in a small LRU cache so that repeated seeks back into a block
/// already visited do not re-inflate it. Seeking ([`Reader::seek`]) requires the underlying
/// source to also implement [`Seek`]; plain sequential reading works over any [`Read`].
///
/// # Example
///
/// ```rust
/// use bgzf::{Reader, Compressor, CompressionLevel};
/// use std::error::Error;
/// use std::io::Read;
///
/// fn main() -> Result<(), Box<dyn Error>> {
///     let mut compressor = Compressor::new(CompressionLevel::new(2)?);
///     let input = &[b'A'; 100];
///     let mut compressed_data = vec![];
///     compressor.compress(input, &mut compressed_data)?;
///
///     let mut reader = Reader::new(compressed_data.as_slice());
///     let mut decompressed_data = vec![];
///     let _bytes_read = reader.read_to_end(&mut decompressed_data)?;
///     assert_eq!(decompressed_data, input);
///     Ok(())
/// }
/// ```
pub struct Reader<R>
where
    R: Read,
{
    reader: R,
    decoder: BlockDecoder,
    cache: LruCache<u64, CachedBlock>,
    /// File offset of the block currently loaded into `buffer`.
    block_start: u64,
    /// `BSIZE` (on-disk length, header through footer) of that block.
    block_raw_length: u64,
    /// Decompressed contents of the block currently positioned at `block_start`.
    buffer: Rc<[u8]>,
    /// Read cursor into `buffer`.
    within_block: usize,
    /// Total bytes consumed from `reader` so far; doubles as "the next block starts here" for
    /// sequential reads over sources that don't support [`Seek`].
    source_pos: u64,
    /// Whether line-oriented convenience methods decode lossily (`true`) or reject invalid UTF-8
    /// (`false`).
    text_mode: bool,
    eof: bool,
}

impl<R> Reader<R>
where
    R: Read,
{
    /// Create a new [`Reader`] with the default block cache size ([`DEFAULT_MAX_CACHE`]).
    pub fn new(reader: R) -> Self {
        Self::with_max_cache(reader, DEFAULT_MAX_CACHE)
            .expect("DEFAULT_MAX_CACHE is always at least 1")
    }

    /// Create a new [`Reader`] with a caller-chosen block cache size.
    ///
    /// # Errors
    ///
    /// Returns [`BgzfError::RangeError`] if `max_cache` is 0: a reader must be able to hold at
    /// least the block it is currently positioned in.
    pub fn with_max_cache(reader: R, max_cache: usize) -> BgzfResult<Self> {
        let capacity = NonZeroUsize::new(max_cache)
            .ok_or_else(|| BgzfError::RangeError("max_cache must be at least 1".to_string()))?;
        Ok(Self {
            reader,
            decoder: BlockDecoder::new(),
            cache: LruCache::new(capacity),
            block_start: 0,
            block_raw_length: 0,
            buffer: Rc::from(Vec::new().into_boxed_slice()),
            within_block: 0,
            source_pos: 0,
            text_mode: false,
            eof: false,
        })
    }

    /// Toggle whether line-reading convenience methods ([`Reader::read_line_text`]) decode
    /// lossily instead of rejecting invalid UTF-8. Off by default.
    #[must_use]
    pub fn text_mode(mut self, enabled: bool) -> Self {
        self.text_mode = enabled;
        self
    }

    /// The current virtual offset.
    ///
    /// When positioned exactly at the end of a block's decompressed bytes, this reports the
    /// virtual offset of the *start* of the following block (with a zero within-block offset)
    /// rather than a trailing offset into the block just finished, matching the canonical BGZF
    /// convention for comparing/serializing positions.
    #[must_use]
    pub fn tell(&self) -> VirtualOffset {
        if self.within_block > 0 && self.within_block == self.buffer.len() {
            VirtualOffset::from_raw((self.block_start + self.block_raw_length) << 16)
        } else {
            VirtualOffset::from_raw((self.block_start << 16) | self.within_block as u64)
        }
    }

    /// Load the block starting at file offset `start` into `self.buffer`, consulting (and
    /// populating) the cache. Returns `Ok(false)` at a clean end of stream.
    fn load_block_at(&mut self, start: u64) -> BgzfResult<bool> {
        if let Some((data, raw_length)) = self.cache.get(&start) {
            self.buffer = data.clone();
            self.block_raw_length = *raw_length;
            self.block_start = start;
            self.within_block = 0;
            return Ok(true);
        }

        let mut data = Vec::new();
        let raw_length = match self.decoder.read_block(&mut self.reader, start, &mut data)? {
            None => return Ok(false),
            Some(raw_length) => raw_length,
        };

        self.block_start = start;
        self.block_raw_length = raw_length;
        self.source_pos = start + raw_length;
        self.within_block = 0;

        let data: Rc<[u8]> = Rc::from(data.into_boxed_slice());
        self.cache.put(start, (data.clone(), raw_length));
        self.buffer = data;
        Ok(true)
    }

    /// Make sure there is at least one unread byte available in `buffer`, advancing through
    /// blocks (including skipping any number of non-terminal empty blocks) as needed. Returns
    /// `Ok(false)` once the underlying source itself is exhausted. Iterative: never recurses,
    /// however many blocks must be skipped.
    fn ensure_data(&mut self) -> BgzfResult<bool> {
        loop {
            if self.within_block < self.buffer.len() {
                return Ok(true);
            }
            if self.eof {
                return Ok(false);
            }
            let start = self.source_pos;
            if !self.load_block_at(start)? {
                // A clean zero-byte read from the underlying source is the only true end of
                // stream; an empty decompressed buffer from a successfully loaded block (the EOF
                // sentinel, or a stray empty block mid-stream) is not, so it falls through to
                // loop around and load whatever comes next instead of stopping here.
                self.eof = true;
                return Ok(false);
            }
        }
    }

    /// Read one line (including its trailing `\n`, if any) into `buf`, across block boundaries
    /// as needed. Returns the number of bytes appended; `0` means end of stream.
    pub fn read_line_bytes(&mut self, buf: &mut Vec<u8>) -> BgzfResult<usize> {
        let mut total = 0;
        loop {
            if !self.ensure_data()? {
                break;
            }
            let available = &self.buffer[self.within_block..];
            if let Some(pos) = available.iter().position(|&b| b == b'\n') {
                buf.extend_from_slice(&available[..=pos]);
                self.within_block += pos + 1;
                total += pos + 1;
                break;
            }
            buf.extend_from_slice(available);
            total += available.len();
            self.within_block += available.len();
        }
        Ok(total)
    }

    /// Read one line as a [`String`], per [`Reader::text_mode`]'s lossy/strict setting.
    /// `Ok(None)` at end of stream.
    pub fn read_line_text(&mut self) -> BgzfResult<Option<String>> {
        let mut buf = Vec::new();
        let n = self.read_line_bytes(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        if self.text_mode {
            Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
        } else {
            String::from_utf8(buf).map(Some).map_err(|e| BgzfError::FormatError {
                message: format!("invalid utf-8 in line: {e}"),
                position: self.source_pos,
            })
        }
    }

    /// Iterate over the remaining lines (including trailing `\n`) as raw bytes.
    pub fn lines(&mut self) -> Lines<'_, R> {
        Lines { reader: self }
    }
}

impl<R> Reader<R>
where
    R: Read + Seek,
{
    /// Jump directly to a [`VirtualOffset`], re-using a cached block if one covers it.
    ///
    /// # Errors
    ///
    /// Returns [`BgzfError::RangeError`] if the offset's within-block component does not fit the
    /// block it names (including a non-zero within-block offset pointing past end of stream).
    pub fn seek(&mut self, voffset: VirtualOffset) -> BgzfResult<()> {
        let coffset = voffset.coffset();
        let uoffset = usize::from(voffset.uoffset());

        self.reader.seek(SeekFrom::Start(coffset)).map_err(BgzfError::Io)?;
        self.source_pos = coffset;
        self.eof = false;

        if !self.load_block_at(coffset)? {
            if uoffset != 0 {
                return Err(BgzfError::RangeError(format!(
                    "seek target {voffset} points past the end of the BGZF stream"
                )));
            }
            self.eof = true;
            return Ok(());
        }

        if uoffset > self.buffer.len() {
            return Err(BgzfError::RangeError(format!(
                "seek target {voffset} has a within-block offset past the end of its block"
            )));
        }
        self.within_block = uoffset;
        Ok(())
    }
}

impl Reader<File> {
    /// Open a BGZF file for random-access reading.
    pub fn from_path<P>(path: P) -> BgzfResult<Self>
    where
        P: AsRef<Path>,
    {
        let file = File::open(path).map_err(BgzfError::Io)?;
        Ok(Self::new(file))
    }
}

impl<R> Read for Reader<R>
where
    R: Read,
{
    /// Attempt to read `buf.len()` bytes from source into `buf`.
    ///
    /// - `Ok(0)` means that EOF has been reached or `buf.len() == 0`.
    /// - `Ok(n < buf.len())` means that EOF has been reached.
    /// - `Err(..)` means that an error has occurred.
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.ensure_data().map_err(io::Error::from)? {
            return Ok(0);
        }
        let available = &self.buffer[self.within_block..];
        let n = std::cmp::min(buf.len(), available.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.within_block += n;
        Ok(n)
    }
}

/// An iterator over the lines of a [`Reader`], produced by [`Reader::lines`].
pub struct Lines<'a, R: Read> {
    reader: &'a mut Reader<R>,
}

impl<'a, R: Read> Iterator for Lines<'a, R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = Vec::new();
        match self.reader.read_line_bytes(&mut buf) {
            Ok(0) => None,
            Ok(_) => Some(Ok(buf)),
            Err(e) => Some(Err(e.into())),
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::{Cursor, Write};

    use super::*;
    use crate::{CompressionLevel, Writer};

    fn compress(chunks: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, CompressionLevel::default_level());
        for chunk in chunks {
            writer.write_all(chunk).unwrap();
            // Force each chunk into its own block boundary-ish by flushing full blocks only;
            // tests rely on content correctness, not exact block boundaries, except where noted.
        }
        writer.finish().unwrap();
        out
    }

    #[test]
    fn sequential_read_reassembles_original_bytes() {
        let data = compress(&[b"hello\n", b"world\n"]);
        let mut reader = Reader::new(data.as_slice());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello\nworld\n");
    }

    #[test]
    fn read_line_splits_on_newlines_across_reads() {
        let data = compress(&[b"alpha\nbeta\ngamma"]);
        let mut reader = Reader::new(data.as_slice());
        let mut line = Vec::new();
        assert_eq!(reader.read_line_bytes(&mut line).unwrap(), 6);
        assert_eq!(line, b"alpha\n");

        line.clear();
        assert_eq!(reader.read_line_bytes(&mut line).unwrap(), 5);
        assert_eq!(line, b"beta\n");

        line.clear();
        assert_eq!(reader.read_line_bytes(&mut line).unwrap(), 5);
        assert_eq!(line, b"gamma");

        line.clear();
        assert_eq!(reader.read_line_bytes(&mut line).unwrap(), 0);
    }

    #[test]
    fn lines_iterator_yields_every_line() {
        let data = compress(&[b"one\ntwo\nthree\n"]);
        let mut reader = Reader::new(data.as_slice());
        let lines: Vec<Vec<u8>> = reader.lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec![b"one\n".to_vec(), b"two\n".to_vec(), b"three\n".to_vec()]);
    }

    #[test]
    fn seek_back_to_start_rereads_the_same_bytes() {
        let input = vec![0x41u8; 131_072];
        let mut out = Vec::new();
        {
            let mut writer = Writer::new(&mut out, CompressionLevel::default_level());
            writer.write_all(&input).unwrap();
            writer.finish().unwrap();
        }

        let mut reader = Reader::new(Cursor::new(out));
        let mut prefix = vec![0u8; 1000];
        reader.read_exact(&mut prefix).unwrap();
        assert_eq!(prefix, vec![0x41u8; 1000]);

        reader.seek(VirtualOffset::from_raw(0)).unwrap();
        let mut reread = vec![0u8; 1000];
        reader.read_exact(&mut reread).unwrap();
        assert_eq!(reread, prefix);
    }

    #[test]
    fn seek_to_start_of_second_block_lands_past_the_first() {
        let input = vec![0x41u8; 131_072];
        let mut out = Vec::new();
        {
            let mut writer = Writer::new(&mut out, CompressionLevel::default_level());
            writer.write_all(&input).unwrap();
            writer.finish().unwrap();
        }

        let mut reader = Reader::new(Cursor::new(out));
        reader.read_exact(&mut vec![0u8; 65536]).unwrap();
        let boundary = reader.tell();
        assert_eq!(boundary.uoffset(), 0);

        reader.seek(boundary).unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, vec![0x41u8; 131_072 - 65536]);
    }

    #[test]
    fn tell_reports_block_boundary_not_trailing_offset() {
        let data = compress(&[b"short"]);
        let mut reader = Reader::new(data.as_slice());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        let offset = reader.tell();
        assert_eq!(offset.uoffset(), 0);
    }

    #[test]
    fn zero_cache_size_is_rejected() {
        let data = compress(&[b"x"]);
        assert!(matches!(
            Reader::with_max_cache(data.as_slice(), 0),
            Err(BgzfError::RangeError(_))
        ));
    }

    /// Deterministic, not-very-compressible filler so the writer below actually produces five
    /// distinct blocks instead of folding everything into one tiny one.
    fn pattern_byte(i: usize) -> u8 {
        (i as u32).wrapping_mul(2_654_435_761).wrapping_add(12345) as u8
    }

    /// Reproduces spec.md's non-uniform block-layout scenario: four maximal (65536-byte) blocks,
    /// one short (43478-byte) final data block, then the EOF sentinel, and checks `tell`/`seek`
    /// arithmetic across that exact layout rather than relying on it being true only for
    /// uniformly-sized blocks.
    #[test]
    fn tell_and_seek_across_a_non_uniform_block_layout() {
        const FULL_BLOCKS: usize = 4;
        const FINAL_BLOCK_LEN: usize = 43478;
        let total_len = FULL_BLOCKS * 65536 + FINAL_BLOCK_LEN;
        let input: Vec<u8> = (0..total_len).map(pattern_byte).collect();

        let mut out = Vec::new();
        {
            let mut writer = Writer::with_capacity(&mut out, CompressionLevel::default_level(), 65536);
            writer.write_all(&input).unwrap();
            writer.finish().unwrap();
        }

        let mut reader = Reader::new(Cursor::new(out));

        // Reading the first 80 bytes then `tell()` must return 80.
        let mut prefix = vec![0u8; 80];
        reader.read_exact(&mut prefix).unwrap();
        assert_eq!(prefix, input[..80]);
        assert_eq!(reader.tell(), VirtualOffset::new(0, 80).unwrap());

        // Walk the four maximal blocks (B0..B3), recording the start offset of the block
        // *following* each one, so the rest of the test can address block boundaries without
        // hard-coding compressed sizes that depend on the exact bytes a particular compressor
        // happens to produce. `start_of[k]` is the coffset of the block right after B(k).
        let mut start_of = [0u64; FULL_BLOCKS];
        reader.seek(VirtualOffset::new(0, 0).unwrap()).unwrap();
        for start in &mut start_of {
            let mut block = vec![0u8; 65536];
            reader.read_exact(&mut block).unwrap();
            let boundary = reader.tell();
            assert_eq!(boundary.uoffset(), 0, "canonical tell() at a block boundary");
            *start = boundary.coffset();
        }
        let start_of_b1 = start_of[0];
        let start_of_b3 = start_of[2]; // coffset of the fourth maximal block (B3)

        // Reading 70000 bytes from start (one full block plus 4464 bytes into the second) then
        // `tell()` must return `make(start_of_b1, 4464)`.
        reader.seek(VirtualOffset::new(0, 0).unwrap()).unwrap();
        let mut seventy_k = vec![0u8; 70_000];
        reader.read_exact(&mut seventy_k).unwrap();
        assert_eq!(seventy_k, input[..70_000]);
        assert_eq!(reader.tell(), VirtualOffset::new(start_of_b1, 4464).unwrap());

        // `seek(make(start_of_b3, 126))` then `read(1)` must return the byte at decompressed
        // offset `65536*3 + 126`.
        reader.seek(VirtualOffset::new(start_of_b3, 126).unwrap()).unwrap();
        let mut one = [0u8; 1];
        reader.read_exact(&mut one).unwrap();
        assert_eq!(one[0], input[65536 * 3 + 126]);
    }
}
