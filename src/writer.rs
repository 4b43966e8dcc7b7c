//! A BGZF writer implementation.
use std::{
    fs::File,
    io::{self, Write},
    path::Path,
};

use bytes::BytesMut;

use crate::{
    BgzfError, BgzfResult, CompressionLevel, Compressor, VirtualOffset, BGZF_BLOCK_SIZE, BGZF_EOF,
    BUFSIZE,
};

/// A BGZF compressing writer.
///
/// [`Writer`] buffers written bytes and flushes them out in fixed-size (`blocksize`) BGZF blocks
/// as the buffer fills. Call [`Writer::finish`] (or let the writer `Drop`) to flush any remaining
/// bytes as one final, possibly short or empty, block and append the end-of-file marker.
///
/// # Example
///
/// ```rust
/// use bgzf::{CompressionLevel, Writer};
/// use std::error::Error;
/// use std::io::Write;
///
/// fn main() -> Result<(), Box<dyn Error>> {
///     let mut destination = vec![];
///     let mut writer = Writer::new(&mut destination, 2.try_into()?);
///     let input = &[b'A'; 100];
///     writer.write_all(input)?;
///     writer.finish()?;
///
///     assert!(destination.len() < input.len() + 28);
///     Ok(())
/// }
/// ```
pub struct Writer<W>
where
    W: Write,
{
    /// The internal buffer to use
    uncompressed_buffer: BytesMut,
    /// The buffer to reuse for compressed bytes
    compressed_buffer: Vec<u8>,
    /// The size of the blocks to create
    blocksize: usize,
    /// The compressor to reuse
    compressor: Compressor,
    /// The inner writer
    writer: W,
    /// Running count of bytes written to `writer` so far, including the EOF marker once
    /// emitted. Tracked directly rather than queried from `writer` so [`Writer::tell`] works for
    /// any `Write`, not just `Write + Seek`.
    emitted_bytes: u64,
    /// Set once the EOF marker has been written, so [`Writer::finish`] only ever emits it once.
    finished: bool,
}

impl<W> Writer<W>
where
    W: Write,
{
    /// Create a new [`Writer`]
    pub fn new(writer: W, compression_level: CompressionLevel) -> Self {
        Self::with_capacity(writer, compression_level, BGZF_BLOCK_SIZE)
    }

    /// Create a writer with a set capacity.
    ///
    /// By default the capacity is [`BGZF_BLOCK_SIZE`]. The capacity must be less than or equal
    /// to [`BGZF_BLOCK_SIZE`].
    pub fn with_capacity(writer: W, compression_level: CompressionLevel, blocksize: usize) -> Self {
        assert!(blocksize <= BGZF_BLOCK_SIZE);
        let compressor = Compressor::new(compression_level);
        Self {
            uncompressed_buffer: BytesMut::with_capacity(BUFSIZE),
            compressed_buffer: Vec::with_capacity(BUFSIZE),
            blocksize,
            compressor,
            writer,
            emitted_bytes: 0,
            finished: false,
        }
    }

    /// The virtual offset at which the next [`Writer::write`] would append, in the final stream.
    ///
    /// This is the address a reader's [`crate::Reader::seek`] can consume: the compressed-byte
    /// offset of the block not yet emitted, together with however many uncompressed bytes are
    /// currently buffered ahead of it. `uncompressed_buffer` is always under 65536 bytes between
    /// public calls, so the within-block component is always in range.
    #[must_use]
    pub fn tell(&self) -> VirtualOffset {
        VirtualOffset::new(self.emitted_bytes, self.uncompressed_buffer.len() as u32)
            .expect("uncompressed_buffer is always under 65536 bytes between public calls")
    }

    /// Drain and compress every full `blocksize` chunk currently sitting in the buffer.
    fn flush_full_blocks(&mut self) -> BgzfResult<()> {
        while self.uncompressed_buffer.len() >= self.blocksize {
            let chunk = self.uncompressed_buffer.split_to(self.blocksize).freeze();
            self.compressor.compress(&chunk[..], &mut self.compressed_buffer)?;
            self.writer.write_all(&self.compressed_buffer)?;
            self.emitted_bytes += self.compressed_buffer.len() as u64;
            self.compressed_buffer.clear();
        }
        Ok(())
    }

    /// Compress and emit whatever remains in `uncompressed_buffer` as one final, possibly short,
    /// block. No-op if the buffer is empty. Never touches the EOF sentinel or `finished`.
    fn emit_remainder(&mut self) -> BgzfResult<()> {
        if self.uncompressed_buffer.is_empty() {
            return Ok(());
        }
        let remainder = self.uncompressed_buffer.split_to(self.uncompressed_buffer.len()).freeze();
        self.compressor.compress(&remainder[..], &mut self.compressed_buffer)?;
        self.writer.write_all(&self.compressed_buffer)?;
        self.emitted_bytes += self.compressed_buffer.len() as u64;
        self.compressed_buffer.clear();
        Ok(())
    }

    /// Flush any remaining buffered bytes as one final block (emitted only if non-empty), then
    /// append the BGZF end-of-file marker exactly once. Subsequent calls are no-ops.
    ///
    /// This also runs on `Drop`, so calling it explicitly is only necessary to observe or
    /// propagate its `Result`.
    pub fn finish(&mut self) -> BgzfResult<()> {
        if self.finished {
            return Ok(());
        }
        self.flush_full_blocks()?;
        self.emit_remainder()?;
        self.writer.write_all(BGZF_EOF)?;
        self.emitted_bytes += BGZF_EOF.len() as u64;
        self.finished = true;
        Ok(())
    }

    /// Alias for [`Writer::finish`], matching the naming other BGZF implementations use.
    pub fn close(&mut self) -> BgzfResult<()> {
        self.finish()
    }
}

impl Writer<File> {
    /// Create a BGZF writer from a [`Path`], creating or truncating the file.
    pub fn from_path<P>(path: P, compression_level: CompressionLevel) -> BgzfResult<Self>
    where
        P: AsRef<Path>,
    {
        let file = File::create(path).map_err(BgzfError::Io)?;
        Ok(Self::new(file, compression_level))
    }
}

impl<W> Write for Writer<W>
where
    W: Write,
{
    /// Write a buffer into this writer, returning how many bytes were written.
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.uncompressed_buffer.extend_from_slice(buf);
        self.flush_full_blocks().map_err(io::Error::from)?;
        Ok(buf.len())
    }

    /// Flush every buffered byte to the underlying sink as blocks, and flush the sink itself.
    ///
    /// Any sub-`blocksize` remainder is emitted as one short block so no buffered byte is ever
    /// left unflushed, honoring `Write::flush`'s contract. Unlike [`Writer::finish`] this never
    /// emits the EOF marker, so the writer remains usable afterwards (a later `write` simply
    /// starts filling a fresh block).
    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_full_blocks().map_err(io::Error::from)?;
        self.emit_remainder().map_err(io::Error::from)?;
        self.writer.flush()
    }
}

impl<W> Drop for Writer<W>
where
    W: Write,
{
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use super::*;
    use crate::Reader;

    #[test]
    fn empty_write_then_finish_is_exactly_the_eof_sentinel() {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, CompressionLevel::default_level());
        writer.finish().unwrap();
        drop(writer);
        assert_eq!(out, BGZF_EOF);
    }

    #[test]
    fn finish_is_idempotent() {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, CompressionLevel::default_level());
        writer.write_all(b"abc").unwrap();
        writer.finish().unwrap();
        let len_after_first = out.len();
        writer.finish().unwrap();
        assert_eq!(out.len(), len_after_first);
    }

    #[test]
    fn small_write_round_trips() {
        let mut out = Vec::new();
        {
            let mut writer = Writer::new(&mut out, CompressionLevel::default_level());
            writer.write_all(b"hello\n").unwrap();
            writer.finish().unwrap();
        }
        let mut reader = Reader::new(out.as_slice());
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(&data, b"hello\n");
    }

    #[test]
    fn large_write_splits_into_full_blocks_plus_sentinel() {
        let input = vec![0x41u8; 131_072];
        let mut out = Vec::new();
        {
            let mut writer = Writer::new(&mut out, CompressionLevel::default_level());
            writer.write_all(&input).unwrap();
            writer.finish().unwrap();
        }
        let mut reader = Reader::new(out.as_slice());
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data, input);
    }

    #[test]
    fn tell_reports_a_virtual_offset_into_the_not_yet_emitted_block() {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, CompressionLevel::default_level());
        assert_eq!(writer.tell(), VirtualOffset::new(0, 0).unwrap());

        writer.write_all(b"abc").unwrap();
        assert_eq!(writer.tell(), VirtualOffset::new(0, 3).unwrap());

        writer.finish().unwrap();
        // After `finish`, the buffer is empty and everything (including the EOF sentinel) has
        // been emitted to the sink, so `tell` reports the end of the stream with uoffset 0.
        assert_eq!(writer.tell(), VirtualOffset::new(out.len() as u64, 0).unwrap());
    }

    #[test]
    fn flush_emits_a_short_remainder_block_without_the_eof_sentinel() {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, CompressionLevel::default_level());
        writer.write_all(b"abc").unwrap();
        writer.flush().unwrap();

        // The remainder was compressed and written to the sink; nothing is still buffered.
        assert!(!out.is_empty());
        assert_eq!(writer.tell(), VirtualOffset::new(out.len() as u64, 0).unwrap());
        assert_ne!(out, BGZF_EOF);

        // The writer is still usable, and still owes exactly one EOF sentinel.
        writer.write_all(b"def").unwrap();
        writer.finish().unwrap();
        assert!(out.ends_with(BGZF_EOF));

        let mut reader = Reader::new(out.as_slice());
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"abcdef");
    }
}
