//! Incremental ZIP codec over a forward-only async writer
//!
//! Entries are written as local header + compressed data + data descriptor, so sizes and
//! CRCs never have to be patched in place. Offsets for the central directory are tracked
//! by counting bytes on the way out, which lets the archive stream into a pipe, a channel
//! or a multipart upload with no seeking.
//!
//! Memory per entry stays bounded: compressed bytes accumulate in a small buffer that is
//! drained to the output whenever it crosses its flush threshold.

use crate::error::{Error, Result};
use async_compression::tokio::write::DeflateEncoder;
use bytes::BufMut;
use chrono::{DateTime, Datelike, Timelike, Utc};
use crc32fast::Hasher as Crc32;
use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};

const LOCAL_FILE_HEADER_SIGNATURE: u32 = 0x04034b50;
const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x08074b50;
const CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x02014b50;
const ZIP64_END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x06064b50;
const ZIP64_END_OF_CENTRAL_DIRECTORY_LOCATOR_SIGNATURE: u32 = 0x07064b50;
const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x06054b50;

/// Bit 3 (sizes in data descriptor) and bit 11 (UTF-8 names)
const GENERAL_PURPOSE_FLAGS: u16 = 0x0808;
const VERSION_NEEDED: u16 = 20;
const VERSION_NEEDED_ZIP64: u16 = 45;
const ZIP64_EXTRA_FIELD_ID: u16 = 0x0001;

/// Entries with a size hint at or above this get ZIP64 local headers. The margin below
/// 4 GiB covers deflate expansion of incompressible data.
const ZIP64_SIZE_HINT_THRESHOLD: u64 = 0xFF00_0000;

/// How entry data is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    /// No compression (stored)
    Stored,
    /// DEFLATE at the given level (1-9)
    Deflate(u32),
}

impl CompressionMethod {
    /// Map a 0-9 compression level onto a method: 0 stores, 1-9 deflate.
    pub fn from_level(level: u32) -> Self {
        match level {
            0 => CompressionMethod::Stored,
            level => CompressionMethod::Deflate(level.min(9)),
        }
    }

    pub(crate) fn to_zip_method(self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate(_) => 8,
        }
    }
}

pin_project! {
    /// Pass-through writer that counts bytes accepted by the inner writer
    struct CountingWriter<W> {
        #[pin]
        inner: W,
        written: u64,
    }
}

impl<W: AsyncWrite> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let n = ready!(this.inner.poll_write(cx, buf))?;
        *this.written += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Central directory record for a committed entry
struct CentralEntry {
    name: String,
    local_header_offset: u64,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    compression_method: u16,
    dos_time: u16,
    dos_date: u16,
    zip64: bool,
}

struct CurrentEntry {
    name: String,
    local_header_offset: u64,
    encoder: Box<dyn AsyncCompressorWrite>,
    counter: CrcCounter,
    compression_method: u16,
    dos_time: u16,
    dos_date: u16,
    /// Local header carries a ZIP64 extra field, so the data descriptor uses 8-byte sizes
    zip64: bool,
}

/// Sizes and checksum of an entry once its data has been terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStats {
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

type FinishFuture = Pin<Box<dyn Future<Output = Result<CompressedBuffer>> + Send>>;

trait AsyncCompressorWrite: AsyncWrite + Unpin + Send {
    fn finish_compression(self: Box<Self>) -> FinishFuture;
    fn get_buffer_mut(&mut self) -> &mut CompressedBuffer;
}

struct DeflateCompressor {
    encoder: DeflateEncoder<CompressedBuffer>,
}

impl AsyncWrite for DeflateCompressor {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.encoder).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.encoder).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.encoder).poll_shutdown(cx)
    }
}

impl AsyncCompressorWrite for DeflateCompressor {
    fn finish_compression(mut self: Box<Self>) -> FinishFuture {
        Box::pin(async move {
            self.encoder.shutdown().await?;
            Ok(self.encoder.into_inner())
        })
    }

    fn get_buffer_mut(&mut self) -> &mut CompressedBuffer {
        self.encoder.get_mut()
    }
}

/// Identity "compressor" for the stored method
struct StoredCompressor {
    buffer: CompressedBuffer,
}

impl AsyncWrite for StoredCompressor {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.buffer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncCompressorWrite for StoredCompressor {
    fn finish_compression(self: Box<Self>) -> FinishFuture {
        Box::pin(async move { Ok(self.buffer) })
    }

    fn get_buffer_mut(&mut self) -> &mut CompressedBuffer {
        &mut self.buffer
    }
}

/// CRC and byte counts for the entry being written
struct CrcCounter {
    crc: Crc32,
    uncompressed_count: u64,
    compressed_count: u64,
}

impl CrcCounter {
    fn new() -> Self {
        Self {
            crc: Crc32::new(),
            uncompressed_count: 0,
            compressed_count: 0,
        }
    }

    fn update_uncompressed(&mut self, data: &[u8]) {
        self.crc.update(data);
        self.uncompressed_count += data.len() as u64;
    }

    fn add_compressed(&mut self, count: u64) {
        self.compressed_count += count;
    }

    fn finalize(&self) -> u32 {
        self.crc.clone().finalize()
    }
}

/// Buffer for compressed bytes, drained to the output past a threshold
struct CompressedBuffer {
    buffer: Vec<u8>,
    flush_threshold: usize,
}

impl CompressedBuffer {
    fn new(flush_threshold: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(flush_threshold.min(64 * 1024)),
            flush_threshold,
        }
    }

    fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    fn should_flush(&self) -> bool {
        self.buffer.len() >= self.flush_threshold
    }
}

impl AsyncWrite for CompressedBuffer {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Convert a timestamp to MS-DOS (time, date), clamped to the representable 1980-2107 range.
pub(crate) fn dos_datetime(timestamp: DateTime<Utc>) -> (u16, u16) {
    let year = timestamp.year();
    if year < 1980 {
        return (0, (1 << 5) | 1);
    }
    if year > 2107 {
        return ((23 << 11) | (59 << 5) | 29, (127 << 9) | (12 << 5) | 31);
    }

    let time = (timestamp.hour() << 11) | (timestamp.minute() << 5) | (timestamp.second() / 2);
    let date = (((year - 1980) as u32) << 9) | (timestamp.month() << 5) | timestamp.day();
    (time as u16, date as u16)
}

/// Streaming ZIP writer over any forward-only async output
pub struct ZipStreamWriter<W: AsyncWrite + Unpin> {
    output: CountingWriter<W>,
    entries: Vec<CentralEntry>,
    current_entry: Option<CurrentEntry>,
    method: CompressionMethod,
    flush_threshold: usize,
}

impl<W: AsyncWrite + Unpin> ZipStreamWriter<W> {
    /// Create a writer with a 0-9 compression level (0 stores, 1-9 deflate)
    pub fn new(output: W, compression_level: u32) -> Self {
        Self::with_method(output, CompressionMethod::from_level(compression_level))
    }

    /// Create a writer with an explicit compression method
    pub fn with_method(output: W, method: CompressionMethod) -> Self {
        Self {
            output: CountingWriter {
                inner: output,
                written: 0,
            },
            entries: Vec::new(),
            current_entry: None,
            method,
            flush_threshold: 256 * 1024,
        }
    }

    /// Compressed bytes buffered per entry before they are pushed to the output
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold.max(1);
        self
    }

    /// Number of entries committed to the central directory so far
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Bytes written to the output so far
    pub fn bytes_written(&self) -> u64 {
        self.output.written
    }

    /// Start a new entry of unknown size. An entry still open is committed first.
    ///
    /// The entry is written in ZIP64 form so it may grow past 4 GiB.
    pub async fn start_entry(&mut self, name: &str, modified: DateTime<Utc>) -> Result<()> {
        self.start_entry_sized(name, modified, None).await
    }

    /// Start a new entry, choosing the header layout from the expected uncompressed size.
    ///
    /// Entries known to stay well below 4 GiB get classic headers and 16-byte data
    /// descriptors; large or unknown sizes get a ZIP64 local extra field, version 4.5 and
    /// 24-byte descriptors. An entry that outgrows a classic header fails on finish.
    pub async fn start_entry_sized(
        &mut self,
        name: &str,
        modified: DateTime<Utc>,
        size_hint: Option<u64>,
    ) -> Result<()> {
        if self.current_entry.is_some() {
            self.finish_entry().await?;
        }
        if name.len() > u16::MAX as usize {
            return Err(Error::Archive(format!(
                "entry name is too long ({} bytes)",
                name.len()
            )));
        }

        let local_header_offset = self.output.written;
        let compression_method = self.method.to_zip_method();
        let (dos_time, dos_date) = dos_datetime(modified);
        let zip64 = size_hint.map_or(true, |size| size >= ZIP64_SIZE_HINT_THRESHOLD);

        let mut header = Vec::with_capacity(30 + name.len() + 20);
        header.put_u32_le(LOCAL_FILE_HEADER_SIGNATURE);
        header.put_u16_le(if zip64 { VERSION_NEEDED_ZIP64 } else { VERSION_NEEDED });
        header.put_u16_le(GENERAL_PURPOSE_FLAGS);
        header.put_u16_le(compression_method);
        header.put_u16_le(dos_time);
        header.put_u16_le(dos_date);
        header.put_u32_le(0); // crc32, in data descriptor
        if zip64 {
            header.put_u32_le(u32::MAX);
            header.put_u32_le(u32::MAX);
        } else {
            header.put_u32_le(0); // compressed size, in data descriptor
            header.put_u32_le(0); // uncompressed size, in data descriptor
        }
        header.put_u16_le(name.len() as u16);
        header.put_u16_le(if zip64 { 20 } else { 0 });
        header.put_slice(name.as_bytes());
        if zip64 {
            // Both sizes are zero here; the data descriptor carries them.
            header.put_u16_le(ZIP64_EXTRA_FIELD_ID);
            header.put_u16_le(16);
            header.put_u64_le(0);
            header.put_u64_le(0);
        }
        self.output.write_all(&header).await?;

        let buffer = CompressedBuffer::new(self.flush_threshold);
        let encoder: Box<dyn AsyncCompressorWrite> = match self.method {
            CompressionMethod::Stored => Box::new(StoredCompressor { buffer }),
            CompressionMethod::Deflate(level) => Box::new(DeflateCompressor {
                encoder: DeflateEncoder::with_quality(
                    buffer,
                    async_compression::Level::Precise(level as i32),
                ),
            }),
        };

        self.current_entry = Some(CurrentEntry {
            name: name.to_string(),
            local_header_offset,
            encoder,
            counter: CrcCounter::new(),
            compression_method,
            dos_time,
            dos_date,
            zip64,
        });

        Ok(())
    }

    /// Write uncompressed data to the current entry
    pub async fn write_data(&mut self, data: &[u8]) -> Result<()> {
        let entry = self
            .current_entry
            .as_mut()
            .ok_or_else(|| Error::Archive("no entry started".to_string()))?;

        entry.counter.update_uncompressed(data);
        entry.encoder.write_all(data).await?;

        let buffer = entry.encoder.get_buffer_mut();
        if buffer.should_flush() {
            let compressed = buffer.take();
            self.output.write_all(&compressed).await?;
            entry.counter.add_compressed(compressed.len() as u64);
        }

        Ok(())
    }

    /// Terminate the current entry and record it in the central directory
    pub async fn finish_entry(&mut self) -> Result<EntryStats> {
        let entry = self
            .current_entry
            .take()
            .ok_or_else(|| Error::Archive("no entry started".to_string()))?;
        let name = entry.name.clone();
        let local_header_offset = entry.local_header_offset;
        let compression_method = entry.compression_method;
        let (dos_time, dos_date) = (entry.dos_time, entry.dos_date);
        let zip64 = entry.zip64;

        let stats = self.terminate_entry(entry).await?;
        self.entries.push(CentralEntry {
            name,
            local_header_offset,
            crc32: stats.crc32,
            compressed_size: stats.compressed_size,
            uncompressed_size: stats.uncompressed_size,
            compression_method,
            dos_time,
            dos_date,
            zip64,
        });
        Ok(stats)
    }

    /// Terminate the current entry without recording it.
    ///
    /// The bytes already written stay in the stream as unreferenced data; readers that go
    /// through the central directory never see the entry.
    pub async fn discard_entry(&mut self) -> Result<()> {
        if let Some(entry) = self.current_entry.take() {
            self.terminate_entry(entry).await?;
        }
        Ok(())
    }

    async fn terminate_entry(&mut self, mut entry: CurrentEntry) -> Result<EntryStats> {
        let mut buffer = entry.encoder.finish_compression().await?;
        let remaining = buffer.take();
        if !remaining.is_empty() {
            self.output.write_all(&remaining).await?;
            entry.counter.add_compressed(remaining.len() as u64);
        }

        let stats = EntryStats {
            crc32: entry.counter.finalize(),
            compressed_size: entry.counter.compressed_count,
            uncompressed_size: entry.counter.uncompressed_count,
        };

        let oversized =
            stats.compressed_size > u32::MAX as u64 || stats.uncompressed_size > u32::MAX as u64;
        if oversized && !entry.zip64 {
            return Err(Error::Archive(format!(
                "entry '{}' grew past 4 GiB after a classic header was written",
                entry.name
            )));
        }

        let mut descriptor = Vec::with_capacity(24);
        descriptor.put_u32_le(DATA_DESCRIPTOR_SIGNATURE);
        descriptor.put_u32_le(stats.crc32);
        if entry.zip64 {
            descriptor.put_u64_le(stats.compressed_size);
            descriptor.put_u64_le(stats.uncompressed_size);
        } else {
            descriptor.put_u32_le(stats.compressed_size as u32);
            descriptor.put_u32_le(stats.uncompressed_size as u32);
        }
        self.output.write_all(&descriptor).await?;

        Ok(stats)
    }

    /// Write the central directory, flush and shut the output down.
    ///
    /// An entry still open is committed first. Returns the inner writer and the total
    /// archive size.
    pub async fn finish(mut self) -> Result<(W, u64)> {
        if self.current_entry.is_some() {
            self.finish_entry().await?;
        }

        let central_dir_offset = self.output.written;
        for entry in &self.entries {
            let record = central_directory_record(entry);
            self.output.write_all(&record).await?;
        }
        let central_dir_size = self.output.written - central_dir_offset;

        let trailer =
            end_of_central_directory(self.entries.len(), central_dir_offset, central_dir_size);
        self.output.write_all(&trailer).await?;

        // Shutdown is what tells a channel/upload consumer the archive is complete.
        self.output.flush().await?;
        self.output.shutdown().await?;

        let total = self.output.written;
        Ok((self.output.inner, total))
    }
}

fn central_directory_record(entry: &CentralEntry) -> Vec<u8> {
    let needs_zip64 = |value: u64| value > u32::MAX as u64;

    let mut zip64 = Vec::new();
    if needs_zip64(entry.uncompressed_size) {
        zip64.put_u64_le(entry.uncompressed_size);
    }
    if needs_zip64(entry.compressed_size) {
        zip64.put_u64_le(entry.compressed_size);
    }
    if needs_zip64(entry.local_header_offset) {
        zip64.put_u64_le(entry.local_header_offset);
    }
    let mut extra = Vec::new();
    if !zip64.is_empty() {
        extra.put_u16_le(ZIP64_EXTRA_FIELD_ID);
        extra.put_u16_le(zip64.len() as u16);
        extra.put_slice(&zip64);
    }

    let clamp32 = |value: u64| {
        if needs_zip64(value) {
            u32::MAX
        } else {
            value as u32
        }
    };

    let version = if entry.zip64 || !extra.is_empty() {
        VERSION_NEEDED_ZIP64
    } else {
        VERSION_NEEDED
    };

    let mut record = Vec::with_capacity(46 + entry.name.len() + extra.len());
    record.put_u32_le(CENTRAL_DIRECTORY_SIGNATURE);
    record.put_u16_le(version); // version made by
    record.put_u16_le(version);
    record.put_u16_le(GENERAL_PURPOSE_FLAGS);
    record.put_u16_le(entry.compression_method);
    record.put_u16_le(entry.dos_time);
    record.put_u16_le(entry.dos_date);
    record.put_u32_le(entry.crc32);
    record.put_u32_le(clamp32(entry.compressed_size));
    record.put_u32_le(clamp32(entry.uncompressed_size));
    record.put_u16_le(entry.name.len() as u16);
    record.put_u16_le(extra.len() as u16);
    record.put_u16_le(0); // comment length
    record.put_u16_le(0); // disk number start
    record.put_u16_le(0); // internal attributes
    record.put_u32_le(0); // external attributes
    record.put_u32_le(clamp32(entry.local_header_offset));
    record.put_slice(entry.name.as_bytes());
    record.put_slice(&extra);
    record
}

fn end_of_central_directory(entry_count: usize, cd_offset: u64, cd_size: u64) -> Vec<u8> {
    let need_zip64 = entry_count > u16::MAX as usize
        || cd_size > u32::MAX as u64
        || cd_offset > u32::MAX as u64;

    let mut trailer = Vec::with_capacity(98);
    if need_zip64 {
        trailer.put_u32_le(ZIP64_END_OF_CENTRAL_DIRECTORY_SIGNATURE);
        trailer.put_u64_le(44); // size of the remaining record
        trailer.put_u16_le(45); // version made by
        trailer.put_u16_le(45); // version needed
        trailer.put_u32_le(0); // this disk
        trailer.put_u32_le(0); // disk with central directory
        trailer.put_u64_le(entry_count as u64);
        trailer.put_u64_le(entry_count as u64);
        trailer.put_u64_le(cd_size);
        trailer.put_u64_le(cd_offset);

        trailer.put_u32_le(ZIP64_END_OF_CENTRAL_DIRECTORY_LOCATOR_SIGNATURE);
        trailer.put_u32_le(0); // disk with zip64 record
        trailer.put_u64_le(cd_offset + cd_size);
        trailer.put_u32_le(1); // total disks
    }

    let entries16 = if entry_count > u16::MAX as usize {
        u16::MAX
    } else {
        entry_count as u16
    };
    trailer.put_u32_le(END_OF_CENTRAL_DIRECTORY_SIGNATURE);
    trailer.put_u16_le(0); // disk number
    trailer.put_u16_le(0); // disk with central directory
    trailer.put_u16_le(entries16);
    trailer.put_u16_le(entries16);
    trailer.put_u32_le(cd_size.min(u32::MAX as u64) as u32);
    trailer.put_u32_le(cd_offset.min(u32::MAX as u64) as u32);
    trailer.put_u16_le(0); // comment length
    trailer
}
