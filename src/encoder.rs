//! Archive encoder: a bounded queue of entries feeding one ZIP codec task
//!
//! ```text
//!  append(name, reader) ─► [entry queue] ─► codec task ─► [chunk channel] ─► ArchiveStream
//!                           (queue_size)    (ZipStreamWriter) (queue_size)     (AsyncRead)
//! ```
//!
//! Both queues are bounded, so a slow consumer of [`ArchiveStream`] suspends the codec task,
//! which stops draining the entry queue, which suspends [`ArchiveEncoder::append`]. The
//! encoder holds at most `queue_size + 1` source readers (queued plus the one being encoded);
//! readers a caller opens ahead of `append` come on top of that.
//!
//! The end of a complete archive is marked explicitly on the chunk channel. A stream that
//! closes without that marker, or an aborted encoder, surfaces as a read error on
//! [`ArchiveStream`] so an uploader never mistakes a truncated archive for a finished one.

use crate::error::{Error, Result};
use crate::storage::ObjectReader;
use crate::writer::ZipStreamWriter;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::PollSender;

/// Read buffer used to pull bytes from each source reader
const READ_BUFFER_SIZE: usize = 64 * 1024;

type Chunk = io::Result<Bytes>;

/// Lifecycle of an [`ArchiveEncoder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    /// Accepting entries
    Open,
    /// Draining queued entries and writing the central directory
    Finalizing,
    /// Finished, aborted or failed
    Closed,
}

/// Encoder tuning
#[derive(Debug, Clone)]
pub struct EncoderOptions {
    /// 0 stores, 1-9 deflate
    pub compression_level: u32,
    /// Queued entries and in-flight output chunks
    pub queue_size: usize,
    /// Size of the byte chunks handed to the consumer
    pub chunk_size: usize,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            compression_level: 9,
            queue_size: 4,
            chunk_size: 64 * 1024,
        }
    }
}

/// One named source stream queued for the archive
pub struct ArchiveEntry {
    pub name: String,
    pub reader: ObjectReader,
    pub modified: Option<DateTime<Utc>>,
    /// Expected uncompressed size; unknown sizes are written in ZIP64 form
    pub size: Option<u64>,
}

impl ArchiveEntry {
    pub fn new(name: impl Into<String>, reader: ObjectReader) -> Self {
        Self {
            name: name.into(),
            reader,
            modified: None,
            size: None,
        }
    }

    pub fn with_modified(mut self, modified: Option<DateTime<Utc>>) -> Self {
        self.modified = modified;
        self
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }
}

/// An entry whose source stream failed while it was being read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub name: String,
    pub reason: String,
}

/// What the codec produced
#[derive(Debug, Clone, Default)]
pub struct EncodeSummary {
    /// Entries present in the central directory, in append order
    pub entries: Vec<String>,
    /// Entries dropped because their source failed
    pub skipped: Vec<SkippedEntry>,
    /// Total uncompressed bytes of the appended entries
    pub uncompressed_bytes: u64,
    /// Size of the finished archive
    pub archive_size: u64,
}

/// Streaming ZIP encoder with a bounded entry queue
pub struct ArchiveEncoder {
    state: EncoderState,
    entries_tx: Option<mpsc::Sender<ArchiveEntry>>,
    output_tx: Option<mpsc::Sender<Chunk>>,
    task: Option<JoinHandle<Result<EncodeSummary>>>,
}

impl ArchiveEncoder {
    /// Start the codec task and return the encoder with its output stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(options: EncoderOptions) -> (Self, ArchiveStream) {
        let queue_size = options.queue_size.max(1);
        let (entries_tx, entries_rx) = mpsc::channel(queue_size);
        let (output_tx, output_rx) = mpsc::channel(queue_size);

        let output = ArchiveOutput::new(output_tx.clone(), options.chunk_size);
        let zip = ZipStreamWriter::new(output, options.compression_level)
            .with_flush_threshold(options.chunk_size);
        let task = tokio::spawn(encode_entries(zip, entries_rx, output_tx.clone()));

        tracing::debug!(
            compression_level = options.compression_level,
            queue_size,
            chunk_size = options.chunk_size,
            "Archive encoder started"
        );

        let encoder = Self {
            state: EncoderState::Open,
            entries_tx: Some(entries_tx),
            output_tx: Some(output_tx),
            task: Some(task),
        };
        (encoder, ArchiveStream::new(output_rx))
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    /// Queue an entry. Suspends while the queue is full.
    ///
    /// A failing source stream is not an error here; the entry is skipped and reported in
    /// the [`EncodeSummary`]. An error means the codec itself failed and the encoder is closed.
    pub async fn append(&mut self, entry: ArchiveEntry) -> Result<()> {
        if self.state != EncoderState::Open {
            return Err(Error::Archive(format!(
                "cannot append '{}': encoder is {:?}",
                entry.name, self.state
            )));
        }
        let sender = self
            .entries_tx
            .as_ref()
            .ok_or_else(|| Error::Internal("entry queue missing while open".to_string()))?;

        if sender.send(entry).await.is_err() {
            // The codec task is gone; its result explains why.
            self.entries_tx = None;
            let err = match self.join_task().await {
                Err(e) => e,
                Ok(_) => Error::Internal("archive codec stopped unexpectedly".to_string()),
            };
            self.close_output_with_error(&err.to_string()).await;
            return Err(err);
        }
        Ok(())
    }

    /// Write every queued entry and the central directory, then wait until the consumer
    /// has released the output stream.
    pub async fn finalize(&mut self) -> Result<EncodeSummary> {
        if self.state != EncoderState::Open {
            return Err(Error::Archive(format!(
                "cannot finalize: encoder is {:?}",
                self.state
            )));
        }
        self.state = EncoderState::Finalizing;
        self.entries_tx = None;

        match self.join_task().await {
            Ok(summary) => {
                if let Some(output_tx) = self.output_tx.take() {
                    output_tx.closed().await;
                }
                self.state = EncoderState::Closed;
                tracing::debug!(
                    entries = summary.entries.len(),
                    skipped = summary.skipped.len(),
                    archive_size = summary.archive_size,
                    "Archive encoder finalized"
                );
                Ok(summary)
            }
            Err(e) => {
                self.close_output_with_error(&e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Stop encoding and fail the output stream with `reason`.
    ///
    /// Queued source readers are dropped. Calling this on a closed encoder is a no-op.
    pub async fn abort(&mut self, reason: &str) {
        if self.state == EncoderState::Closed {
            return;
        }
        self.entries_tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        tracing::warn!(reason, "Archive encoder aborted");
        self.close_output_with_error(reason).await;
    }

    async fn join_task(&mut self) -> Result<EncodeSummary> {
        let task = self
            .task
            .take()
            .ok_or_else(|| Error::Internal("archive codec already joined".to_string()))?;
        let result = task
            .await
            .map_err(|e| Error::Internal(format!("archive codec task failed: {}", e)))?;
        if result.is_err() {
            self.state = EncoderState::Closed;
        }
        result
    }

    async fn close_output_with_error(&mut self, reason: &str) {
        self.state = EncoderState::Closed;
        if let Some(output_tx) = self.output_tx.take() {
            // Fails only if the consumer is already gone.
            let _ = output_tx
                .send(Err(io::Error::other(format!("archive aborted: {}", reason))))
                .await;
        }
    }
}

impl Drop for ArchiveEncoder {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(output_tx) = self.output_tx.take() {
            if self.state != EncoderState::Closed {
                let _ = output_tx.try_send(Err(io::Error::other("archive encoder dropped")));
            }
        }
    }
}

enum EntryOutcome {
    Appended(u64),
    Skipped(String),
}

async fn encode_entries(
    mut zip: ZipStreamWriter<ArchiveOutput>,
    mut entries_rx: mpsc::Receiver<ArchiveEntry>,
    abort_tx: mpsc::Sender<Chunk>,
) -> Result<EncodeSummary> {
    let run_started = Utc::now();
    let mut summary = EncodeSummary::default();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    let result = async {
        while let Some(entry) = entries_rx.recv().await {
            let name = entry.name.clone();
            match write_entry(&mut zip, entry, &mut buffer, run_started).await? {
                EntryOutcome::Appended(size) => {
                    tracing::debug!(entry = %name, size_bytes = size, "Entry appended");
                    summary.uncompressed_bytes += size;
                    summary.entries.push(name);
                }
                EntryOutcome::Skipped(reason) => {
                    tracing::warn!(
                        entry = %name,
                        error = %reason,
                        "Source read failed, entry skipped"
                    );
                    summary.skipped.push(SkippedEntry { name, reason });
                }
            }
        }
        // Release the queue before the (possibly slow) final flush.
        drop(entries_rx);
        if summary.entries.is_empty() {
            return Err(Error::Archive("archive has no readable entries".to_string()));
        }
        let (_, archive_size) = zip.finish().await?;
        Ok::<u64, Error>(archive_size)
    }
    .await;

    match result {
        Ok(archive_size) => {
            summary.archive_size = archive_size;
            Ok(summary)
        }
        Err(_) if abort_tx.is_closed() => {
            tracing::debug!("Archive consumer went away, encoder stopped");
            Err(Error::Io(consumer_gone()))
        }
        Err(e) => {
            let err = match e {
                Error::Archive(_) => e,
                other => Error::Archive(format!("archive codec failed: {}", other)),
            };
            tracing::error!(error = %err, "Archive encoding failed");
            let _ = abort_tx
                .send(Err(io::Error::other(format!("archive aborted: {}", err))))
                .await;
            Err(err)
        }
    }
}

/// Copy one source reader into the archive.
///
/// Source read errors produce `Skipped`; only codec/output errors are returned as `Err`.
async fn write_entry(
    zip: &mut ZipStreamWriter<ArchiveOutput>,
    mut entry: ArchiveEntry,
    buffer: &mut [u8],
    run_started: DateTime<Utc>,
) -> Result<EntryOutcome> {
    // Read ahead so an unreadable source leaves no bytes behind.
    let first = match entry.reader.read(buffer).await {
        Ok(n) => n,
        Err(e) => return Ok(EntryOutcome::Skipped(e.to_string())),
    };

    let modified = entry.modified.unwrap_or(run_started);
    zip.start_entry_sized(&entry.name, modified, entry.size).await?;
    let mut n = first;
    while n > 0 {
        zip.write_data(&buffer[..n]).await?;
        n = match entry.reader.read(buffer).await {
            Ok(n) => n,
            Err(e) => {
                zip.discard_entry().await?;
                return Ok(EntryOutcome::Skipped(e.to_string()));
            }
        };
    }

    let stats = zip.finish_entry().await?;
    Ok(EntryOutcome::Appended(stats.uncompressed_size))
}

/// `AsyncWrite` sink that cuts the archive into chunks on a bounded channel
pub(crate) struct ArchiveOutput {
    sender: PollSender<Chunk>,
    buffer: BytesMut,
    chunk_size: usize,
    finished: bool,
}

impl ArchiveOutput {
    pub(crate) fn new(sender: mpsc::Sender<Chunk>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            sender: PollSender::new(sender),
            buffer: BytesMut::with_capacity(chunk_size),
            chunk_size,
            finished: false,
        }
    }

    fn poll_send(&mut self, cx: &mut Context<'_>, chunk: Bytes) -> Poll<io::Result<()>> {
        ready!(self.sender.poll_reserve(cx)).map_err(|_| consumer_gone())?;
        self.sender.send_item(Ok(chunk)).map_err(|_| consumer_gone())?;
        Poll::Ready(Ok(()))
    }

    fn poll_send_buffer(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.buffer.is_empty() {
            return Poll::Ready(Ok(()));
        }
        ready!(self.sender.poll_reserve(cx)).map_err(|_| consumer_gone())?;
        let chunk = self.buffer.split().freeze();
        self.sender.send_item(Ok(chunk)).map_err(|_| consumer_gone())?;
        Poll::Ready(Ok(()))
    }
}

/// True when `err` only reports that the output stream's reader hung up.
pub(crate) fn is_consumer_gone(err: &Error) -> bool {
    matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::BrokenPipe)
}

fn consumer_gone() -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        "archive consumer stopped reading",
    )
}

impl AsyncWrite for ArchiveOutput {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.finished {
            return Poll::Ready(Err(io::Error::other("archive output already finished")));
        }
        if self.buffer.len() >= self.chunk_size {
            ready!(self.poll_send_buffer(cx))?;
        }
        let n = buf.len().min(self.chunk_size - self.buffer.len());
        self.buffer.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_send_buffer(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.finished {
            return Poll::Ready(Ok(()));
        }
        ready!(self.poll_send_buffer(cx))?;
        // An empty chunk marks a complete archive.
        ready!(self.poll_send(cx, Bytes::new()))?;
        self.finished = true;
        self.sender.close();
        Poll::Ready(Ok(()))
    }
}

/// The encoded archive as an `AsyncRead`
///
/// Yields EOF only after the encoder wrote a complete archive. An aborted or vanished
/// encoder yields an error instead.
pub struct ArchiveStream {
    receiver: mpsc::Receiver<Chunk>,
    current: Bytes,
    finished: bool,
}

impl ArchiveStream {
    fn new(receiver: mpsc::Receiver<Chunk>) -> Self {
        Self {
            receiver,
            current: Bytes::new(),
            finished: false,
        }
    }
}

impl AsyncRead for ArchiveStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.current.is_empty() {
                let n = self.current.len().min(buf.remaining());
                let chunk = self.current.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            if self.finished {
                return Poll::Ready(Ok(()));
            }

            match ready!(self.receiver.poll_recv(cx)) {
                Some(Ok(chunk)) if chunk.is_empty() => {
                    self.finished = true;
                    self.receiver.close();
                }
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "archive stream ended before the archive was complete",
                    )))
                }
            }
        }
    }
}
