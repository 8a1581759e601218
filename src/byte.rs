//! Byte-oriented producer stream with zero-copy reads.
//!
//! Unlike the default stream, controller operations here (`respond`,
//! `enqueue`, `close`) are synchronous: consumers hand buffers to the stream
//! and the source fills them in place, so the state machine lives in a shared
//! `Mutex` structure rather than inside the driver task. The driver task only
//! owns the [`ByteSource`] and serializes `pull`/`cancel`, woken through a
//! signal whenever demand appears.
//!
//! A BYOB ("bring your own buffer") read parks a pull-into descriptor in a
//! FIFO. Descriptors commit only at element-size boundaries; a `respond` that
//! overshoots the last aligned boundary carries the unaligned tail back into
//! the byte queue for the next descriptor.

use crate::{
    error::{StreamError, StreamResult},
    wake::{AsyncSignal, WakerSet},
};
use futures::{
    channel::oneshot,
    future::{poll_fn, BoxFuture},
    io::AsyncRead,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    future::Future,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteStreamState {
    Readable,
    Closed,
    Errored,
}

/// Result of a BYOB read: the caller's buffer back, with the filled prefix
/// length and the end-of-stream flag.
#[derive(Debug)]
pub struct ByobResult {
    pub buffer: Vec<u8>,
    pub filled: usize,
    pub done: bool,
}

// ----------- Source trait -----------

/// A byte source driven by the stream's driver task.
///
/// Sources either copy (`controller.enqueue`) or fill the consumer's buffer
/// in place through `controller.byob_request()`.
pub trait ByteSource: Send + 'static {
    fn start(
        &mut self,
        controller: &ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + Send {
        let _ = controller;
        futures::future::ready(Ok(()))
    }

    fn pull(
        &mut self,
        controller: &ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + Send;

    fn cancel(&mut self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> + Send {
        let _ = reason;
        futures::future::ready(Ok(()))
    }
}

// ----------- Pull-into descriptors -----------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderKind {
    // Auto-allocated on behalf of a default read.
    Default,
    Byob,
}

struct PullIntoDescriptor {
    buffer: Vec<u8>,
    byte_offset: usize,
    byte_length: usize,
    bytes_filled: usize,
    element_size: usize,
    reader_kind: ReaderKind,
    // Byob descriptors resolve their own read; Default descriptors resolve
    // the head of `pending_reads` instead.
    completion: Option<oneshot::Sender<StreamResult<ByobResult>>>,
}

// ----------- Shared state -----------

struct ByteInner {
    state: ByteStreamState,
    queue: VecDeque<Vec<u8>>,
    queue_total: usize,
    pending_reads: VecDeque<oneshot::Sender<StreamResult<Option<Vec<u8>>>>>,
    pull_intos: VecDeque<PullIntoDescriptor>,
    close_requested: bool,
    started: bool,
    pulling: bool,
    pull_again: bool,
    cancel_requested: bool,
    cancel_reason: Option<Option<String>>,
    cancel_completions: Vec<oneshot::Sender<StreamResult<()>>>,
    stored_error: Option<StreamError>,
    auto_allocate: Option<usize>,
    high_water_mark: usize,
    closed_wakers: WakerSet,
}

struct ByteShared {
    inner: Mutex<ByteInner>,
    pull_signal: AsyncSignal,
    locked: AtomicBool,
}

impl ByteInner {
    fn stored_error(&self) -> StreamError {
        self.stored_error.clone().unwrap_or(StreamError::Closed)
    }

    fn desired_size(&self) -> isize {
        if self.state != ByteStreamState::Readable {
            return 0;
        }
        self.high_water_mark as isize - self.queue_total as isize
    }

    fn should_pull(&self) -> bool {
        self.state == ByteStreamState::Readable
            && self.started
            && !self.close_requested
            && !self.cancel_requested
            && (!self.pending_reads.is_empty()
                || !self.pull_intos.is_empty()
                || self.desired_size() > 0)
    }

    /// Copy queued bytes into the head descriptor up to the last element
    /// boundary reachable with what's buffered. True when at least one full
    /// element landed.
    fn fill_head_from_queue(&mut self) -> bool {
        let desc = match self.pull_intos.front_mut() {
            Some(d) => d,
            None => return false,
        };
        let max_copy = self.queue_total.min(desc.byte_length - desc.bytes_filled);
        let max_filled = desc.bytes_filled + max_copy;
        let max_aligned = max_filled - max_filled % desc.element_size;
        if max_aligned <= desc.bytes_filled {
            return false;
        }
        let mut remaining = max_aligned - desc.bytes_filled;
        while remaining > 0 {
            let chunk = self.queue.front_mut().expect("bytes accounted in queue");
            let n = remaining.min(chunk.len());
            let dest_start = desc.byte_offset + desc.bytes_filled;
            desc.buffer[dest_start..dest_start + n].copy_from_slice(&chunk[..n]);
            if n == chunk.len() {
                self.queue.pop_front();
            } else {
                chunk.drain(..n);
            }
            self.queue_total -= n;
            desc.bytes_filled += n;
            remaining -= n;
        }
        true
    }

    fn commit_descriptor(&mut self, desc: PullIntoDescriptor, done: bool) {
        match desc.reader_kind {
            ReaderKind::Byob => {
                if let Some(tx) = desc.completion {
                    let _ = tx.send(Ok(ByobResult {
                        filled: desc.bytes_filled,
                        buffer: desc.buffer,
                        done,
                    }));
                }
            }
            ReaderKind::Default => {
                if let Some(tx) = self.pending_reads.pop_front() {
                    if desc.bytes_filled == 0 {
                        let _ = tx.send(Ok(if done { None } else { Some(Vec::new()) }));
                    } else {
                        let mut buffer = desc.buffer;
                        buffer.truncate(desc.byte_offset + desc.bytes_filled);
                        let _ = tx.send(Ok(Some(buffer)));
                    }
                }
            }
        }
    }

    /// Commit descriptors for as long as the queue can complete them.
    fn process_pull_intos(&mut self) {
        while self.queue_total > 0 && !self.pull_intos.is_empty() {
            if self.fill_head_from_queue() {
                let desc = self.pull_intos.pop_front().expect("head present");
                self.commit_descriptor(desc, false);
            } else {
                break;
            }
        }
        self.maybe_finish_close();
    }

    /// Once close is requested, a descriptor still parked after a fill
    /// attempt can never complete: only sub-element bytes remain and no
    /// further enqueue is allowed. Fail the stream instead of hanging the
    /// read.
    fn fail_starved_pull_intos(&mut self) -> Option<StreamError> {
        if self.close_requested
            && self.state == ByteStreamState::Readable
            && !self.pull_intos.is_empty()
        {
            let err =
                StreamError::from("insufficient bytes to fill elements in the given buffer");
            self.error_stream(err.clone());
            return Some(err);
        }
        None
    }

    fn maybe_finish_close(&mut self) {
        if self.close_requested
            && self.queue_total == 0
            && self.state == ByteStreamState::Readable
        {
            self.finish_close();
        }
    }

    fn finish_close(&mut self) {
        trace!("byte stream closed");
        self.state = ByteStreamState::Closed;
        while let Some(tx) = self.pending_reads.pop_front() {
            let _ = tx.send(Ok(None));
        }
        while let Some(desc) = self.pull_intos.pop_front() {
            self.commit_descriptor(desc, true);
        }
        self.closed_wakers.wake_all();
    }

    fn error_stream(&mut self, err: StreamError) {
        if self.state != ByteStreamState::Readable {
            return;
        }
        debug!(error = %err, "byte stream errored");
        self.state = ByteStreamState::Errored;
        self.stored_error = Some(err.clone());
        self.queue.clear();
        self.queue_total = 0;
        while let Some(tx) = self.pending_reads.pop_front() {
            let _ = tx.send(Err(err.clone()));
        }
        while let Some(desc) = self.pull_intos.pop_front() {
            if let Some(tx) = desc.completion {
                let _ = tx.send(Err(err.clone()));
            }
        }
        self.closed_wakers.wake_all();
    }
}

impl ByteShared {
    /// Wake the driver, or ask it to pull once more if one is in flight.
    fn signal_pull(&self, inner: &mut ByteInner) {
        if inner.pulling {
            inner.pull_again = true;
        } else {
            self.pull_signal.signal();
        }
    }
}

// ----------- Controller -----------

/// Handle given to the byte source.
#[derive(Clone)]
pub struct ReadableByteStreamController {
    shared: Arc<ByteShared>,
}

impl ReadableByteStreamController {
    pub fn desired_size(&self) -> Option<isize> {
        let inner = self.shared.inner.lock();
        match inner.state {
            ByteStreamState::Readable => Some(inner.desired_size()),
            _ => None,
        }
    }

    /// Deliver a chunk by copy. Pending reads are served directly; otherwise
    /// the chunk is buffered (and fills waiting descriptors).
    pub fn enqueue(&self, chunk: Vec<u8>) -> StreamResult<()> {
        let mut inner = self.shared.inner.lock();
        if inner.close_requested {
            return Err(StreamError::InvalidUsage("enqueue after close requested"));
        }
        match inner.state {
            ByteStreamState::Errored => return Err(inner.stored_error()),
            ByteStreamState::Closed => return Err(StreamError::Closed),
            ByteStreamState::Readable => {}
        }
        if let Some(tx) = inner.pending_reads.pop_front() {
            // A default read is waiting; an auto-allocated descriptor for it
            // becomes irrelevant.
            if inner
                .pull_intos
                .front()
                .is_some_and(|d| d.reader_kind == ReaderKind::Default)
            {
                inner.pull_intos.pop_front();
            }
            let _ = tx.send(Ok(Some(chunk)));
        } else {
            inner.queue_total += chunk.len();
            inner.queue.push_back(chunk);
            inner.process_pull_intos();
        }
        self.shared.signal_pull(&mut inner);
        Ok(())
    }

    /// Request a close. If a descriptor is partially filled the stream errors
    /// instead, since the consumer could never observe those bytes.
    pub fn close(&self) -> StreamResult<()> {
        let mut inner = self.shared.inner.lock();
        if inner.close_requested {
            return Err(StreamError::InvalidUsage("close already requested"));
        }
        match inner.state {
            ByteStreamState::Errored => return Err(inner.stored_error()),
            ByteStreamState::Closed => return Err(StreamError::Closed),
            ByteStreamState::Readable => {}
        }
        inner.close_requested = true;
        if inner.queue_total > 0 {
            if let Some(err) = inner.fail_starved_pull_intos() {
                return Err(err);
            }
            return Ok(());
        }
        if inner
            .pull_intos
            .front()
            .is_some_and(|d| d.bytes_filled > 0)
        {
            let err = StreamError::from("close requested with a partially filled read buffer");
            inner.error_stream(err.clone());
            return Err(err);
        }
        inner.finish_close();
        Ok(())
    }

    pub fn error(&self, error: StreamError) -> StreamResult<()> {
        let mut inner = self.shared.inner.lock();
        inner.error_stream(error);
        self.shared.pull_signal.signal();
        Ok(())
    }

    /// The head pull-into descriptor, if any, for in-place filling.
    pub fn byob_request(&self) -> Option<ByobRequest> {
        let inner = self.shared.inner.lock();
        if inner.pull_intos.is_empty() {
            return None;
        }
        Some(ByobRequest {
            shared: Arc::clone(&self.shared),
        })
    }
}

/// In-place write access to the head descriptor.
pub struct ByobRequest {
    shared: Arc<ByteShared>,
}

impl ByobRequest {
    /// Unfilled capacity of the head descriptor, or `None` if it is gone.
    pub fn remaining(&self) -> Option<usize> {
        let inner = self.shared.inner.lock();
        inner
            .pull_intos
            .front()
            .map(|d| d.byte_length - d.bytes_filled)
    }

    /// Run `f` over the unfilled region of the head descriptor.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> StreamResult<R> {
        let mut inner = self.shared.inner.lock();
        let desc = inner
            .pull_intos
            .front_mut()
            .ok_or(StreamError::InvalidUsage("no pending read buffer"))?;
        let start = desc.byte_offset + desc.bytes_filled;
        let end = desc.byte_offset + desc.byte_length;
        Ok(f(&mut desc.buffer[start..end]))
    }

    /// Declare `bytes_written` bytes filled starting at the current fill
    /// level. Commits the descriptor once it crosses an element boundary;
    /// an unaligned tail is carried back into the queue.
    pub fn respond(&self, bytes_written: usize) -> StreamResult<()> {
        let mut inner = self.shared.inner.lock();
        if inner.pull_intos.is_empty() {
            return Err(StreamError::InvalidUsage("no pending read buffer"));
        }
        match inner.state {
            ByteStreamState::Errored => return Err(inner.stored_error()),
            ByteStreamState::Closed => {
                if bytes_written != 0 {
                    return Err(StreamError::InvalidUsage(
                        "non-zero respond on a closed stream",
                    ));
                }
                while let Some(desc) = inner.pull_intos.pop_front() {
                    debug_assert_eq!(desc.bytes_filled, 0);
                    inner.commit_descriptor(desc, true);
                }
                return Ok(());
            }
            ByteStreamState::Readable => {}
        }
        if bytes_written == 0 {
            return Err(StreamError::InvalidUsage("respond with zero bytes"));
        }
        {
            let desc = inner.pull_intos.front_mut().expect("checked non-empty");
            if desc.bytes_filled + bytes_written > desc.byte_length {
                return Err(StreamError::InvalidUsage("respond past buffer end"));
            }
            desc.bytes_filled += bytes_written;
            if desc.bytes_filled < desc.element_size {
                // Below one element; keep accumulating.
                self.shared.signal_pull(&mut inner);
                return Ok(());
            }
        }
        let mut desc = inner.pull_intos.pop_front().expect("checked non-empty");
        let remainder = desc.bytes_filled % desc.element_size;
        if remainder > 0 {
            let end = desc.byte_offset + desc.bytes_filled;
            let tail = desc.buffer[end - remainder..end].to_vec();
            inner.queue_total += tail.len();
            inner.queue.push_back(tail);
            desc.bytes_filled -= remainder;
        }
        inner.commit_descriptor(desc, false);
        inner.process_pull_intos();
        self.shared.signal_pull(&mut inner);
        Ok(())
    }

    /// Copy `data` into the head descriptor and respond with its length.
    pub fn respond_with(&self, data: &[u8]) -> StreamResult<()> {
        let copied = self.with_buffer(|buf| {
            if data.len() > buf.len() {
                return Err(StreamError::InvalidUsage("respond past buffer end"));
            }
            buf[..data.len()].copy_from_slice(data);
            Ok(data.len())
        })??;
        self.respond(copied)
    }
}

// ----------- Stream handle -----------

/// Byte producer stream handle.
pub struct ReadableByteStream {
    shared: Arc<ByteShared>,
}

impl Clone for ReadableByteStream {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for ReadableByteStream {
    fn drop(&mut self) {
        // Let the driver notice handle abandonment.
        self.shared.pull_signal.signal();
    }
}

impl ReadableByteStream {
    pub fn builder<Source: ByteSource>(source: Source) -> ReadableByteStreamBuilder<Source> {
        ReadableByteStreamBuilder {
            source,
            high_water_mark: 0,
            auto_allocate: None,
        }
    }

    pub fn locked(&self) -> bool {
        self.shared.locked.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().state == ByteStreamState::Closed
    }

    pub fn is_errored(&self) -> bool {
        self.shared.inner.lock().state == ByteStreamState::Errored
    }

    pub fn get_reader(&self) -> StreamResult<ByteStreamDefaultReader> {
        self.acquire_lock()?;
        Ok(ByteStreamDefaultReader {
            stream: self.clone(),
        })
    }

    pub fn get_byob_reader(&self) -> StreamResult<ByteStreamByobReader> {
        self.acquire_lock()?;
        Ok(ByteStreamByobReader {
            stream: self.clone(),
        })
    }

    fn acquire_lock(&self) -> StreamResult<()> {
        if self
            .shared
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StreamError::LockContended);
        }
        Ok(())
    }

    pub async fn cancel(&self, reason: Option<String>) -> StreamResult<()> {
        if self.locked() {
            return Err(StreamError::InvalidUsage("cancel on a locked stream"));
        }
        cancel_byte_stream(&self.shared, reason).await
    }
}

async fn cancel_byte_stream(shared: &Arc<ByteShared>, reason: Option<String>) -> StreamResult<()> {
    let rx = {
        let mut inner = shared.inner.lock();
        match inner.state {
            ByteStreamState::Closed => return Ok(()),
            ByteStreamState::Errored => return Err(inner.stored_error()),
            ByteStreamState::Readable => {}
        }
        trace!("byte stream cancel requested");
        inner.cancel_requested = true;
        inner.cancel_reason = Some(reason);
        let (tx, rx) = oneshot::channel();
        inner.cancel_completions.push(tx);
        inner.queue.clear();
        inner.queue_total = 0;
        inner.finish_close();
        shared.pull_signal.signal();
        rx
    };
    rx.await.unwrap_or(Err(StreamError::TaskDropped))
}

async fn closed_future(shared: &Arc<ByteShared>) -> StreamResult<()> {
    poll_fn(|cx| {
        let inner = shared.inner.lock();
        match inner.state {
            ByteStreamState::Closed => Poll::Ready(Ok(())),
            ByteStreamState::Errored => Poll::Ready(Err(inner.stored_error())),
            ByteStreamState::Readable => {
                inner.closed_wakers.register(cx.waker());
                Poll::Pending
            }
        }
    })
    .await
}

/// Shared read-into path used by the BYOB reader and the `AsyncRead`
/// adapter.
async fn byob_read(
    shared: Arc<ByteShared>,
    buffer: Vec<u8>,
    element_size: usize,
) -> StreamResult<ByobResult> {
    if element_size == 0 {
        return Err(StreamError::InvalidUsage("element size must be non-zero"));
    }
    if buffer.len() < element_size || buffer.len() % element_size != 0 {
        return Err(StreamError::InvalidUsage(
            "buffer length must be a non-zero multiple of the element size",
        ));
    }
    let rx = {
        let mut inner = shared.inner.lock();
        match inner.state {
            ByteStreamState::Errored => return Err(inner.stored_error()),
            ByteStreamState::Closed => {
                return Ok(ByobResult {
                    buffer,
                    filled: 0,
                    done: true,
                })
            }
            ByteStreamState::Readable => {}
        }
        let (tx, rx) = oneshot::channel();
        let byte_length = buffer.len();
        inner.pull_intos.push_back(PullIntoDescriptor {
            buffer,
            byte_offset: 0,
            byte_length,
            bytes_filled: 0,
            element_size,
            reader_kind: ReaderKind::Byob,
            completion: Some(tx),
        });
        if inner.queue_total > 0 {
            inner.process_pull_intos();
        }
        inner.fail_starved_pull_intos();
        shared.signal_pull(&mut inner);
        rx
    };
    rx.await.unwrap_or(Err(StreamError::TaskDropped))
}

// ----------- Readers -----------

/// Chunk-at-a-time reader over a byte stream.
pub struct ByteStreamDefaultReader {
    stream: ReadableByteStream,
}

impl ByteStreamDefaultReader {
    /// Read the next buffered chunk; `Ok(None)` signals a clean close.
    pub async fn read(&self) -> StreamResult<Option<Vec<u8>>> {
        let rx = {
            let shared = &self.stream.shared;
            let mut inner = shared.inner.lock();
            match inner.state {
                ByteStreamState::Errored => return Err(inner.stored_error()),
                _ if !inner.queue.is_empty() => {
                    let chunk = inner.queue.pop_front().expect("non-empty");
                    inner.queue_total -= chunk.len();
                    inner.maybe_finish_close();
                    shared.signal_pull(&mut inner);
                    return Ok(Some(chunk));
                }
                ByteStreamState::Closed => return Ok(None),
                ByteStreamState::Readable => {}
            }
            let (tx, rx) = oneshot::channel();
            inner.pending_reads.push_back(tx);
            if let Some(size) = inner.auto_allocate {
                // Give the source a buffer to fill even without a BYOB
                // reader attached.
                inner.pull_intos.push_back(PullIntoDescriptor {
                    buffer: vec![0; size],
                    byte_offset: 0,
                    byte_length: size,
                    bytes_filled: 0,
                    element_size: 1,
                    reader_kind: ReaderKind::Default,
                    completion: None,
                });
            }
            shared.signal_pull(&mut inner);
            rx
        };
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }

    pub async fn closed(&self) -> StreamResult<()> {
        closed_future(&self.stream.shared).await
    }

    pub async fn cancel(&self, reason: Option<String>) -> StreamResult<()> {
        cancel_byte_stream(&self.stream.shared, reason).await
    }

    pub fn release_lock(self) -> ReadableByteStream {
        let stream = self.stream.clone();
        drop(self);
        stream
    }
}

impl Drop for ByteStreamDefaultReader {
    fn drop(&mut self) {
        self.stream.shared.locked.store(false, Ordering::SeqCst);
    }
}

/// Buffer-providing reader: reads fill caller-owned buffers in place.
pub struct ByteStreamByobReader {
    stream: ReadableByteStream,
}

impl ByteStreamByobReader {
    /// Fill `buffer` with at least one byte (element size 1), or report end
    /// of stream.
    pub async fn read_into(&self, buffer: Vec<u8>) -> StreamResult<ByobResult> {
        byob_read(Arc::clone(&self.stream.shared), buffer, 1).await
    }

    /// Fill `buffer` in whole multiples of `element_size` bytes. The read
    /// resolves only once at least one full element is available.
    pub async fn read_into_elements(
        &self,
        buffer: Vec<u8>,
        element_size: usize,
    ) -> StreamResult<ByobResult> {
        byob_read(Arc::clone(&self.stream.shared), buffer, element_size).await
    }

    pub async fn closed(&self) -> StreamResult<()> {
        closed_future(&self.stream.shared).await
    }

    pub async fn cancel(&self, reason: Option<String>) -> StreamResult<()> {
        cancel_byte_stream(&self.stream.shared, reason).await
    }

    pub fn release_lock(self) -> ReadableByteStream {
        let stream = self.stream.clone();
        drop(self);
        stream
    }

    /// Adapt the reader into a [`futures::io::AsyncRead`].
    pub fn into_async_read(self) -> ByteStreamAsyncRead {
        ByteStreamAsyncRead {
            reader: self,
            pending: None,
            leftover: Vec::new(),
            leftover_pos: 0,
            done: false,
        }
    }
}

impl Drop for ByteStreamByobReader {
    fn drop(&mut self) {
        self.stream.shared.locked.store(false, Ordering::SeqCst);
    }
}

// ----------- AsyncRead adapter -----------

/// `AsyncRead` over a BYOB reader. Holds the stream lock until dropped.
pub struct ByteStreamAsyncRead {
    reader: ByteStreamByobReader,
    pending: Option<BoxFuture<'static, StreamResult<ByobResult>>>,
    // Bytes read beyond what the caller's buffer could take.
    leftover: Vec<u8>,
    leftover_pos: usize,
    done: bool,
}

impl AsyncRead for ByteStreamAsyncRead {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.leftover_pos < this.leftover.len() {
            let n = buf.len().min(this.leftover.len() - this.leftover_pos);
            buf[..n].copy_from_slice(&this.leftover[this.leftover_pos..this.leftover_pos + n]);
            this.leftover_pos += n;
            if this.leftover_pos == this.leftover.len() {
                this.leftover.clear();
                this.leftover_pos = 0;
            }
            return Poll::Ready(Ok(n));
        }
        if this.done {
            return Poll::Ready(Ok(0));
        }
        let fut = this.pending.get_or_insert_with(|| {
            let shared = Arc::clone(&this.reader.stream.shared);
            let request = vec![0; buf.len()];
            Box::pin(byob_read(shared, request, 1))
        });
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => {
                this.pending = None;
                Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)))
            }
            Poll::Ready(Ok(result)) => {
                this.pending = None;
                if result.done {
                    this.done = true;
                }
                if result.filled == 0 {
                    return Poll::Ready(Ok(0));
                }
                let n = result.filled.min(buf.len());
                buf[..n].copy_from_slice(&result.buffer[..n]);
                if n < result.filled {
                    this.leftover = result.buffer[n..result.filled].to_vec();
                    this.leftover_pos = 0;
                }
                Poll::Ready(Ok(n))
            }
        }
    }
}

// ----------- Builder -----------

pub struct ReadableByteStreamBuilder<Source> {
    source: Source,
    high_water_mark: usize,
    auto_allocate: Option<usize>,
}

impl<Source: ByteSource> ReadableByteStreamBuilder<Source> {
    /// Buffered-byte target for proactive pulling. Zero (the default) pulls
    /// only on demand.
    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = bytes;
        self
    }

    /// Allocate a descriptor of `bytes` for each default read, so the source
    /// can use the in-place path without a BYOB reader.
    pub fn auto_allocate(mut self, bytes: usize) -> Self {
        self.auto_allocate = Some(bytes);
        self
    }

    pub fn spawn<F>(self, spawn_fn: F) -> ReadableByteStream
    where
        F: FnOnce(BoxFuture<'static, ()>),
    {
        let shared = Arc::new(ByteShared {
            inner: Mutex::new(ByteInner {
                state: ByteStreamState::Readable,
                queue: VecDeque::new(),
                queue_total: 0,
                pending_reads: VecDeque::new(),
                pull_intos: VecDeque::new(),
                close_requested: false,
                started: false,
                pulling: false,
                pull_again: false,
                cancel_requested: false,
                cancel_reason: None,
                cancel_completions: Vec::new(),
                stored_error: None,
                auto_allocate: self.auto_allocate,
                high_water_mark: self.high_water_mark,
                closed_wakers: WakerSet::new(),
            }),
            pull_signal: AsyncSignal::new(),
            locked: AtomicBool::new(false),
        });
        let stream = ReadableByteStream {
            shared: Arc::clone(&shared),
        };
        spawn_fn(Box::pin(byte_stream_task(shared, self.source)));
        stream
    }
}

// ----------- Driver task -----------

/// Resolves once a cancel request lands, so a hung pull can be abandoned.
async fn cancel_watch(shared: &Arc<ByteShared>) {
    poll_fn(|cx| {
        let inner = shared.inner.lock();
        if inner.cancel_requested {
            Poll::Ready(())
        } else {
            inner.closed_wakers.register(cx.waker());
            Poll::Pending
        }
    })
    .await
}

async fn byte_stream_task<Source: ByteSource>(shared: Arc<ByteShared>, mut source: Source) {
    let controller = ReadableByteStreamController {
        shared: Arc::clone(&shared),
    };
    if let Err(err) = source.start(&controller).await {
        shared.inner.lock().error_stream(err);
    }
    shared.inner.lock().started = true;

    enum Action {
        Pull,
        Cancel(Option<String>),
        Exit,
        Wait,
    }
    loop {
        let action = {
            let mut inner = shared.inner.lock();
            if let Some(reason) = inner.cancel_reason.take() {
                Action::Cancel(reason)
            } else if inner.state != ByteStreamState::Readable {
                Action::Exit
            } else if !inner.pulling && inner.should_pull() {
                inner.pulling = true;
                Action::Pull
            } else {
                Action::Wait
            }
        };
        match action {
            Action::Cancel(reason) => {
                let result = source.cancel(reason).await;
                let completions: Vec<_> =
                    shared.inner.lock().cancel_completions.drain(..).collect();
                for tx in completions {
                    let _ = tx.send(result.clone());
                }
                return;
            }
            Action::Exit => return,
            Action::Pull => {
                trace!("issuing byte pull");
                let result = {
                    let pull = source.pull(&controller);
                    futures::pin_mut!(pull);
                    let watch = cancel_watch(&shared);
                    futures::pin_mut!(watch);
                    match futures::future::select(pull, watch).await {
                        futures::future::Either::Left((result, _)) => Some(result),
                        // Canceled mid-pull; drop the pull and let the loop
                        // run the source's cancel.
                        futures::future::Either::Right(((), _)) => None,
                    }
                };
                let mut inner = shared.inner.lock();
                inner.pulling = false;
                inner.pull_again = false;
                if let Some(Err(err)) = result {
                    inner.error_stream(err);
                }
            }
            Action::Wait => {
                // Only the driver and its controller hold the state here; no
                // handle is left to create demand.
                if Arc::strong_count(&shared) <= 2 {
                    return;
                }
                shared.pull_signal.wait().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::AsyncReadExt;
    use std::time::Duration;
    use tokio::time::timeout;

    fn spawn_task(fut: BoxFuture<'static, ()>) {
        tokio::spawn(fut);
    }

    /// Emits fixed chunks through the copy path, then closes.
    struct ChunkSource {
        chunks: VecDeque<Vec<u8>>,
    }

    impl ChunkSource {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks: chunks.into(),
            }
        }
    }

    impl ByteSource for ChunkSource {
        async fn pull(&mut self, controller: &ReadableByteStreamController) -> StreamResult<()> {
            match self.chunks.pop_front() {
                Some(chunk) => controller.enqueue(chunk)?,
                None => controller.close()?,
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_reads_deliver_chunks_in_order() {
        let stream =
            ReadableByteStream::builder(ChunkSource::new(vec![vec![1, 2], vec![3], vec![4, 5]]))
                .spawn(spawn_task);
        let reader = stream.get_reader().unwrap();

        assert_eq!(reader.read().await.unwrap(), Some(vec![1, 2]));
        assert_eq!(reader.read().await.unwrap(), Some(vec![3]));
        assert_eq!(reader.read().await.unwrap(), Some(vec![4, 5]));
        assert_eq!(reader.read().await.unwrap(), None);
        reader.closed().await.unwrap();
    }

    #[tokio::test]
    async fn byob_read_fills_caller_buffer() {
        let stream = ReadableByteStream::builder(ChunkSource::new(vec![vec![1, 2, 3, 4, 5]]))
            .spawn(spawn_task);
        let reader = stream.get_byob_reader().unwrap();

        let r = reader.read_into(vec![0; 3]).await.unwrap();
        assert_eq!(r.filled, 3);
        assert!(!r.done);
        assert_eq!(&r.buffer[..3], &[1, 2, 3]);

        let r = reader.read_into(vec![0; 8]).await.unwrap();
        assert_eq!(&r.buffer[..r.filled], &[4, 5]);

        let r = reader.read_into(vec![0; 4]).await.unwrap();
        assert!(r.done);
        assert_eq!(r.filled, 0);
    }

    #[tokio::test]
    async fn element_alignment_commits_only_whole_elements() {
        // 3 bytes then 5 bytes, element size 4: nothing is observable until
        // the boundary is reachable, and every commit is a multiple of 4.
        struct Gated {
            first: Option<Vec<u8>>,
            second: Option<(oneshot::Receiver<()>, Vec<u8>)>,
        }
        impl ByteSource for Gated {
            async fn pull(
                &mut self,
                controller: &ReadableByteStreamController,
            ) -> StreamResult<()> {
                if let Some(chunk) = self.first.take() {
                    controller.enqueue(chunk)?;
                } else if let Some((gate, chunk)) = self.second.take() {
                    let _ = gate.await;
                    controller.enqueue(chunk)?;
                }
                Ok(())
            }
        }

        let (gate_tx, gate_rx) = oneshot::channel();
        let stream = ReadableByteStream::builder(Gated {
            first: Some(vec![1, 2, 3]),
            second: Some((gate_rx, vec![4, 5, 6, 7, 8])),
        })
        .spawn(spawn_task);
        let reader = stream.get_byob_reader().unwrap();

        let shared = Arc::clone(&reader.stream.shared);
        let pending = tokio::spawn(async move { byob_read(shared, vec![0; 4], 4).await });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // 3 bytes buffered, below one element: the read must still be
        // pending.
        assert!(!pending.is_finished());

        gate_tx.send(()).unwrap();
        let r = timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(r.filled, 4);
        assert_eq!(&r.buffer[..4], &[1, 2, 3, 4]);

        // The second element completes from what is already queued.
        let r = reader.read_into_elements(vec![0; 4], 4).await.unwrap();
        assert_eq!(r.filled, 4);
        assert_eq!(&r.buffer[..4], &[5, 6, 7, 8]);
    }

    /// Source that fills descriptors in place via the BYOB request.
    struct RespondingSource {
        script: VecDeque<Vec<u8>>,
    }

    impl ByteSource for RespondingSource {
        async fn pull(&mut self, controller: &ReadableByteStreamController) -> StreamResult<()> {
            let Some(data) = self.script.pop_front() else {
                controller.close()?;
                return Ok(());
            };
            let request = controller
                .byob_request()
                .ok_or(StreamError::InvalidUsage("expected a read buffer"))?;
            request.respond_with(&data)?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn respond_accumulates_until_element_boundary() {
        let stream = ReadableByteStream::builder(RespondingSource {
            script: vec![vec![1, 2], vec![3, 4]].into(),
        })
        .spawn(spawn_task);
        let reader = stream.get_byob_reader().unwrap();

        // Two 2-byte responds accumulate into one 4-byte element.
        let r = timeout(
            Duration::from_secs(1),
            reader.read_into_elements(vec![0; 4], 4),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(r.filled, 4);
        assert_eq!(&r.buffer[..4], &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn respond_carries_unaligned_tail_into_queue() {
        let stream = ReadableByteStream::builder(RespondingSource {
            script: vec![vec![1, 2, 3, 4, 5, 6]].into(),
        })
        .spawn(spawn_task);
        let reader = stream.get_byob_reader().unwrap();

        // 6 bytes into an element-size-4 descriptor: 4 commit, 2 carry over.
        let r = reader.read_into_elements(vec![0; 8], 4).await.unwrap();
        assert_eq!(r.filled, 4);
        assert_eq!(&r.buffer[..4], &[1, 2, 3, 4]);

        let stream = reader.release_lock();
        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(vec![5, 6]));
    }

    #[tokio::test]
    async fn auto_allocate_lets_sources_fill_default_reads_in_place() {
        let stream = ReadableByteStream::builder(RespondingSource {
            script: vec![vec![9, 8, 7]].into(),
        })
        .auto_allocate(64)
        .spawn(spawn_task);
        let reader = stream.get_reader().unwrap();

        assert_eq!(reader.read().await.unwrap(), Some(vec![9, 8, 7]));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_with_partially_filled_descriptor_errors_stream() {
        struct PartialThenClose;
        impl ByteSource for PartialThenClose {
            async fn pull(
                &mut self,
                controller: &ReadableByteStreamController,
            ) -> StreamResult<()> {
                if let Some(request) = controller.byob_request() {
                    // Fill below the element boundary, then close.
                    request.respond_with(&[1])?;
                    let err = controller.close().unwrap_err();
                    assert!(!err.is_usage_error());
                }
                Ok(())
            }
        }

        let stream = ReadableByteStream::builder(PartialThenClose).spawn(spawn_task);
        let reader = stream.get_byob_reader().unwrap();
        let err = reader
            .read_into_elements(vec![0; 4], 4)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("partially filled"));
        assert!(stream.is_errored());
    }

    #[tokio::test]
    async fn byob_read_errors_when_closing_with_unaligned_bytes() {
        struct TwoBytesThenClose {
            done: bool,
        }
        impl ByteSource for TwoBytesThenClose {
            async fn pull(
                &mut self,
                controller: &ReadableByteStreamController,
            ) -> StreamResult<()> {
                if !self.done {
                    self.done = true;
                    controller.enqueue(vec![1, 2])?;
                    controller.close()?;
                }
                Ok(())
            }
        }

        let stream =
            ReadableByteStream::builder(TwoBytesThenClose { done: false }).spawn(spawn_task);
        let reader = stream.get_byob_reader().unwrap();

        // 2 bytes buffered against an element size of 4: the read can never
        // fill and must reject rather than hang.
        let err = timeout(
            Duration::from_secs(1),
            reader.read_into_elements(vec![0; 4], 4),
        )
        .await
        .expect("read must settle")
        .unwrap_err();
        assert!(err.to_string().contains("insufficient bytes"));
        assert!(stream.is_errored());
    }

    #[tokio::test]
    async fn accumulated_responds_commit_aligned_and_carry_remainder() {
        // Two 3-byte responds against element size 4: the first accumulates,
        // the second crosses the boundary. 4 bytes commit, 2 carry over.
        let stream = ReadableByteStream::builder(RespondingSource {
            script: vec![vec![1, 2, 3], vec![4, 5, 6]].into(),
        })
        .spawn(spawn_task);
        let reader = stream.get_byob_reader().unwrap();

        let r = reader.read_into_elements(vec![0; 8], 4).await.unwrap();
        assert_eq!(r.filled, 4);
        assert_eq!(&r.buffer[..4], &[1, 2, 3, 4]);

        let stream = reader.release_lock();
        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(vec![5, 6]));
    }

    #[tokio::test]
    async fn respond_validation_rejects_zero_and_overflow() {
        struct Probe {
            done: bool,
        }
        impl ByteSource for Probe {
            async fn pull(
                &mut self,
                controller: &ReadableByteStreamController,
            ) -> StreamResult<()> {
                if self.done {
                    return Ok(());
                }
                self.done = true;
                let request = controller.byob_request().expect("read pending");
                assert!(matches!(
                    request.respond(0),
                    Err(StreamError::InvalidUsage(_))
                ));
                assert!(matches!(
                    request.respond(5),
                    Err(StreamError::InvalidUsage(_))
                ));
                request.respond_with(&[1, 2, 3, 4])?;
                Ok(())
            }
        }

        let stream = ReadableByteStream::builder(Probe { done: false }).spawn(spawn_task);
        let reader = stream.get_byob_reader().unwrap();
        let r = reader.read_into(vec![0; 4]).await.unwrap();
        assert_eq!(r.filled, 4);
    }

    #[tokio::test]
    async fn cancel_resolves_pending_byob_read_as_done() {
        struct Idle {
            canceled: Arc<Mutex<Option<Option<String>>>>,
        }
        impl ByteSource for Idle {
            async fn pull(
                &mut self,
                _controller: &ReadableByteStreamController,
            ) -> StreamResult<()> {
                futures::future::pending::<()>().await;
                Ok(())
            }
            async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
                *self.canceled.lock() = Some(reason);
                Ok(())
            }
        }

        let canceled = Arc::new(Mutex::new(None));
        let stream = ReadableByteStream::builder(Idle {
            canceled: Arc::clone(&canceled),
        })
        .spawn(spawn_task);
        let reader = stream.get_byob_reader().unwrap();

        let shared = Arc::clone(&reader.stream.shared);
        let read = tokio::spawn(async move { byob_read(shared, vec![0; 4], 1).await });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        reader.cancel(Some("done here".into())).await.unwrap();

        let r = timeout(Duration::from_secs(1), read)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(r.done);
        assert_eq!(r.filled, 0);
        assert_eq!(canceled.lock().clone(), Some(Some("done here".into())));
    }

    #[tokio::test]
    async fn async_read_adapter_reads_to_end() {
        let stream = ReadableByteStream::builder(ChunkSource::new(vec![
            b"hello ".to_vec(),
            b"byte ".to_vec(),
            b"world".to_vec(),
        ]))
        .spawn(spawn_task);
        let mut adapter = stream.get_byob_reader().unwrap().into_async_read();

        let mut out = Vec::new();
        adapter.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello byte world");
    }

    #[tokio::test]
    async fn close_while_byob_read_pending_resolves_done() {
        struct CloseOnSecondPull {
            pulls: usize,
        }
        impl ByteSource for CloseOnSecondPull {
            async fn pull(
                &mut self,
                controller: &ReadableByteStreamController,
            ) -> StreamResult<()> {
                self.pulls += 1;
                if self.pulls == 1 {
                    controller.close()?;
                }
                Ok(())
            }
        }

        let stream =
            ReadableByteStream::builder(CloseOnSecondPull { pulls: 0 }).spawn(spawn_task);
        let reader = stream.get_byob_reader().unwrap();
        let r = timeout(Duration::from_secs(1), reader.read_into(vec![0; 4]))
            .await
            .unwrap()
            .unwrap();
        assert!(r.done);
        assert_eq!(r.filled, 0);
    }
}
