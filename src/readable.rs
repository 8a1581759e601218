//! Producer-side stream: default (opaque chunk) variant.
//!
//! A [`ReadableStream`] is a cheap handle; the state machine lives in a driver
//! task spawned at construction. The driver exclusively owns the caller's
//! [`ReadableSource`] and serializes every `pull`/`cancel` invocation, so at
//! most one pull is ever outstanding (coalesced through the `pull_again`
//! flag). Handles talk to the driver over unbounded command channels with
//! `oneshot` completions.

use crate::{
    error::{StreamError, StreamResult},
    queue::SizedQueue,
    strategy::{BoxedStrategy, CountQueuingStrategy, QueuingStrategy},
    wake::{AsyncSignal, WakerSet},
};
use futures::{
    channel::{
        mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    future::{poll_fn, BoxFuture},
    stream::{Stream, StreamExt},
};
use parking_lot::RwLock;
use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicIsize, Ordering},
        Arc,
    },
    task::Poll,
};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Readable,
    Closed,
    Errored,
}

// ----------- Source trait -----------

/// An external data source driven by the producer controller.
///
/// All methods are invoked by the stream's driver task, never concurrently.
pub trait ReadableSource<T: Send + 'static>: Send + 'static {
    /// Called once before any pull; may enqueue or error synchronously or
    /// asynchronously.
    fn start(
        &mut self,
        controller: &ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + Send {
        let _ = controller;
        futures::future::ready(Ok(()))
    }

    /// Called when more data is wanted; must eventually enqueue, close, or
    /// error.
    fn pull(
        &mut self,
        controller: &ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + Send;

    /// Called at most once per stream, when the reader cancels.
    fn cancel(&mut self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> + Send {
        let _ = reason;
        futures::future::ready(Ok(()))
    }
}

// ----------- Shared handle state -----------

/// Flags mirrored out of the driver so handles can answer state queries
/// without a channel round-trip.
pub(crate) struct SharedFlags {
    pub closed: AtomicBool,
    pub errored: AtomicBool,
    pub close_requested: AtomicBool,
    pub locked: AtomicBool,
    pub desired_size: AtomicIsize,
    pub stored_error: RwLock<Option<StreamError>>,
}

impl SharedFlags {
    pub fn new(high_water_mark: usize) -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            desired_size: AtomicIsize::new(high_water_mark as isize),
            stored_error: RwLock::new(None),
        })
    }

    pub fn stored_error(&self) -> StreamError {
        self.stored_error
            .read()
            .clone()
            .unwrap_or(StreamError::Closed)
    }
}

// ----------- Messages -----------

enum StreamCommand<T> {
    Read {
        completion: oneshot::Sender<StreamResult<Option<T>>>,
    },
    Cancel {
        reason: Option<String>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    RegisterClosedWaker {
        waker: std::task::Waker,
    },
}

enum ControllerMsg<T> {
    Enqueue { chunk: T },
    Close,
    Error(StreamError),
}

// ----------- Controller -----------

/// Handle given to the source for feeding the stream.
pub struct ReadableStreamDefaultController<T: Send + 'static> {
    tx: UnboundedSender<ControllerMsg<T>>,
    flags: Arc<SharedFlags>,
}

impl<T: Send + 'static> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            flags: Arc::clone(&self.flags),
        }
    }
}

impl<T: Send + 'static> ReadableStreamDefaultController<T> {
    /// `high_water_mark - queued size`, or `None` once the stream can no
    /// longer accept chunks.
    pub fn desired_size(&self) -> Option<isize> {
        if self.flags.closed.load(Ordering::SeqCst) || self.flags.errored.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.flags.desired_size.load(Ordering::SeqCst))
    }

    /// Feed a chunk to the stream. Fails once close has been requested or the
    /// stream is no longer readable.
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        if self.flags.close_requested.load(Ordering::SeqCst) {
            return Err(StreamError::InvalidUsage("enqueue after close requested"));
        }
        if self.flags.errored.load(Ordering::SeqCst) {
            return Err(self.flags.stored_error());
        }
        if self.flags.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        self.tx
            .unbounded_send(ControllerMsg::Enqueue { chunk })
            .map_err(|_| StreamError::TaskDropped)?;
        Ok(())
    }

    /// Request a close. The stream closes once the queue drains.
    pub fn close(&self) -> StreamResult<()> {
        if self.flags.close_requested.swap(true, Ordering::SeqCst) {
            return Err(StreamError::InvalidUsage("close already requested"));
        }
        self.tx
            .unbounded_send(ControllerMsg::Close)
            .map_err(|_| StreamError::TaskDropped)?;
        Ok(())
    }

    /// Error the stream. Fatal: all pending and future reads reject with
    /// `error`.
    pub fn error(&self, error: StreamError) -> StreamResult<()> {
        self.tx
            .unbounded_send(ControllerMsg::Error(error))
            .map_err(|_| StreamError::TaskDropped)?;
        Ok(())
    }
}

// ----------- Stream handle -----------

/// Producer-side stream handle.
pub struct ReadableStream<T: Send + 'static> {
    command_tx: UnboundedSender<StreamCommand<T>>,
    flags: Arc<SharedFlags>,
}

impl<T: Send + 'static> Clone for ReadableStream<T> {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
            flags: Arc::clone(&self.flags),
        }
    }
}

impl<T: Send + 'static> ReadableStream<T> {
    pub fn builder<Source: ReadableSource<T>>(source: Source) -> ReadableStreamBuilder<T, Source> {
        ReadableStreamBuilder {
            source,
            strategy: Box::new(CountQueuingStrategy::new(1)),
        }
    }

    pub fn locked(&self) -> bool {
        self.flags.locked.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::SeqCst)
    }

    pub fn is_errored(&self) -> bool {
        self.flags.errored.load(Ordering::SeqCst)
    }

    pub fn desired_size(&self) -> Option<isize> {
        if self.is_closed() || self.is_errored() {
            return None;
        }
        Some(self.flags.desired_size.load(Ordering::SeqCst))
    }

    /// Attach the stream's single reader. Fails if one is already attached.
    pub fn get_reader(&self) -> StreamResult<ReadableStreamDefaultReader<T>> {
        if self
            .flags
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StreamError::LockContended);
        }
        Ok(ReadableStreamDefaultReader {
            stream: self.clone(),
        })
    }

    /// Cancel an unlocked stream.
    pub async fn cancel(&self, reason: Option<String>) -> StreamResult<()> {
        if self.locked() {
            return Err(StreamError::InvalidUsage("cancel on a locked stream"));
        }
        cancel_inner(&self.command_tx, reason).await
    }
}

impl<T: Send + 'static> ReadableStream<T> {
    pub fn from_iter<I>(iter: I) -> ReadableStreamBuilder<T, IteratorSource<I>>
    where
        I: Iterator<Item = T> + Send + 'static,
    {
        Self::builder(IteratorSource { iter })
    }

    pub fn from_stream<S>(stream: S) -> ReadableStreamBuilder<T, AsyncStreamSource<S>>
    where
        S: Stream<Item = T> + Unpin + Send + 'static,
    {
        Self::builder(AsyncStreamSource { stream })
    }
}

async fn cancel_inner<T>(
    command_tx: &UnboundedSender<StreamCommand<T>>,
    reason: Option<String>,
) -> StreamResult<()> {
    let (tx, rx) = oneshot::channel();
    command_tx
        .unbounded_send(StreamCommand::Cancel {
            reason,
            completion: tx,
        })
        .map_err(|_| StreamError::TaskDropped)?;
    rx.await.unwrap_or(Err(StreamError::TaskDropped))
}

// ----------- Builder -----------

pub struct ReadableStreamBuilder<T: Send + 'static, Source> {
    source: Source,
    strategy: BoxedStrategy<T>,
}

impl<T, Source> ReadableStreamBuilder<T, Source>
where
    T: Send + 'static,
    Source: ReadableSource<T>,
{
    pub fn strategy(mut self, strategy: impl QueuingStrategy<T>) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    /// Spawn the driver task with the given executor hook and return the
    /// stream handle.
    pub fn spawn<F>(self, spawn_fn: F) -> ReadableStream<T>
    where
        F: FnOnce(BoxFuture<'static, ()>),
    {
        let (command_tx, command_rx) = unbounded();
        let (ctrl_tx, ctrl_rx) = unbounded();
        let flags = SharedFlags::new(self.strategy.high_water_mark());

        let controller = ReadableStreamDefaultController {
            tx: ctrl_tx,
            flags: Arc::clone(&flags),
        };
        let inner = ReadableInner {
            state: StreamState::Readable,
            queue: SizedQueue::new(),
            strategy: self.strategy,
            source: Some(self.source),
            started: false,
            pulling: false,
            pull_again: false,
            close_requested: false,
            cancel_requested: false,
            cancel_reason: None,
            cancel_completions: Vec::new(),
            pending_reads: VecDeque::new(),
            stored_error: None,
            closed_wakers: WakerSet::new(),
        };

        let stream = ReadableStream {
            command_tx,
            flags: Arc::clone(&flags),
        };
        spawn_fn(Box::pin(readable_stream_task(
            command_rx, ctrl_rx, inner, flags, controller,
        )));
        stream
    }
}

// ----------- Reader -----------

/// Exclusive reading handle. Dropping it releases the stream's lock.
pub struct ReadableStreamDefaultReader<T: Send + 'static> {
    stream: ReadableStream<T>,
}

impl<T: Send + 'static> ReadableStreamDefaultReader<T> {
    /// Read the next chunk; `Ok(None)` signals a clean close.
    pub async fn read(&self) -> StreamResult<Option<T>> {
        let (tx, rx) = oneshot::channel();
        self.stream
            .command_tx
            .unbounded_send(StreamCommand::Read { completion: tx })
            .map_err(|_| StreamError::TaskDropped)?;
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }

    /// Resolves when the stream closes; rejects with the stored error if it
    /// errors instead.
    pub async fn closed(&self) -> StreamResult<()> {
        poll_fn(|cx| {
            if self.stream.flags.errored.load(Ordering::SeqCst) {
                return Poll::Ready(Err(self.stream.flags.stored_error()));
            }
            if self.stream.flags.closed.load(Ordering::SeqCst) {
                return Poll::Ready(Ok(()));
            }
            if self
                .stream
                .command_tx
                .unbounded_send(StreamCommand::RegisterClosedWaker {
                    waker: cx.waker().clone(),
                })
                .is_err()
            {
                return Poll::Ready(Err(StreamError::TaskDropped));
            }
            Poll::Pending
        })
        .await
    }

    pub async fn cancel(&self, reason: Option<String>) -> StreamResult<()> {
        cancel_inner(&self.stream.command_tx, reason).await
    }

    /// Release the lock, making the stream acquirable again.
    pub fn release_lock(self) -> ReadableStream<T> {
        let stream = self.stream.clone();
        drop(self);
        stream
    }

    /// Adapt the reader into a [`futures::Stream`] of chunks.
    pub fn into_stream(self) -> impl Stream<Item = StreamResult<T>> + Send
    where
        T: Send,
    {
        futures::stream::unfold(Some(self), |state| async move {
            let reader = state?;
            match reader.read().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl<T: Send + 'static> Drop for ReadableStreamDefaultReader<T> {
    fn drop(&mut self) {
        self.stream.flags.locked.store(false, Ordering::SeqCst);
    }
}

// ----------- Adapter sources -----------

pub struct IteratorSource<I> {
    iter: I,
}

impl<I, T> ReadableSource<T> for IteratorSource<I>
where
    I: Iterator<Item = T> + Send + 'static,
    T: Send + 'static,
{
    async fn pull(&mut self, controller: &ReadableStreamDefaultController<T>) -> StreamResult<()> {
        match self.iter.next() {
            Some(item) => controller.enqueue(item)?,
            None => controller.close()?,
        }
        Ok(())
    }
}

pub struct AsyncStreamSource<S> {
    stream: S,
}

impl<S, T> ReadableSource<T> for AsyncStreamSource<S>
where
    S: Stream<Item = T> + Unpin + Send + 'static,
    T: Send + 'static,
{
    async fn pull(&mut self, controller: &ReadableStreamDefaultController<T>) -> StreamResult<()> {
        match self.stream.next().await {
            Some(item) => controller.enqueue(item)?,
            None => controller.close()?,
        }
        Ok(())
    }
}

// ----------- Driver task -----------

struct ReadableInner<T, Source> {
    state: StreamState,
    queue: SizedQueue<T>,
    strategy: BoxedStrategy<T>,
    source: Option<Source>,
    started: bool,
    pulling: bool,
    pull_again: bool,
    close_requested: bool,
    cancel_requested: bool,
    cancel_reason: Option<Option<String>>,
    cancel_completions: Vec<oneshot::Sender<StreamResult<()>>>,
    pending_reads: VecDeque<oneshot::Sender<StreamResult<Option<T>>>>,
    stored_error: Option<StreamError>,
    closed_wakers: WakerSet,
}

impl<T: Send + 'static, Source> ReadableInner<T, Source> {
    fn stored_error(&self) -> StreamError {
        self.stored_error.clone().unwrap_or(StreamError::Closed)
    }

    fn desired_size(&self) -> isize {
        if self.state != StreamState::Readable {
            return 0;
        }
        self.strategy.high_water_mark() as isize - self.queue.total_size() as isize
    }

    fn publish_desired_size(&self, flags: &SharedFlags) {
        flags
            .desired_size
            .store(self.desired_size(), Ordering::SeqCst);
    }

    /// Pull-scheduling predicate: the stream still wants data and may accept
    /// it.
    fn should_pull(&self) -> bool {
        self.state == StreamState::Readable
            && self.started
            && !self.close_requested
            && !self.cancel_requested
            && (!self.pending_reads.is_empty() || self.desired_size() > 0)
    }

    fn finish_close(&mut self, flags: &SharedFlags) {
        debug_assert_eq!(self.state, StreamState::Readable);
        self.state = StreamState::Closed;
        flags.closed.store(true, Ordering::SeqCst);
        flags.desired_size.store(0, Ordering::SeqCst);
        while let Some(tx) = self.pending_reads.pop_front() {
            let _ = tx.send(Ok(None));
        }
        self.closed_wakers.wake_all();
        trace!("readable stream closed");
    }

    fn error_stream(&mut self, flags: &SharedFlags, err: StreamError) {
        if self.state != StreamState::Readable {
            return;
        }
        debug!(error = %err, "readable stream errored");
        self.state = StreamState::Errored;
        self.stored_error = Some(err.clone());
        *flags.stored_error.write() = Some(err.clone());
        flags.errored.store(true, Ordering::SeqCst);
        flags.desired_size.store(0, Ordering::SeqCst);
        self.queue.reset();
        while let Some(tx) = self.pending_reads.pop_front() {
            let _ = tx.send(Err(err.clone()));
        }
        self.closed_wakers.wake_all();
    }
}

async fn readable_stream_task<T, Source>(
    mut command_rx: UnboundedReceiver<StreamCommand<T>>,
    mut ctrl_rx: UnboundedReceiver<ControllerMsg<T>>,
    mut inner: ReadableInner<T, Source>,
    flags: Arc<SharedFlags>,
    controller: ReadableStreamDefaultController<T>,
) where
    T: Send + 'static,
    Source: ReadableSource<T>,
{
    // start() runs to completion before any command is processed; commands
    // issued meanwhile buffer in the channel.
    if let Some(mut source) = inner.source.take() {
        match source.start(&controller).await {
            Ok(()) => inner.source = Some(source),
            Err(err) => inner.error_stream(&flags, err),
        }
    }
    inner.started = true;

    // Pull futures own the source; abandoning one on cancel must still hand
    // the source back, so each pull races against this signal internally.
    let cancel_signal = AsyncSignal::new();
    let mut pull_future: Option<BoxFuture<'static, (Source, Option<StreamResult<()>>)>> = None;
    let mut cancel_future: Option<BoxFuture<'static, StreamResult<()>>> = None;
    let mut commands_done = false;

    poll_fn(|cx| {
        // Controller messages first: they carry the data that unblocks reads.
        while let Poll::Ready(Some(msg)) = ctrl_rx.poll_next_unpin(cx) {
            match msg {
                ControllerMsg::Enqueue { chunk } => {
                    if inner.state != StreamState::Readable {
                        continue;
                    }
                    if let Some(tx) = inner.pending_reads.pop_front() {
                        // Fast path: bypass the queue, no size computation.
                        let _ = tx.send(Ok(Some(chunk)));
                    } else {
                        match inner.strategy.size(&chunk) {
                            Ok(size) => {
                                inner.queue.push(chunk, size);
                                inner.publish_desired_size(&flags);
                            }
                            Err(err) => inner.error_stream(&flags, err),
                        }
                    }
                }
                ControllerMsg::Close => {
                    if inner.state == StreamState::Readable && !inner.close_requested {
                        inner.close_requested = true;
                        if inner.queue.is_empty() {
                            inner.finish_close(&flags);
                        }
                    }
                }
                ControllerMsg::Error(err) => inner.error_stream(&flags, err),
            }
        }

        loop {
            match command_rx.poll_next_unpin(cx) {
                Poll::Ready(Some(cmd)) => match cmd {
                    StreamCommand::Read { completion } => match inner.state {
                        StreamState::Errored => {
                            let _ = completion.send(Err(inner.stored_error()));
                        }
                        StreamState::Closed => {
                            let _ = completion.send(Ok(None));
                        }
                        StreamState::Readable => {
                            if let Some(entry) = inner.queue.pop() {
                                inner.publish_desired_size(&flags);
                                if inner.close_requested && inner.queue.is_empty() {
                                    inner.finish_close(&flags);
                                }
                                let _ = completion.send(Ok(Some(entry.value)));
                            } else {
                                inner.pending_reads.push_back(completion);
                            }
                        }
                    },
                    StreamCommand::Cancel { reason, completion } => match inner.state {
                        StreamState::Closed => {
                            let _ = completion.send(Ok(()));
                        }
                        StreamState::Errored => {
                            let _ = completion.send(Err(inner.stored_error()));
                        }
                        StreamState::Readable => {
                            if inner.cancel_requested {
                                inner.cancel_completions.push(completion);
                            } else {
                                trace!("readable stream cancel requested");
                                inner.cancel_requested = true;
                                inner.cancel_completions.push(completion);
                                inner.queue.reset();
                                inner.finish_close(&flags);
                                match inner.source.take() {
                                    Some(mut source) => {
                                        cancel_future = Some(Box::pin(async move {
                                            source.cancel(reason).await
                                        }));
                                    }
                                    // A pull owns the source; interrupt it
                                    // and run the cancel once it hands the
                                    // source back.
                                    None => {
                                        inner.cancel_reason = Some(reason);
                                        cancel_signal.signal();
                                    }
                                }
                            }
                        }
                    },
                    StreamCommand::RegisterClosedWaker { waker } => {
                        inner.closed_wakers.register(&waker);
                        if inner.state != StreamState::Readable {
                            inner.closed_wakers.wake_all();
                        }
                    }
                },
                Poll::Ready(None) => {
                    commands_done = true;
                    break;
                }
                Poll::Pending => break,
            }
        }

        if let Some(fut) = &mut cancel_future {
            if let Poll::Ready(result) = fut.as_mut().poll(cx) {
                for tx in inner.cancel_completions.drain(..) {
                    let _ = tx.send(result.clone());
                }
                cancel_future = None;
                cx.waker().wake_by_ref();
            }
        }

        // Pull scheduling: coalesce while a pull is in flight, otherwise
        // issue one.
        if pull_future.is_some() {
            if inner.should_pull() {
                inner.pull_again = true;
            }
        } else if !inner.pulling && inner.should_pull() {
            if let Some(source) = inner.source.take() {
                inner.pulling = true;
                trace!("issuing pull");
                let controller = controller.clone();
                let interrupt = cancel_signal.clone();
                pull_future = Some(Box::pin(async move {
                    let mut source = source;
                    let result = {
                        let pull = source.pull(&controller);
                        futures::pin_mut!(pull);
                        let watch = interrupt.wait();
                        futures::pin_mut!(watch);
                        match futures::future::select(pull, watch).await {
                            futures::future::Either::Left((result, _)) => Some(result),
                            futures::future::Either::Right(((), _)) => None,
                        }
                    };
                    (source, result)
                }));
            }
        }

        if let Some(fut) = &mut pull_future {
            if let Poll::Ready((source, result)) = fut.as_mut().poll(cx) {
                inner.pulling = false;
                inner.source = Some(source);
                if let Some(Err(err)) = result {
                    inner.error_stream(&flags, err);
                }
                if inner.cancel_requested && cancel_future.is_none() {
                    if let (Some(mut source), Some(reason)) =
                        (inner.source.take(), inner.cancel_reason.take())
                    {
                        cancel_future =
                            Some(Box::pin(async move { source.cancel(reason).await }));
                    }
                }
                if inner.pull_again {
                    inner.pull_again = false;
                }
                pull_future = None;
                cx.waker().wake_by_ref();
            }
        }

        if commands_done && pull_future.is_none() && cancel_future.is_none() {
            return Poll::Ready(());
        }
        Poll::Pending
    })
    .await;
}
