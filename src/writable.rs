//! Consumer-side stream.
//!
//! Mirrors the producer side's architecture: a cheap [`WritableStream`] handle
//! and a driver task that exclusively owns the caller's [`WritableSink`].
//! The driver serializes every sink invocation; `write`, `close`, and `abort`
//! never overlap. A close request travels through the write queue as a
//! sentinel so all prior writes flush first.
//!
//! States: `Writable -> Erroring -> Errored` and `Writable -> Closed`.
//! `Erroring` exists so an in-flight sink operation can settle before the
//! stream commits to `Errored`.

use crate::{
    error::{StreamError, StreamResult},
    queue::SizedQueue,
    strategy::{BoxedStrategy, CountQueuingStrategy, QueuingStrategy},
    wake::WakerSet,
};
use futures::{
    channel::{
        mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    future::{poll_fn, BoxFuture},
    stream::StreamExt,
};
use parking_lot::RwLock;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicIsize, Ordering},
        Arc,
    },
    task::Poll,
};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritableState {
    Writable,
    Erroring,
    Closed,
    Errored,
}

// ----------- Sink trait -----------

/// An external data sink driven by the consumer stream's driver task.
///
/// Invocations are strictly serialized: a new `write` starts only after the
/// previous one settled, and `close`/`abort` never overlap a write.
pub trait WritableSink<T: Send + 'static>: Send + 'static {
    fn start(
        &mut self,
        controller: &WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + Send {
        let _ = controller;
        futures::future::ready(Ok(()))
    }

    fn write(
        &mut self,
        chunk: T,
        controller: &WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + Send;

    /// Flush and release resources after the last write.
    fn close(&mut self) -> impl Future<Output = StreamResult<()>> + Send {
        futures::future::ready(Ok(()))
    }

    /// Dispose abruptly. Called at most once, and never after `close`
    /// succeeded.
    fn abort(&mut self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> + Send {
        let _ = reason;
        futures::future::ready(Ok(()))
    }
}

// ----------- Shared handle state -----------

pub(crate) struct WritableFlags {
    pub closed: AtomicBool,
    pub errored: AtomicBool,
    pub erroring: AtomicBool,
    pub close_requested: AtomicBool,
    pub locked: AtomicBool,
    pub backpressure: AtomicBool,
    pub desired_size: AtomicIsize,
    pub stored_error: RwLock<Option<StreamError>>,
}

impl WritableFlags {
    fn new(high_water_mark: usize) -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            erroring: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            backpressure: AtomicBool::new(high_water_mark == 0),
            desired_size: AtomicIsize::new(high_water_mark as isize),
            stored_error: RwLock::new(None),
        })
    }

    fn stored_error(&self) -> StreamError {
        self.stored_error
            .read()
            .clone()
            .unwrap_or(StreamError::Closed)
    }
}

// ----------- Messages -----------

enum WriteCommand<T> {
    Write {
        chunk: T,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Close {
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Abort {
        reason: Option<String>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    RegisterReadyWaker {
        waker: std::task::Waker,
    },
    RegisterClosedWaker {
        waker: std::task::Waker,
    },
}

enum SinkCtrlMsg {
    Error(StreamError),
}

// ----------- Controller -----------

/// Handle given to the sink; lets it error the stream from inside a callback.
#[derive(Clone)]
pub struct WritableStreamDefaultController {
    tx: UnboundedSender<SinkCtrlMsg>,
}

impl WritableStreamDefaultController {
    pub fn error(&self, error: StreamError) -> StreamResult<()> {
        self.tx
            .unbounded_send(SinkCtrlMsg::Error(error))
            .map_err(|_| StreamError::TaskDropped)?;
        Ok(())
    }
}

// ----------- Stream handle -----------

/// Consumer-side stream handle.
pub struct WritableStream<T: Send + 'static> {
    command_tx: UnboundedSender<WriteCommand<T>>,
    flags: Arc<WritableFlags>,
}

impl<T: Send + 'static> Clone for WritableStream<T> {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
            flags: Arc::clone(&self.flags),
        }
    }
}

impl<T: Send + 'static> WritableStream<T> {
    pub fn builder<Sink: WritableSink<T>>(sink: Sink) -> WritableStreamBuilder<T, Sink> {
        WritableStreamBuilder {
            sink,
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

    /// True from the close request until the stream settles.
    pub fn is_closing(&self) -> bool {
        self.flags.close_requested.load(Ordering::SeqCst) && !self.is_closed() && !self.is_errored()
    }

    /// Attach the stream's single writer. Fails if one is already attached.
    pub fn get_writer(&self) -> StreamResult<WritableStreamDefaultWriter<T>> {
        if self
            .flags
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StreamError::LockContended);
        }
        Ok(WritableStreamDefaultWriter {
            stream: self.clone(),
        })
    }

    /// Abort an unlocked stream.
    pub async fn abort(&self, reason: Option<String>) -> StreamResult<()> {
        if self.locked() {
            return Err(StreamError::InvalidUsage("abort on a locked stream"));
        }
        abort_inner(&self.command_tx, reason).await
    }
}

async fn abort_inner<T>(
    command_tx: &UnboundedSender<WriteCommand<T>>,
    reason: Option<String>,
) -> StreamResult<()> {
    let (tx, rx) = oneshot::channel();
    command_tx
        .unbounded_send(WriteCommand::Abort {
            reason,
            completion: tx,
        })
        .map_err(|_| StreamError::TaskDropped)?;
    rx.await.unwrap_or(Err(StreamError::TaskDropped))
}

// ----------- Builder -----------

pub struct WritableStreamBuilder<T: Send + 'static, Sink> {
    sink: Sink,
    strategy: BoxedStrategy<T>,
}

impl<T, Sink> WritableStreamBuilder<T, Sink>
where
    T: Send + 'static,
    Sink: WritableSink<T>,
{
    pub fn strategy(mut self, strategy: impl QueuingStrategy<T>) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    pub fn spawn<F>(self, spawn_fn: F) -> WritableStream<T>
    where
        F: FnOnce(BoxFuture<'static, ()>),
    {
        let (command_tx, command_rx) = unbounded();
        let (ctrl_tx, ctrl_rx) = unbounded();
        let flags = WritableFlags::new(self.strategy.high_water_mark());

        let controller = WritableStreamDefaultController { tx: ctrl_tx };
        let inner = WritableInner {
            state: WritableState::Writable,
            queue: SizedQueue::new(),
            strategy: self.strategy,
            close_requested: false,
            close_completions: Vec::new(),
            pending_abort: None,
            in_flight_size: 0,
            stored_error: None,
            ready_wakers: WakerSet::new(),
            closed_wakers: WakerSet::new(),
        };

        let stream = WritableStream {
            command_tx,
            flags: Arc::clone(&flags),
        };
        spawn_fn(Box::pin(writable_stream_task(
            command_rx, ctrl_rx, self.sink, inner, flags, controller,
        )));
        stream
    }
}

// ----------- Writer -----------

/// Exclusive writing handle. Dropping it releases the stream's lock.
pub struct WritableStreamDefaultWriter<T: Send + 'static> {
    stream: WritableStream<T>,
}

impl<T: Send + 'static> WritableStreamDefaultWriter<T> {
    /// Queue a chunk; resolves once the sink accepted it.
    ///
    /// The chunk is handed to the stream when `write` is called, not when
    /// the returned future is first polled, so a caller may hold the future
    /// while doing other work without withholding the chunk.
    pub fn write(&self, chunk: T) -> impl Future<Output = StreamResult<()>> + Send {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .stream
            .command_tx
            .unbounded_send(WriteCommand::Write {
                chunk,
                completion: tx,
            })
            .is_ok();
        async move {
            if !sent {
                return Err(StreamError::TaskDropped);
            }
            rx.await.unwrap_or(Err(StreamError::TaskDropped))
        }
    }

    /// Flush queued writes, then close the sink.
    pub async fn close(&self) -> StreamResult<()> {
        let (tx, rx) = oneshot::channel();
        self.stream
            .command_tx
            .unbounded_send(WriteCommand::Close { completion: tx })
            .map_err(|_| StreamError::TaskDropped)?;
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }

    pub async fn abort(&self, reason: Option<String>) -> StreamResult<()> {
        abort_inner(&self.stream.command_tx, reason).await
    }

    /// `high_water_mark - queued size`. `None` once the stream errored,
    /// `Some(0)` once it closed.
    pub fn desired_size(&self) -> Option<isize> {
        if self.stream.is_errored() {
            return None;
        }
        if self.stream.is_closed() {
            return Some(0);
        }
        Some(self.stream.flags.desired_size.load(Ordering::SeqCst))
    }

    /// Resolves when backpressure is off; rejects once the stream errors.
    pub async fn ready(&self) -> StreamResult<()> {
        let flags = &self.stream.flags;
        poll_fn(|cx| {
            if flags.errored.load(Ordering::SeqCst) || flags.erroring.load(Ordering::SeqCst) {
                return Poll::Ready(Err(flags.stored_error()));
            }
            if flags.closed.load(Ordering::SeqCst) || !flags.backpressure.load(Ordering::SeqCst) {
                return Poll::Ready(Ok(()));
            }
            if self
                .stream
                .command_tx
                .unbounded_send(WriteCommand::RegisterReadyWaker {
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

    /// Resolves on clean close, rejects once the stream errors.
    pub async fn closed(&self) -> StreamResult<()> {
        let flags = &self.stream.flags;
        poll_fn(|cx| {
            if flags.errored.load(Ordering::SeqCst) {
                return Poll::Ready(Err(flags.stored_error()));
            }
            if flags.closed.load(Ordering::SeqCst) {
                return Poll::Ready(Ok(()));
            }
            if self
                .stream
                .command_tx
                .unbounded_send(WriteCommand::RegisterClosedWaker {
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

    pub fn release_lock(self) -> WritableStream<T> {
        let stream = self.stream.clone();
        drop(self);
        stream
    }
}

impl<T: Send + 'static> Drop for WritableStreamDefaultWriter<T> {
    fn drop(&mut self) {
        self.stream.flags.locked.store(false, Ordering::SeqCst);
    }
}

// ----------- Driver task -----------

enum WriteOp<T> {
    Chunk {
        chunk: T,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    // Close sentinel: flush barrier, size 0.
    Close,
}

enum InFlight<Sink> {
    Idle(Sink),
    Write {
        future: BoxFuture<'static, (Sink, StreamResult<()>)>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Close(BoxFuture<'static, (Sink, StreamResult<()>)>),
    Abort(BoxFuture<'static, (Sink, StreamResult<()>)>),
    // Transient placeholder while an operation is being constructed.
    Gone,
}

struct PendingAbort {
    reason: Option<String>,
    was_already_erroring: bool,
    completions: Vec<oneshot::Sender<StreamResult<()>>>,
}

struct WritableInner<T> {
    state: WritableState,
    queue: SizedQueue<WriteOp<T>>,
    strategy: BoxedStrategy<T>,
    close_requested: bool,
    close_completions: Vec<oneshot::Sender<StreamResult<()>>>,
    pending_abort: Option<PendingAbort>,
    // Size of the chunk currently at the sink; still counts toward
    // backpressure until the write settles.
    in_flight_size: usize,
    stored_error: Option<StreamError>,
    ready_wakers: WakerSet,
    closed_wakers: WakerSet,
}

impl<T: Send + 'static> WritableInner<T> {
    fn stored_error(&self) -> StreamError {
        self.stored_error.clone().unwrap_or(StreamError::Closed)
    }

    fn desired_size(&self) -> isize {
        self.strategy.high_water_mark() as isize
            - (self.queue.total_size() + self.in_flight_size) as isize
    }

    fn update_backpressure(&self, flags: &WritableFlags) {
        let desired = self.desired_size();
        flags.desired_size.store(desired, Ordering::SeqCst);
        let backpressure = desired <= 0;
        let was = flags.backpressure.swap(backpressure, Ordering::SeqCst);
        if was && !backpressure {
            trace!("backpressure released");
            self.ready_wakers.wake_all();
        }
    }

    /// Enter `Erroring`. The commit to `Errored` happens once no sink
    /// operation is in flight.
    fn start_erroring(&mut self, flags: &WritableFlags, err: StreamError) {
        debug_assert_eq!(self.state, WritableState::Writable);
        debug!(error = %err, "writable stream erroring");
        self.state = WritableState::Erroring;
        self.stored_error = Some(err.clone());
        *flags.stored_error.write() = Some(err);
        flags.erroring.store(true, Ordering::SeqCst);
        // Pending ready() futures reject against the stored error.
        self.ready_wakers.wake_all();
    }

    /// Commit to `Errored`: drop the queue, reject everything outstanding,
    /// and, if an abort is pending, hand back the sink abort future to run.
    fn finish_erroring<Sink>(
        &mut self,
        flags: &WritableFlags,
        sink: Sink,
    ) -> Option<BoxFuture<'static, (Sink, StreamResult<()>)>>
    where
        Sink: WritableSink<T>,
    {
        debug_assert_eq!(self.state, WritableState::Erroring);
        self.state = WritableState::Errored;
        flags.errored.store(true, Ordering::SeqCst);
        flags.erroring.store(false, Ordering::SeqCst);

        let err = self.stored_error();
        for op in self.queue.reset() {
            if let WriteOp::Chunk { completion, .. } = op.value {
                let _ = completion.send(Err(err.clone()));
            }
        }
        self.in_flight_size = 0;
        self.ready_wakers.wake_all();

        match self.pending_abort.take() {
            Some(abort) if !abort.was_already_erroring => {
                let mut sink = sink;
                let reason = abort.reason;
                self.pending_abort = Some(PendingAbort {
                    reason: None,
                    was_already_erroring: false,
                    completions: abort.completions,
                });
                Some(Box::pin(async move {
                    let result = sink.abort(reason).await;
                    (sink, result)
                }))
            }
            Some(abort) => {
                // The stream was already erroring when abort arrived; the
                // abort reports the original error and the sink's abort
                // callback is skipped.
                for tx in abort.completions {
                    let _ = tx.send(Err(err.clone()));
                }
                self.reject_close_and_closed();
                None
            }
            None => {
                self.reject_close_and_closed();
                None
            }
        }
    }

    fn reject_close_and_closed(&mut self) {
        let err = self.stored_error();
        for tx in self.close_completions.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
        self.closed_wakers.wake_all();
    }

    fn finish_close(&mut self, flags: &WritableFlags) {
        trace!("writable stream closed");
        self.state = WritableState::Closed;
        flags.closed.store(true, Ordering::SeqCst);
        flags.erroring.store(false, Ordering::SeqCst);
        self.stored_error = None;
        *flags.stored_error.write() = None;
        if let Some(abort) = self.pending_abort.take() {
            // Close won the race; the abort is a no-op that succeeds.
            for tx in abort.completions {
                let _ = tx.send(Ok(()));
            }
        }
        for tx in self.close_completions.drain(..) {
            let _ = tx.send(Ok(()));
        }
        self.ready_wakers.wake_all();
        self.closed_wakers.wake_all();
    }
}

async fn writable_stream_task<T, Sink>(
    mut command_rx: UnboundedReceiver<WriteCommand<T>>,
    mut ctrl_rx: UnboundedReceiver<SinkCtrlMsg>,
    mut sink: Sink,
    mut inner: WritableInner<T>,
    flags: Arc<WritableFlags>,
    controller: WritableStreamDefaultController,
) where
    T: Send + 'static,
    Sink: WritableSink<T>,
{
    if let Err(err) = sink.start(&controller).await {
        inner.start_erroring(&flags, err);
    }

    let mut in_flight = InFlight::Idle(sink);
    let mut commands_done = false;

    poll_fn(|cx| {
        while let Poll::Ready(Some(msg)) = ctrl_rx.poll_next_unpin(cx) {
            match msg {
                SinkCtrlMsg::Error(err) => {
                    if inner.state == WritableState::Writable {
                        inner.start_erroring(&flags, err);
                    }
                }
            }
        }

        loop {
            match command_rx.poll_next_unpin(cx) {
                Poll::Ready(Some(cmd)) => match cmd {
                    WriteCommand::Write { chunk, completion } => match inner.state {
                        WritableState::Errored | WritableState::Erroring => {
                            let _ = completion.send(Err(inner.stored_error()));
                        }
                        WritableState::Closed => {
                            let _ = completion.send(Err(StreamError::Closed));
                        }
                        WritableState::Writable if inner.close_requested => {
                            let _ = completion.send(Err(StreamError::Closing));
                        }
                        WritableState::Writable => match inner.strategy.size(&chunk) {
                            Ok(size) => {
                                inner.queue.push(WriteOp::Chunk { chunk, completion }, size);
                                inner.update_backpressure(&flags);
                            }
                            Err(err) => {
                                let _ = completion.send(Err(err.clone()));
                                inner.start_erroring(&flags, err);
                            }
                        },
                    },
                    WriteCommand::Close { completion } => match inner.state {
                        WritableState::Errored | WritableState::Erroring => {
                            let _ = completion.send(Err(inner.stored_error()));
                        }
                        _ if inner.close_requested || inner.state == WritableState::Closed => {
                            let _ = completion
                                .send(Err(StreamError::InvalidUsage("close already requested")));
                        }
                        _ => {
                            trace!("writable stream close requested");
                            inner.close_requested = true;
                            flags.close_requested.store(true, Ordering::SeqCst);
                            inner.close_completions.push(completion);
                            inner.queue.push(WriteOp::Close, 0);
                        }
                    },
                    WriteCommand::Abort { reason, completion } => match inner.state {
                        WritableState::Closed | WritableState::Errored => {
                            // Settled streams absorb aborts.
                            let _ = completion.send(Ok(()));
                        }
                        _ => {
                            if let Some(pending) = &mut inner.pending_abort {
                                pending.completions.push(completion);
                            } else {
                                let was_already_erroring =
                                    inner.state == WritableState::Erroring;
                                debug!(?reason, "writable stream abort requested");
                                inner.pending_abort = Some(PendingAbort {
                                    reason: reason.clone(),
                                    was_already_erroring,
                                    completions: vec![completion],
                                });
                                if !was_already_erroring {
                                    inner.start_erroring(
                                        &flags,
                                        StreamError::Aborted(reason),
                                    );
                                }
                            }
                        }
                    },
                    WriteCommand::RegisterReadyWaker { waker } => {
                        inner.ready_wakers.register(&waker);
                        if inner.state != WritableState::Writable
                            || !flags.backpressure.load(Ordering::SeqCst)
                        {
                            inner.ready_wakers.wake_all();
                        }
                    }
                    WriteCommand::RegisterClosedWaker { waker } => {
                        inner.closed_wakers.register(&waker);
                        if inner.state == WritableState::Closed
                            || inner.state == WritableState::Errored
                        {
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

        // Settle the in-flight sink operation, if any.
        match &mut in_flight {
            InFlight::Write { future, .. } => {
                if let Poll::Ready((sink, result)) = future.as_mut().poll(cx) {
                    let prev = std::mem::replace(&mut in_flight, InFlight::Idle(sink));
                    let completion = match prev {
                        InFlight::Write { completion, .. } => completion,
                        _ => unreachable!(),
                    };
                    inner.in_flight_size = 0;
                    match result {
                        Ok(()) => {
                            let _ = completion.send(Ok(()));
                            inner.update_backpressure(&flags);
                        }
                        Err(err) => {
                            let _ = completion.send(Err(err.clone()));
                            if inner.state == WritableState::Writable {
                                inner.start_erroring(&flags, err);
                            }
                        }
                    }
                    cx.waker().wake_by_ref();
                }
            }
            InFlight::Close(future) => {
                if let Poll::Ready((sink, result)) = future.as_mut().poll(cx) {
                    in_flight = InFlight::Idle(sink);
                    match result {
                        Ok(()) => inner.finish_close(&flags),
                        Err(err) => {
                            if inner.state == WritableState::Writable {
                                inner.start_erroring(&flags, err);
                            } else if inner.state == WritableState::Erroring {
                                // Keep the earlier error; the failed close
                                // does not replace it.
                            }
                        }
                    }
                    cx.waker().wake_by_ref();
                }
            }
            InFlight::Abort(future) => {
                if let Poll::Ready((sink, result)) = future.as_mut().poll(cx) {
                    in_flight = InFlight::Idle(sink);
                    if let Some(abort) = inner.pending_abort.take() {
                        for tx in abort.completions {
                            let _ = tx.send(result.clone());
                        }
                    }
                    inner.reject_close_and_closed();
                    cx.waker().wake_by_ref();
                }
            }
            InFlight::Idle(_) | InFlight::Gone => {}
        }

        // Dispatch the next operation when the sink is free.
        if matches!(in_flight, InFlight::Idle(_)) {
            if inner.state == WritableState::Erroring {
                let sink = match std::mem::replace(&mut in_flight, InFlight::Gone) {
                    InFlight::Idle(sink) => sink,
                    _ => unreachable!(),
                };
                match inner.finish_erroring(&flags, sink) {
                    Some(abort_future) => in_flight = InFlight::Abort(abort_future),
                    None => in_flight = InFlight::Gone,
                }
                cx.waker().wake_by_ref();
            } else if inner.state == WritableState::Writable && !inner.queue.is_empty() {
                let entry = inner.queue.pop().expect("non-empty queue");
                let sink = match std::mem::replace(&mut in_flight, InFlight::Gone) {
                    InFlight::Idle(sink) => sink,
                    _ => unreachable!(),
                };
                match entry.value {
                    WriteOp::Chunk { chunk, completion } => {
                        inner.in_flight_size = entry.size;
                        let controller = controller.clone();
                        let mut sink = sink;
                        in_flight = InFlight::Write {
                            future: Box::pin(async move {
                                let result = sink.write(chunk, &controller).await;
                                (sink, result)
                            }),
                            completion,
                        };
                    }
                    WriteOp::Close => {
                        trace!("flushed; closing sink");
                        let mut sink = sink;
                        in_flight = InFlight::Close(Box::pin(async move {
                            let result = sink.close().await;
                            (sink, result)
                        }));
                    }
                }
                // The settle section already ran this iteration; re-poll so
                // the armed future gets its first poll.
                cx.waker().wake_by_ref();
            }
        }

        // InFlight::Gone with an errored stream means the sink is fully
        // disposed; only then may the task retire.
        let sink_busy = matches!(
            in_flight,
            InFlight::Write { .. } | InFlight::Close(_) | InFlight::Abort(_)
        );
        if commands_done && !sink_busy && inner.state != WritableState::Erroring {
            return Poll::Ready(());
        }
        Poll::Pending
    })
    .await;
}
