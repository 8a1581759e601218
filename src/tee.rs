//! Splitting one producer stream into two independent branches.
//!
//! A coordinator task holds the parent's reader. Each branch is an ordinary
//! [`ReadableStream`] whose source drains a per-branch channel; a branch pull
//! with an empty channel raises demand, the coordinator reads one chunk from
//! the parent and feeds a clone to every live branch. Branches consume at
//! their own pace; the slower branch buffers without bounding the faster
//! one.
//!
//! Canceling one branch leaves the other untouched. Only when both branches
//! have canceled is the parent canceled, with both reasons combined; each
//! branch's cancel settles with the parent's cancel result.

use crate::{
    error::{StreamError, StreamResult},
    readable::{ReadableSource, ReadableStream, ReadableStreamDefaultController},
    wake::{AsyncSignal, WakerSet},
};
use futures::{
    channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
    future::{poll_fn, BoxFuture},
    stream::StreamExt,
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::Poll,
};
use tracing::{debug, trace};

enum TeeChunk<T> {
    Data(T),
    End,
    Error(StreamError),
}

struct TeeState {
    canceled: [bool; 2],
    reasons: [Option<Option<String>>; 2],
    // Set when the parent settles (canceled, closed, or errored); pending
    // branch cancels resolve against it.
    upstream_result: Option<StreamResult<()>>,
    cancel_wakers: WakerSet,
}

struct TeeShared {
    state: Mutex<TeeState>,
    demand: AsyncSignal,
    wanted: AtomicBool,
}

impl TeeShared {
    fn both_canceled(&self) -> bool {
        let st = self.state.lock();
        st.canceled[0] && st.canceled[1]
    }
}

impl<T: Clone + Send + 'static> ReadableStream<T> {
    /// Split the stream into two branches carrying the same chunks.
    ///
    /// Locks this stream for the lifetime of the branches. `spawn_fn` is
    /// invoked once for the coordinator and once per branch driver.
    pub fn tee<F>(&self, spawn_fn: F) -> StreamResult<(ReadableStream<T>, ReadableStream<T>)>
    where
        F: Fn(BoxFuture<'static, ()>),
    {
        let reader = self.get_reader()?;
        let shared = Arc::new(TeeShared {
            state: Mutex::new(TeeState {
                canceled: [false, false],
                reasons: [None, None],
                upstream_result: None,
                cancel_wakers: WakerSet::new(),
            }),
            demand: AsyncSignal::new(),
            wanted: AtomicBool::new(false),
        });

        let (tx_a, rx_a) = unbounded();
        let (tx_b, rx_b) = unbounded();
        spawn_fn(Box::pin(tee_coordinator(
            reader,
            [tx_a, tx_b],
            Arc::clone(&shared),
        )));

        let branch_a = ReadableStream::builder(TeeBranchSource {
            rx: rx_a,
            shared: Arc::clone(&shared),
            index: 0,
        })
        .spawn(|fut| spawn_fn(fut));
        let branch_b = ReadableStream::builder(TeeBranchSource {
            rx: rx_b,
            shared,
            index: 1,
        })
        .spawn(|fut| spawn_fn(fut));
        Ok((branch_a, branch_b))
    }
}

struct TeeBranchSource<T> {
    rx: UnboundedReceiver<TeeChunk<T>>,
    shared: Arc<TeeShared>,
    index: usize,
}

impl<T: Clone + Send + 'static> ReadableSource<T> for TeeBranchSource<T> {
    async fn pull(&mut self, controller: &ReadableStreamDefaultController<T>) -> StreamResult<()> {
        // Non-blocking probe: consume a buffered item without raising demand.
        let buffered = poll_fn(|cx| match self.rx.poll_next_unpin(cx) {
            Poll::Ready(item) => Poll::Ready(Some(item)),
            Poll::Pending => Poll::Ready(None),
        })
        .await;
        let next = match buffered {
            Some(Some(item)) => item,
            // Coordinator gone; nothing more is coming.
            Some(None) => TeeChunk::End,
            // Channel empty: raise demand and wait.
            None => {
                self.shared.wanted.store(true, Ordering::SeqCst);
                self.shared.demand.signal();
                match self.rx.next().await {
                    Some(item) => item,
                    None => TeeChunk::End,
                }
            }
        };
        match next {
            TeeChunk::Data(chunk) => controller.enqueue(chunk)?,
            TeeChunk::End => controller.close()?,
            TeeChunk::Error(err) => controller.error(err)?,
        }
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
        trace!(branch = self.index, "tee branch canceled");
        {
            let mut st = self.shared.state.lock();
            st.canceled[self.index] = true;
            st.reasons[self.index] = Some(reason);
            st.cancel_wakers.wake_all();
        }
        self.shared.demand.signal();
        // Settle with the parent's result once it is decided.
        let shared = Arc::clone(&self.shared);
        poll_fn(move |cx| {
            let st = shared.state.lock();
            match &st.upstream_result {
                Some(result) => Poll::Ready(result.clone()),
                None => {
                    st.cancel_wakers.register(cx.waker());
                    Poll::Pending
                }
            }
        })
        .await
    }
}

fn compose_reasons(reasons: &[Option<Option<String>>; 2]) -> Option<String> {
    let a = reasons[0].clone().flatten();
    let b = reasons[1].clone().flatten();
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(format!(
            "[{}, {}]",
            a.as_deref().unwrap_or("canceled"),
            b.as_deref().unwrap_or("canceled")
        )),
    }
}

async fn tee_coordinator<T: Clone + Send + 'static>(
    reader: crate::readable::ReadableStreamDefaultReader<T>,
    branch_txs: [UnboundedSender<TeeChunk<T>>; 2],
    shared: Arc<TeeShared>,
) {
    let settle = |result: StreamResult<()>| {
        let mut st = shared.state.lock();
        st.upstream_result = Some(result);
        st.cancel_wakers.wake_all();
    };

    loop {
        if shared.both_canceled() {
            let reason = compose_reasons(&shared.state.lock().reasons);
            debug!(?reason, "tee: both branches canceled, canceling parent");
            let result = reader.cancel(reason).await;
            settle(result);
            return;
        }
        if !shared.wanted.swap(false, Ordering::SeqCst) {
            shared.demand.wait().await;
            continue;
        }

        // One parent read serves every live branch.
        let outcome = {
            let read = reader.read();
            futures::pin_mut!(read);
            let canceled = poll_fn(|cx| {
                if shared.both_canceled() {
                    Poll::Ready(())
                } else {
                    shared.state.lock().cancel_wakers.register(cx.waker());
                    Poll::Pending
                }
            });
            futures::pin_mut!(canceled);
            match futures::future::select(read, canceled).await {
                futures::future::Either::Left((result, _)) => Some(result),
                futures::future::Either::Right(((), _)) => None,
            }
        };
        let Some(result) = outcome else {
            // Both canceled mid-read; the abandoned chunk is unobservable.
            continue;
        };
        let live = |i: usize| !shared.state.lock().canceled[i];
        match result {
            Ok(Some(chunk)) => {
                for (i, tx) in branch_txs.iter().enumerate() {
                    if live(i) {
                        let _ = tx.unbounded_send(TeeChunk::Data(chunk.clone()));
                    }
                }
            }
            Ok(None) => {
                trace!("tee: parent closed");
                for (i, tx) in branch_txs.iter().enumerate() {
                    if live(i) {
                        let _ = tx.unbounded_send(TeeChunk::End);
                    }
                }
                settle(Ok(()));
                return;
            }
            Err(err) => {
                debug!(error = %err, "tee: parent errored");
                for (i, tx) in branch_txs.iter().enumerate() {
                    if live(i) {
                        let _ = tx.unbounded_send(TeeChunk::Error(err.clone()));
                    }
                }
                settle(Ok(()));
                return;
            }
        }
    }
}
