//! Piping a producer stream into a consumer stream.
//!
//! `pipe_to` locks both ends for the duration of the pipe, moves chunks under
//! the consumer's backpressure signal, and propagates termination in both
//! directions. At most one write is left in flight while the next chunk is
//! being read. All termination paths funnel through one shutdown sequence:
//! settle the in-flight write, run the propagation action, release both
//! locks, resolve the pipe.

use crate::{
    error::{StreamError, StreamResult},
    readable::{ReadableStream, ReadableStreamDefaultReader},
    writable::{WritableStream, WritableStreamDefaultWriter},
};
use futures::future::{AbortRegistration, Abortable, BoxFuture};
use tracing::debug;

/// Propagation controls for a pipe.
///
/// Each `prevent_*` flag suppresses one direction of termination
/// propagation. `signal` aborts the pipe from outside; both ends are then
/// terminated subject to the same flags.
#[derive(Default)]
pub struct PipeOptions {
    pub prevent_close: bool,
    pub prevent_abort: bool,
    pub prevent_cancel: bool,
    pub signal: Option<AbortRegistration>,
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Move every chunk of this stream into `dest`.
    ///
    /// Resolves once the source closed and (unless `prevent_close`) the
    /// destination finished closing. Fails with the first terminal error of
    /// either side after propagating it per `options`.
    pub async fn pipe_to(
        &self,
        dest: &WritableStream<T>,
        mut options: PipeOptions,
    ) -> StreamResult<()> {
        let reader = self.get_reader()?;
        let writer = dest.get_writer()?;
        let signal = options.signal.take();

        let result = match signal {
            None => pipe_inner(&reader, &writer, dest, &options).await,
            Some(registration) => {
                match Abortable::new(pipe_inner(&reader, &writer, dest, &options), registration)
                    .await
                {
                    Ok(result) => result,
                    Err(futures::future::Aborted) => {
                        debug!("pipe aborted by signal");
                        let reason = Some("pipe aborted".to_string());
                        if !options.prevent_abort {
                            let _ = writer.abort(reason.clone()).await;
                        }
                        if !options.prevent_cancel {
                            let _ = reader.cancel(reason.clone()).await;
                        }
                        Err(StreamError::Aborted(reason))
                    }
                }
            }
        };
        // Dropping the reader and writer releases both locks.
        result
    }
}

async fn pipe_inner<T: Send + 'static>(
    reader: &ReadableStreamDefaultReader<T>,
    writer: &WritableStreamDefaultWriter<T>,
    dest: &WritableStream<T>,
    options: &PipeOptions,
) -> StreamResult<()> {
    let mut pending_write: Option<BoxFuture<'_, StreamResult<()>>> = None;

    loop {
        // Backpressure gate; a rejection here means the destination errored.
        if let Err(err) = writer.ready().await {
            settle(&mut pending_write).await;
            debug!(error = %err, "pipe: destination errored");
            if !options.prevent_cancel {
                let _ = reader.cancel(Some(err.to_string())).await;
            }
            return Err(err);
        }
        // A destination that is closing on its own can accept nothing more.
        if dest.is_closing() || dest.is_closed() {
            settle(&mut pending_write).await;
            debug!("pipe: destination closing");
            if !options.prevent_cancel {
                let _ = reader.cancel(None).await;
            }
            return Err(StreamError::Closing);
        }

        match reader.read().await {
            Err(err) => {
                settle(&mut pending_write).await;
                debug!(error = %err, "pipe: source errored");
                if !options.prevent_abort {
                    let _ = writer.abort(Some(err.to_string())).await;
                }
                return Err(err);
            }
            Ok(None) => {
                // Source is done; flush the last write before closing.
                if let Some(write) = pending_write.take() {
                    write.await?;
                }
                debug!("pipe: source closed");
                if !options.prevent_close {
                    writer.close().await?;
                }
                return Ok(());
            }
            Ok(Some(chunk)) => {
                // Depth-one prefetch: the previous write must settle before
                // the next one is issued, but it ran while we read.
                if let Some(write) = pending_write.take() {
                    let _ = write.await;
                }
                pending_write = Some(Box::pin(writer.write(chunk)));
            }
        }
    }
}

async fn settle<'a>(pending_write: &mut Option<BoxFuture<'a, StreamResult<()>>>) {
    if let Some(write) = pending_write.take() {
        let _ = write.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readable::{ReadableSource, ReadableStreamDefaultController};
    use crate::strategy::CountQueuingStrategy;
    use crate::writable::{WritableSink, WritableStreamDefaultController};
    use futures::channel::oneshot;
    use parking_lot::Mutex;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use std::time::Duration;
    use tokio::time::timeout;

    fn spawn_task(fut: futures::future::BoxFuture<'static, ()>) {
        tokio::spawn(fut);
    }

    #[derive(Clone, Default)]
    struct Collected {
        chunks: Arc<Mutex<Vec<i32>>>,
        closed: Arc<AtomicBool>,
        abort_reason: Arc<Mutex<Option<Option<String>>>>,
    }

    struct CollectingSink {
        out: Collected,
    }

    impl WritableSink<i32> for CollectingSink {
        async fn write(
            &mut self,
            chunk: i32,
            _controller: &WritableStreamDefaultController,
        ) -> StreamResult<()> {
            self.out.chunks.lock().push(chunk);
            Ok(())
        }
        async fn close(&mut self) -> StreamResult<()> {
            self.out.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
            *self.out.abort_reason.lock() = Some(reason);
            Ok(())
        }
    }

    #[tokio::test]
    async fn pipes_all_chunks_and_closes_destination() {
        let source = ReadableStream::from_iter(1..=5).spawn(spawn_task);
        let out = Collected::default();
        let dest = WritableStream::builder(CollectingSink { out: out.clone() }).spawn(spawn_task);

        source.pipe_to(&dest, PipeOptions::default()).await.unwrap();

        assert_eq!(*out.chunks.lock(), vec![1, 2, 3, 4, 5]);
        assert!(out.closed.load(Ordering::SeqCst));
        assert!(!source.locked());
        assert!(!dest.locked());
    }

    #[tokio::test]
    async fn prevent_close_leaves_destination_open() {
        let source = ReadableStream::from_iter(vec![1, 2].into_iter()).spawn(spawn_task);
        let out = Collected::default();
        let dest = WritableStream::builder(CollectingSink { out: out.clone() }).spawn(spawn_task);

        source
            .pipe_to(
                &dest,
                PipeOptions {
                    prevent_close: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(!out.closed.load(Ordering::SeqCst));
        assert!(!dest.is_closed());
        // The destination is reusable after the pipe.
        let writer = dest.get_writer().unwrap();
        writer.write(3).await.unwrap();
        assert_eq!(*out.chunks.lock(), vec![1, 2, 3]);
    }

    struct FailingSource {
        emitted: bool,
    }

    impl ReadableSource<i32> for FailingSource {
        async fn pull(
            &mut self,
            controller: &ReadableStreamDefaultController<i32>,
        ) -> StreamResult<()> {
            if !self.emitted {
                self.emitted = true;
                controller.enqueue(1)?;
                Ok(())
            } else {
                Err(StreamError::from("source exploded"))
            }
        }
    }

    #[tokio::test]
    async fn source_error_aborts_destination() {
        let source = ReadableStream::builder(FailingSource { emitted: false }).spawn(spawn_task);
        let out = Collected::default();
        let dest = WritableStream::builder(CollectingSink { out: out.clone() }).spawn(spawn_task);

        let err = source
            .pipe_to(&dest, PipeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "source exploded");
        assert_eq!(
            out.abort_reason.lock().clone(),
            Some(Some("source exploded".to_string()))
        );
        assert!(dest.is_errored());
    }

    #[tokio::test]
    async fn prevent_abort_leaves_destination_writable() {
        let source = ReadableStream::builder(FailingSource { emitted: false }).spawn(spawn_task);
        let out = Collected::default();
        let dest = WritableStream::builder(CollectingSink { out: out.clone() }).spawn(spawn_task);

        let err = source
            .pipe_to(
                &dest,
                PipeOptions {
                    prevent_abort: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "source exploded");
        assert!(out.abort_reason.lock().is_none());
        assert!(!dest.is_errored());

        let writer = dest.get_writer().unwrap();
        writer.write(7).await.unwrap();
    }

    struct RecordingSource {
        n: i32,
        cancel_reason: Arc<Mutex<Option<Option<String>>>>,
    }

    impl ReadableSource<i32> for RecordingSource {
        async fn pull(
            &mut self,
            controller: &ReadableStreamDefaultController<i32>,
        ) -> StreamResult<()> {
            self.n += 1;
            controller.enqueue(self.n)?;
            Ok(())
        }
        async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
            *self.cancel_reason.lock() = Some(reason);
            Ok(())
        }
    }

    struct FailingSink {
        writes: usize,
    }

    impl WritableSink<i32> for FailingSink {
        async fn write(
            &mut self,
            _chunk: i32,
            _controller: &WritableStreamDefaultController,
        ) -> StreamResult<()> {
            self.writes += 1;
            if self.writes >= 2 {
                Err(StreamError::from("sink refused"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn destination_error_cancels_source() {
        let cancel_reason = Arc::new(Mutex::new(None));
        let source = ReadableStream::builder(RecordingSource {
            n: 0,
            cancel_reason: Arc::clone(&cancel_reason),
        })
        .spawn(spawn_task);
        let dest = WritableStream::builder(FailingSink { writes: 0 }).spawn(spawn_task);

        let err = timeout(
            Duration::from_secs(1),
            source.pipe_to(&dest, PipeOptions::default()),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err.to_string(), "sink refused");
        assert!(cancel_reason.lock().is_some(), "source must be canceled");
        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn prevent_cancel_leaves_source_readable() {
        let cancel_reason = Arc::new(Mutex::new(None));
        let source = ReadableStream::builder(RecordingSource {
            n: 0,
            cancel_reason: Arc::clone(&cancel_reason),
        })
        .spawn(spawn_task);
        let dest = WritableStream::builder(FailingSink { writes: 0 }).spawn(spawn_task);

        let err = timeout(
            Duration::from_secs(1),
            source.pipe_to(
                &dest,
                PipeOptions {
                    prevent_cancel: true,
                    ..Default::default()
                },
            ),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err.to_string(), "sink refused");
        assert!(cancel_reason.lock().is_none());

        // The source lock was released and the stream still produces.
        let reader = source.get_reader().unwrap();
        assert!(reader.read().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn preserves_chunk_order_under_backpressure() {
        struct SlowSink {
            out: Collected,
        }
        impl WritableSink<i32> for SlowSink {
            async fn write(
                &mut self,
                chunk: i32,
                _controller: &WritableStreamDefaultController,
            ) -> StreamResult<()> {
                tokio::task::yield_now().await;
                self.out.chunks.lock().push(chunk);
                Ok(())
            }
        }

        let source = ReadableStream::from_iter(1..=50)
            .strategy(CountQueuingStrategy::new(4))
            .spawn(spawn_task);
        let out = Collected::default();
        let dest = WritableStream::builder(SlowSink { out: out.clone() })
            .strategy(CountQueuingStrategy::new(1))
            .spawn(spawn_task);

        source.pipe_to(&dest, PipeOptions::default()).await.unwrap();
        assert_eq!(*out.chunks.lock(), (1..=50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn chunk_reaches_sink_while_next_read_blocks() {
        struct OneThenStall {
            emitted: bool,
        }
        impl ReadableSource<i32> for OneThenStall {
            async fn pull(
                &mut self,
                controller: &ReadableStreamDefaultController<i32>,
            ) -> StreamResult<()> {
                if !self.emitted {
                    self.emitted = true;
                    controller.enqueue(1)?;
                } else {
                    futures::future::pending::<()>().await;
                }
                Ok(())
            }
        }

        let source = ReadableStream::builder(OneThenStall { emitted: false }).spawn(spawn_task);
        let out = Collected::default();
        let dest = WritableStream::builder(CollectingSink { out: out.clone() }).spawn(spawn_task);

        let pipe = source.pipe_to(&dest, PipeOptions::default());
        futures::pin_mut!(pipe);
        let raced = futures::future::select(
            &mut pipe,
            Box::pin(tokio::time::sleep(Duration::from_millis(50))),
        )
        .await;
        assert!(
            matches!(raced, futures::future::Either::Right(_)),
            "pipe must still be waiting on the stalled source"
        );
        // The chunk read before the stall must not be withheld from the sink
        // while the next read blocks.
        assert_eq!(*out.chunks.lock(), vec![1]);
    }

    #[tokio::test]
    async fn abort_signal_terminates_both_ends() {
        struct GatedSink {
            gate: Option<oneshot::Receiver<()>>,
        }
        impl WritableSink<i32> for GatedSink {
            async fn write(
                &mut self,
                _chunk: i32,
                _controller: &WritableStreamDefaultController,
            ) -> StreamResult<()> {
                if let Some(gate) = self.gate.take() {
                    let _ = gate.await;
                }
                Ok(())
            }
        }

        let cancel_reason = Arc::new(Mutex::new(None));
        let source = ReadableStream::builder(RecordingSource {
            n: 0,
            cancel_reason: Arc::clone(&cancel_reason),
        })
        .spawn(spawn_task);
        let (gate_tx, gate_rx) = oneshot::channel();
        let dest = WritableStream::builder(GatedSink {
            gate: Some(gate_rx),
        })
        .spawn(spawn_task);

        let (handle, registration) = futures::future::AbortHandle::new_pair();
        let pipe = source.pipe_to(
            &dest,
            PipeOptions {
                signal: Some(registration),
                ..Default::default()
            },
        );
        let pipe = async move { pipe.await };
        futures::pin_mut!(pipe);

        // Let the pipe move a chunk into the stuck sink, then pull the plug.
        let poll_once = futures::future::select(
            &mut pipe,
            Box::pin(tokio::time::sleep(Duration::from_millis(20))),
        );
        match poll_once.await {
            futures::future::Either::Left((result, _)) => {
                panic!("pipe finished early: {result:?}")
            }
            futures::future::Either::Right(((), _)) => {}
        }
        handle.abort();
        // Release the stuck write so the destination can finish aborting.
        gate_tx.send(()).unwrap();

        let err = timeout(Duration::from_secs(1), pipe)
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StreamError::Aborted(_)));
        assert!(cancel_reason.lock().is_some());
        assert!(dest.is_errored());
        assert!(!source.locked());
        assert!(!dest.locked());
    }
}
