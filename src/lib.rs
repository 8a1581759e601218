//! Backpressure-controlled streams: pull-based producers, push-based
//! consumers, and the plumbing between them.
//!
//! A [`ReadableStream`] wraps a [`ReadableSource`] and pulls from it only as
//! fast as its reader consumes; a [`WritableStream`] wraps a [`WritableSink`]
//! and exposes a [`ready`](WritableStreamDefaultWriter::ready) signal that
//! throttles producers. [`pipe_to`](ReadableStream::pipe_to) connects the
//! two, [`tee`](ReadableStream::tee) splits a producer in half, and
//! [`ReadableByteStream`] adds fill-my-buffer reads for byte data.
//!
//! Streams are runtime-agnostic: every builder takes a spawn function for
//! its driver task.
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use floodgate::{PipeOptions, ReadableStream, StreamResult, WritableSink, WritableStream};
//!
//! struct Stdoutish(Vec<String>);
//!
//! impl WritableSink<String> for Stdoutish {
//!     async fn write(
//!         &mut self,
//!         chunk: String,
//!         _controller: &floodgate::WritableStreamDefaultController,
//!     ) -> StreamResult<()> {
//!         self.0.push(chunk);
//!         Ok(())
//!     }
//! }
//!
//! let source = ReadableStream::from_iter(["a", "b"].map(String::from).into_iter())
//!     .spawn(|fut| drop(tokio::spawn(fut)));
//! let dest = WritableStream::builder(Stdoutish(Vec::new()))
//!     .spawn(|fut| drop(tokio::spawn(fut)));
//!
//! source.pipe_to(&dest, PipeOptions::default()).await.unwrap();
//! assert!(dest.is_closed());
//! # }
//! ```

pub mod byte;
pub mod error;
pub mod pipe;
mod queue;
pub mod readable;
pub mod strategy;
mod tee;
mod wake;
pub mod writable;

pub use byte::{
    ByobRequest, ByobResult, ByteSource, ByteStreamAsyncRead, ByteStreamByobReader,
    ByteStreamDefaultReader, ReadableByteStream, ReadableByteStreamBuilder,
    ReadableByteStreamController,
};
pub use error::{StreamError, StreamResult};
pub use pipe::PipeOptions;
pub use readable::{
    ReadableSource, ReadableStream, ReadableStreamBuilder, ReadableStreamDefaultController,
    ReadableStreamDefaultReader,
};
pub use strategy::{ByteLengthQueuingStrategy, CountQueuingStrategy, QueuingStrategy};
pub use writable::{
    WritableSink, WritableStream, WritableStreamBuilder, WritableStreamDefaultController,
    WritableStreamDefaultWriter,
};
