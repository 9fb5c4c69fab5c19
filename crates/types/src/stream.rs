//! Bounded, single-consumer chunk stream with an explicit end marker.
//!
//! A producer task pushes [`StreamChunk`]s through a [`ChunkSender`] and ends
//! the stream by consuming the sender. If the sender is dropped without an end
//! marker the consumer observes [`StreamEnd::Truncated`].

use crate::{GatewayError, StreamChunk};
use futures_core::Stream;
use serde_json::Value;
use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::mpsc;

/// Default number of chunks buffered between producer and consumer.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// How a [`ChunkStream`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Upstream reached EOF or its terminal sentinel.
    Completed,
    /// A terminal error chunk was delivered.
    Failed,
    /// The caller cancelled the request.
    Cancelled,
    /// The producer vanished without signalling an end.
    Truncated,
}

enum Frame {
    Chunk(StreamChunk),
    End(StreamEnd),
}

/// Creates a bounded chunk channel. A capacity of zero is raised to one.
#[must_use]
pub fn channel(capacity: usize) -> (ChunkSender, ChunkStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChunkSender { tx }, ChunkStream { rx, end: None })
}

/// Producer half of a [`ChunkStream`].
pub struct ChunkSender {
    tx: mpsc::Sender<Frame>,
}

impl ChunkSender {
    /// Sends one data chunk, waiting while the buffer is full.
    ///
    /// Returns `false` once the consumer has gone away.
    pub async fn send(&self, value: Value) -> bool {
        self.tx.send(Frame::Chunk(StreamChunk::Data(value))).await.is_ok()
    }

    /// Delivers `err` as the terminal chunk and closes the stream.
    ///
    /// [`GatewayError::Cancelled`] ends the stream as
    /// [`StreamEnd::Cancelled`]; any other error as [`StreamEnd::Failed`].
    pub async fn fail(self, err: GatewayError) {
        let end = if matches!(err.root(), GatewayError::Cancelled) {
            StreamEnd::Cancelled
        } else {
            StreamEnd::Failed
        };
        if self.tx.send(Frame::Chunk(StreamChunk::Error(err))).await.is_ok() {
            let _ = self.tx.send(Frame::End(end)).await;
        }
    }

    /// Closes the stream with the given end marker.
    pub async fn finish(self, end: StreamEnd) {
        let _ = self.tx.send(Frame::End(end)).await;
    }

    /// `true` once the consumer dropped its half.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the consumer drops its half.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

impl fmt::Debug for ChunkSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkSender")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Consumer half: an ordered, single-use stream of [`StreamChunk`]s.
pub struct ChunkStream {
    rx: mpsc::Receiver<Frame>,
    end: Option<StreamEnd>,
}

impl ChunkStream {
    /// How the stream ended, once it has.
    #[must_use]
    pub fn end(&self) -> Option<StreamEnd> {
        self.end
    }

    /// Receives the next chunk, or `None` when the stream is over.
    pub async fn next_chunk(&mut self) -> Option<StreamChunk> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Drains the stream, returning every chunk and the end marker.
    pub async fn collect(mut self) -> (Vec<StreamChunk>, StreamEnd) {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            chunks.push(chunk);
        }
        (chunks, self.end.unwrap_or(StreamEnd::Truncated))
    }
}

impl Stream for ChunkStream {
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.end.is_some() {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Frame::Chunk(chunk))) => Poll::Ready(Some(chunk)),
            Poll::Ready(Some(Frame::End(end))) => {
                self.end = Some(end);
                self.rx.close();
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                self.end = Some(StreamEnd::Truncated);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkStream").field("end", &self.end).finish_non_exhaustive()
    }
}
