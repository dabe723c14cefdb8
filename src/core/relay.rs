//! Chunk-by-chunk relay of an upstream body into a response body.
//!
//! A pump task moves each upstream chunk through a capacity-1 channel, so at
//! most one chunk is buffered between upstream and caller and every chunk is
//! handed to the connection as soon as it arrives.
use std::fmt;

use axum::body::Body;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Upstream reached end of stream and everything was handed to the caller.
    Completed,
    /// The caller went away; upstream reading was abandoned.
    ClientGone,
    /// Upstream failed mid-stream; the failure was forwarded to the caller.
    UpstreamError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub chunks: usize,
    pub bytes: u64,
    pub outcome: RelayOutcome,
}

/// Spawns the pump and returns the caller-facing body plus the pump handle.
pub fn relay<S, E>(upstream: S) -> (Body, JoinHandle<RelayStats>)
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(1);

    let pump = tokio::spawn(async move {
        let mut upstream = Box::pin(upstream);
        let mut stats = RelayStats {
            chunks: 0,
            bytes: 0,
            outcome: RelayOutcome::Completed,
        };

        loop {
            let next = tokio::select! {
                next = upstream.next() => next,
                _ = tx.closed() => {
                    stats.outcome = RelayOutcome::ClientGone;
                    break;
                }
            };

            match next {
                None => break,
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => {
                    let len = chunk.len() as u64;
                    if tx.send(Ok(chunk)).await.is_err() {
                        stats.outcome = RelayOutcome::ClientGone;
                        break;
                    }
                    stats.chunks += 1;
                    stats.bytes += len;
                }
                Some(Err(e)) => {
                    let message = e.to_string();
                    let _ = tx.send(Err(std::io::Error::other(message.clone()))).await;
                    stats.outcome = RelayOutcome::UpstreamError(message);
                    break;
                }
            }
        }

        stats
    });

    (Body::from_stream(ReceiverStream::new(rx)), pump)
}
