//! Request bodies for queued units.
//!
//! # States
//! ```text
//! Buffering ──connect()──▶ Connected ──end──▶ Done
//!     │  └──end──▶ Buffering(ended) ──connect()──▶ full body
//!     └──cap exceeded──▶ Overflowed (terminal, chunks discarded)
//! ```
//!
//! A pump task drains the inbound stream from admission on, so a body that
//! finishes arriving while its unit waits is forwarded from memory. Once the
//! unit is dispatched the buffered prefix goes first and later chunks pass
//! straight through without further buffering.

use axum::body::{Body, Bytes};
use futures_util::{stream, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Chunks in flight between the pump and the upstream connection.
const PASS_THROUGH_CAPACITY: usize = 16;

/// Why a body could not be handed upstream.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BodyError {
    #[error("request body exceeded {0} bytes while queued")]
    Overflow(usize),

    #[error("request body stream aborted by client")]
    Aborted,
}

type Chunk = Result<Bytes, axum::Error>;

#[derive(Debug)]
enum BufferState {
    Buffering { buf: Vec<u8>, ended: bool },
    Overflowed,
    Aborted,
    Connected(mpsc::Sender<Chunk>),
    Done,
}

/// Body of a unit as held by the queue.
#[derive(Debug)]
pub enum RequestBody {
    Empty,
    /// Fully materialized before admission (eager mode).
    Buffered(Bytes),
    Streaming(StreamingBody),
}

impl RequestBody {
    /// Turn into the body sent upstream.
    pub fn connect(self) -> Result<Body, BodyError> {
        match self {
            RequestBody::Empty => Ok(Body::empty()),
            RequestBody::Buffered(bytes) => Ok(Body::from(bytes)),
            RequestBody::Streaming(body) => body.connect(),
        }
    }
}

/// Inbound body buffered up to `max_bytes` while its unit waits.
#[derive(Debug)]
pub struct StreamingBody {
    shared: Arc<Mutex<BufferState>>,
    max_bytes: usize,
    pump: Option<JoinHandle<()>>,
}

fn lock(shared: &Mutex<BufferState>) -> MutexGuard<'_, BufferState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamingBody {
    /// Start draining `body` in the background.
    pub fn spawn(body: Body, max_bytes: usize) -> Self {
        let shared = Arc::new(Mutex::new(BufferState::Buffering {
            buf: Vec::new(),
            ended: false,
        }));
        let pump = tokio::spawn(pump(body, Arc::clone(&shared), max_bytes));
        Self {
            shared,
            max_bytes,
            pump: Some(pump),
        }
    }

    #[cfg(test)]
    fn is_overflowed(&self) -> bool {
        matches!(*lock(&self.shared), BufferState::Overflowed)
    }

    /// Bytes currently held in memory.
    #[cfg(test)]
    fn buffered_len(&self) -> usize {
        match &*lock(&self.shared) {
            BufferState::Buffering { buf, .. } => buf.len(),
            _ => 0,
        }
    }

    /// Whether the client finished sending before dispatch.
    #[cfg(test)]
    fn is_complete(&self) -> bool {
        matches!(*lock(&self.shared), BufferState::Buffering { ended: true, .. })
    }

    /// Switch to pass-through and return the upstream body.
    pub fn connect(mut self) -> Result<Body, BodyError> {
        let mut state = lock(&self.shared);
        let body = match std::mem::replace(&mut *state, BufferState::Done) {
            BufferState::Buffering { buf, ended: true } => Ok(Body::from(buf)),
            BufferState::Buffering { buf, ended: false } => {
                let (tx, rx) = mpsc::channel(PASS_THROUGH_CAPACITY);
                if !buf.is_empty() {
                    // Fresh channel: the prefix always fits and goes out first.
                    let _ = tx.try_send(Ok(Bytes::from(buf)));
                }
                *state = BufferState::Connected(tx);
                Ok(Body::from_stream(receiver_stream(rx)))
            }
            BufferState::Overflowed => {
                *state = BufferState::Overflowed;
                Err(BodyError::Overflow(self.max_bytes))
            }
            BufferState::Aborted | BufferState::Connected(_) | BufferState::Done => {
                Err(BodyError::Aborted)
            }
        };
        drop(state);

        if body.is_ok() {
            // The pump keeps feeding the pass-through channel.
            self.pump.take();
        }
        body
    }
}

impl Drop for StreamingBody {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

fn receiver_stream(rx: mpsc::Receiver<Chunk>) -> impl futures_util::Stream<Item = Chunk> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|chunk| (chunk, rx)) })
}

async fn pump(body: Body, shared: Arc<Mutex<BufferState>>, max_bytes: usize) {
    let mut chunks = body.into_data_stream();

    while let Some(chunk) = chunks.next().await {
        let sender = {
            let mut state = lock(&shared);
            match &mut *state {
                BufferState::Buffering { buf, .. } => {
                    match chunk {
                        Ok(chunk) if buf.len() + chunk.len() <= max_bytes => {
                            buf.extend_from_slice(&chunk);
                        }
                        Ok(_) => {
                            tracing::debug!(max_bytes, "Queued request body overflowed");
                            *state = BufferState::Overflowed;
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Request body aborted while queued");
                            *state = BufferState::Aborted;
                            return;
                        }
                    }
                    continue;
                }
                BufferState::Overflowed => continue,
                BufferState::Connected(tx) => tx.clone(),
                BufferState::Aborted | BufferState::Done => return,
            }
        };

        if sender.send(chunk).await.is_err() {
            // Upstream stopped reading.
            return;
        }
    }

    let mut state = lock(&shared);
    match &mut *state {
        BufferState::Buffering { ended, .. } => *ended = true,
        BufferState::Connected(_) => *state = BufferState::Done,
        _ => {}
    }
}
