//! Stream fan-out to two independent consumers
//!
//! [`tee`] spawns a pump that reads the source once and forwards every chunk
//! to two bounded channels in lockstep: chunk `n` is delivered to both sinks
//! before chunk `n + 1` is read. A source error is forwarded to both sinks
//! after the same prefix. A sink whose consumer goes away is marked
//! abandoned and skipped without disturbing the other.

use crate::{ByteStream, GenerateError};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

type Chunk = Result<Vec<u8>, GenerateError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Live,
    /// Consumer read to the end of the source.
    Done,
    /// Consumer received the source error.
    Errored,
    /// Consumer dropped the sink before reaching the end.
    Abandoned,
}

impl SinkState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SinkState::Live)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOutcome {
    Exhausted,
    Errored,
    /// Both sinks were abandoned so the source was not read further.
    Abandoned,
}

/// One of the two consumer ends of a tee.
pub struct TeeSink {
    name: &'static str,
    rx: mpsc::Receiver<Chunk>,
    state: watch::Sender<SinkState>,
}

impl TeeSink {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> SinkState {
        *self.state.borrow()
    }

    pub fn into_byte_stream(self) -> ByteStream {
        Box::pin(self)
    }

    fn settle(&self, next: SinkState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

impl Stream for TeeSink {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Err(e))) => {
                self.settle(SinkState::Errored);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(chunk)),
            Poll::Ready(None) => {
                self.settle(SinkState::Done);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TeeSink {
    fn drop(&mut self) {
        self.settle(SinkState::Abandoned);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeeReport {
    pub source: SourceOutcome,
    pub bytes: u64,
    pub sinks: [SinkState; 2],
}

/// Resolves once the source is finished and both sinks are terminal.
pub struct TeeDrain {
    pump: JoinHandle<(SourceOutcome, u64)>,
    sinks: [watch::Receiver<SinkState>; 2],
}

impl TeeDrain {
    pub async fn drained(self) -> TeeReport {
        let (source, bytes) = match self.pump.await {
            Ok(result) => result,
            Err(e) => {
                debug!("Tee pump task ended abnormally: {}", e);
                (SourceOutcome::Errored, 0)
            }
        };

        let mut sinks = [SinkState::Live; 2];
        for (slot, mut rx) in sinks.iter_mut().zip(self.sinks) {
            let _ = rx.wait_for(|state| state.is_terminal()).await;
            *slot = *rx.borrow();
        }

        TeeReport {
            source,
            bytes,
            sinks,
        }
    }
}

/// Split `source` into two sinks, each buffering at most `capacity` chunks.
pub fn tee(source: ByteStream, capacity: usize) -> (TeeSink, TeeSink, TeeDrain) {
    let capacity = capacity.max(1);
    let (tx_a, rx_a) = mpsc::channel(capacity);
    let (tx_b, rx_b) = mpsc::channel(capacity);
    let (state_a, watch_a) = watch::channel(SinkState::Live);
    let (state_b, watch_b) = watch::channel(SinkState::Live);

    let pump = tokio::spawn(pump(source, [Some(tx_a), Some(tx_b)]));

    (
        TeeSink {
            name: "primary",
            rx: rx_a,
            state: state_a,
        },
        TeeSink {
            name: "secondary",
            rx: rx_b,
            state: state_b,
        },
        TeeDrain {
            pump,
            sinks: [watch_a, watch_b],
        },
    )
}

async fn pump(
    mut source: ByteStream,
    mut sinks: [Option<mpsc::Sender<Chunk>>; 2],
) -> (SourceOutcome, u64) {
    let mut bytes = 0u64;

    loop {
        if sinks.iter().all(Option::is_none) {
            debug!("Both tee sinks abandoned after {} bytes", bytes);
            return (SourceOutcome::Abandoned, bytes);
        }

        match source.next().await {
            Some(Ok(chunk)) => {
                bytes += chunk.len() as u64;
                for slot in sinks.iter_mut() {
                    forward(slot, Ok(chunk.clone())).await;
                }
            }
            Some(Err(e)) => {
                debug!("Tee source failed after {} bytes: {}", bytes, e);
                for slot in sinks.iter_mut() {
                    forward(slot, Err(e.clone())).await;
                }
                return (SourceOutcome::Errored, bytes);
            }
            None => return (SourceOutcome::Exhausted, bytes),
        }
    }
}

async fn forward(slot: &mut Option<mpsc::Sender<Chunk>>, chunk: Chunk) {
    if let Some(tx) = slot {
        if tx.send(chunk).await.is_err() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::chunks_stream;

    async fn collect(mut sink: TeeSink) -> (Vec<u8>, Option<GenerateError>, SinkState) {
        let mut data = Vec::new();
        let mut error = None;
        while let Some(chunk) = sink.next().await {
            match chunk {
                Ok(c) => data.extend(c),
                Err(e) => error = Some(e),
            }
        }
        let state = sink.state();
        (data, error, state)
    }

    fn numbered_chunks(count: usize, size: usize) -> Vec<Chunk> {
        (0..count).map(|i| Ok(vec![i as u8; size])).collect()
    }

    #[tokio::test]
    async fn test_both_sinks_see_identical_bytes() {
        let chunks = numbered_chunks(50, 100);
        let expected: Vec<u8> = chunks.iter().flat_map(|c| c.clone().unwrap()).collect();

        let (a, b, drain) = tee(chunks_stream(chunks), 4);
        let (ra, rb) = tokio::join!(collect(a), collect(b));

        assert_eq!(ra.0, expected);
        assert_eq!(rb.0, expected);
        assert_eq!(ra.2, SinkState::Done);
        assert_eq!(rb.2, SinkState::Done);

        let report = drain.drained().await;
        assert_eq!(report.source, SourceOutcome::Exhausted);
        assert_eq!(report.bytes, 5000);
        assert_eq!(report.sinks, [SinkState::Done, SinkState::Done]);
    }

    #[tokio::test]
    async fn test_source_error_reaches_both_after_same_prefix() {
        let mut chunks = numbered_chunks(3, 10);
        chunks.push(Err(GenerateError::Stream("connection reset".into())));
        chunks.push(Ok(vec![0xff; 10]));

        let (a, b, drain) = tee(chunks_stream(chunks), 2);
        let (ra, rb) = tokio::join!(collect(a), collect(b));

        assert_eq!(ra.0.len(), 30);
        assert_eq!(ra.0, rb.0);
        assert!(matches!(ra.1, Some(GenerateError::Stream(_))));
        assert!(matches!(rb.1, Some(GenerateError::Stream(_))));
        assert_eq!(ra.2, SinkState::Errored);
        assert_eq!(rb.2, SinkState::Errored);

        let report = drain.drained().await;
        assert_eq!(report.source, SourceOutcome::Errored);
        assert_eq!(report.bytes, 30);
    }

    #[tokio::test]
    async fn test_abandoned_sink_does_not_stop_the_other() {
        let chunks = numbered_chunks(40, 8);
        let (a, mut b, drain) = tee(chunks_stream(chunks), 1);

        // Caller reads one chunk then disconnects
        let first = b.next().await.unwrap().unwrap();
        assert_eq!(first, vec![0u8; 8]);
        drop(b);

        let (data, error, state) = collect(a).await;
        assert_eq!(data.len(), 320);
        assert!(error.is_none());
        assert_eq!(state, SinkState::Done);

        let report = drain.drained().await;
        assert_eq!(report.source, SourceOutcome::Exhausted);
        assert_eq!(report.sinks, [SinkState::Done, SinkState::Abandoned]);
    }

    #[tokio::test]
    async fn test_both_abandoned_stops_pulling_source() {
        let (a, b, drain) = tee(chunks_stream(numbered_chunks(1000, 8)), 1);
        drop(a);
        drop(b);

        let report = drain.drained().await;
        assert_eq!(report.source, SourceOutcome::Abandoned);
        assert!(report.bytes < 8000);
        assert_eq!(report.sinks, [SinkState::Abandoned, SinkState::Abandoned]);
    }

    #[tokio::test]
    async fn test_empty_source() {
        let (a, b, drain) = tee(chunks_stream(Vec::new()), 4);
        let (ra, rb) = tokio::join!(collect(a), collect(b));
        assert!(ra.0.is_empty() && rb.0.is_empty());

        let report = drain.drained().await;
        assert_eq!(report.source, SourceOutcome::Exhausted);
        assert_eq!(report.bytes, 0);
    }
}
