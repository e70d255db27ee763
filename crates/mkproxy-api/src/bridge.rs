//! Websocket log relay.
//!
//! ```text
//! upstream log stream ──► upstream pump ──► bounded buffer ──► outbound pump ──► websocket
//!                                                                     ▲
//!                                  client watcher (close / error) ────┘ cancels both
//! ```
//!
//! The upstream pump stops reading when the buffer is full, so a slow
//! client slows the upstream fetch instead of growing memory. Every exit
//! path drops both pumps, which releases the upstream body and the
//! outbound sink together.

use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use mkproxy_kube::{KubeResult, LogStream};

use crate::authz::log_access;
use crate::error::ProxyError;
use crate::handlers::{admitted_target, bounded, with_cluster, LogQuery, LogTarget, WorkerTarget};
use crate::validate::validate_name;
use crate::ProxyState;

#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    /// Chunks held between the pumps.
    pub buffer_chunks: usize,
    /// Absolute deadline for all outbound writes, from relay start.
    pub write_deadline: Duration,
}

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Upstream ended; all bytes were written and a normal close sent.
    Completed { bytes: u64 },
    /// Upstream failed; an error close was sent.
    UpstreamFailed,
    /// The client closed or dropped the connection.
    ClientClosed,
    /// Writing to the client failed.
    OutboundFailed,
    /// The write deadline passed.
    DeadlineExceeded,
}

/// Relay `upstream` to `sink` until either side ends.
pub async fn relay<S, I, E>(
    upstream: LogStream,
    sink: S,
    inbound: I,
    options: RelayOptions,
) -> RelayOutcome
where
    S: Sink<Message>,
    S::Error: Display,
    I: Stream<Item = Result<Message, E>>,
    E: Display,
{
    let (tx, rx) = mpsc::channel(options.buffer_chunks.max(1));
    let deadline = Instant::now() + options.write_deadline;

    let sink = std::pin::pin!(sink);
    let pumps = async {
        let ((), outcome) = tokio::join!(
            pump_upstream(upstream, tx),
            pump_outbound(rx, sink, deadline)
        );
        outcome
    };

    tokio::select! {
        outcome = pumps => outcome,
        () = client_closed(inbound) => RelayOutcome::ClientClosed,
    }
}

async fn pump_upstream(mut upstream: LogStream, tx: mpsc::Sender<KubeResult<Bytes>>) {
    loop {
        let item = tokio::select! {
            item = upstream.next() => item,
            () = tx.closed() => return,
        };
        match item {
            Some(Ok(chunk)) if chunk.is_empty() => {}
            Some(Ok(chunk)) => {
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
            None => return,
        }
    }
}

async fn pump_outbound<S>(
    mut rx: mpsc::Receiver<KubeResult<Bytes>>,
    mut sink: S,
    deadline: Instant,
) -> RelayOutcome
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut bytes = 0u64;
    while let Some(item) = rx.recv().await {
        match item {
            Ok(chunk) => {
                let len = chunk.len() as u64;
                if let Err(outcome) = write(&mut sink, frame(chunk), deadline).await {
                    return outcome;
                }
                bytes += len;
            }
            Err(e) => {
                warn!(error = %e, "upstream log stream failed");
                let reason = "upstream log stream failed";
                let _ = close(&mut sink, close_code::ERROR, reason, deadline).await;
                return RelayOutcome::UpstreamFailed;
            }
        }
    }

    match close(&mut sink, close_code::NORMAL, "log stream ended", deadline).await {
        Ok(()) => RelayOutcome::Completed { bytes },
        Err(outcome) => outcome,
    }
}

/// One frame per chunk: text when the chunk is valid UTF-8.
fn frame(chunk: Bytes) -> Message {
    match std::str::from_utf8(&chunk) {
        Ok(text) => Message::Text(Utf8Bytes::from(text.to_owned())),
        Err(_) => Message::Binary(chunk),
    }
}

async fn write<S>(sink: &mut S, message: Message, deadline: Instant) -> Result<(), RelayOutcome>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match tokio::time::timeout_at(deadline, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "websocket write failed");
            Err(RelayOutcome::OutboundFailed)
        }
        Err(_) => {
            warn!("websocket write deadline exceeded");
            Err(RelayOutcome::DeadlineExceeded)
        }
    }
}

async fn close<S>(
    sink: &mut S,
    code: u16,
    reason: &'static str,
    deadline: Instant,
) -> Result<(), RelayOutcome>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    };
    write(sink, Message::Close(Some(frame)), deadline).await?;
    match tokio::time::timeout_at(deadline, sink.close()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(RelayOutcome::OutboundFailed),
        Err(_) => Err(RelayOutcome::DeadlineExceeded),
    }
}

/// Resolves once the client closes the connection or it fails.
async fn client_closed<I, E>(inbound: I)
where
    I: Stream<Item = Result<Message, E>>,
    E: Display,
{
    let mut inbound = std::pin::pin!(inbound);
    while let Some(message) = inbound.next().await {
        match message {
            Ok(Message::Close(_)) => {
                debug!("client closed log stream");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "client connection failed");
                return;
            }
        }
    }
}

/// GET /api/v1/namespaces/:namespace/logs/stream?job=&pod=&container=
///
/// The upgrade is accepted only once the caller is authorized, the job is
/// admitted and its cluster is reachable; until then errors are plain HTTP.
pub async fn stream_logs(
    State(state): State<ProxyState>,
    Path(namespace): Path<String>,
    Query(query): Query<LogQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ProxyError> {
    validate_name("namespace", &namespace)?;
    let target = LogTarget::parse(&query)?;

    let worker = bounded(&state, async {
        state
            .authorizer
            .authorize(&headers, &log_access(&namespace, &target.pod))
            .await?;
        admitted_target(&state, &namespace, &target.job).await
    })
    .await?;

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    let WorkerTarget { cluster, worker } = worker;
    let upstream = bounded(&state, async {
        worker
            .pod_logs(&namespace, &target.pod, &target.request(true))
            .await
            .map_err(|e| ProxyError::upstream(&cluster, e))
    })
    .await?;

    let options = RelayOptions {
        buffer_chunks: state.config.stream_buffer_chunks,
        write_deadline: state.config.stream_write_deadline,
    };
    let log_cluster = cluster.clone();
    let pod = target.pod.clone();
    let response = upgrade.on_upgrade(move |socket| async move {
        info!(cluster = %log_cluster, %namespace, %pod, "log stream started");
        let (sink, inbound) = socket.split();
        let outcome = relay(upstream, sink, inbound, options).await;
        info!(cluster = %log_cluster, %namespace, %pod, ?outcome, "log stream finished");
    });
    Ok(with_cluster(response, &cluster))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use futures_util::stream;
    use mkproxy_kube::KubeError;
    use tokio::sync::oneshot;

    type Inbound = stream::Pending<Result<Message, String>>;

    fn options() -> RelayOptions {
        RelayOptions {
            buffer_chunks: 4,
            write_deadline: Duration::from_secs(5),
        }
    }

    fn upstream(chunks: Vec<&'static [u8]>) -> LogStream {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c)))).boxed()
    }

    fn quiet_client() -> Inbound {
        stream::pending()
    }

    fn payload(messages: &[Message]) -> Vec<u8> {
        messages
            .iter()
            .flat_map(|m| match m {
                Message::Text(t) => t.as_str().as_bytes().to_vec(),
                Message::Binary(b) => b.to_vec(),
                _ => Vec::new(),
            })
            .collect()
    }

    fn close_code_of(message: &Message) -> Option<u16> {
        match message {
            Message::Close(Some(frame)) => Some(frame.code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn relays_bytes_then_closes_normally() {
        let (tx, rx) = fmpsc::unbounded::<Message>();
        let outcome = relay(
            upstream(vec![b"line 1\n", b"line 2\n", b"", b"line 3\n"]),
            tx,
            quiet_client(),
            options(),
        )
        .await;

        assert_eq!(outcome, RelayOutcome::Completed { bytes: 21 });
        let messages: Vec<Message> = rx.collect().await;
        // Three data frames, empty chunk skipped, then close.
        assert_eq!(messages.len(), 4);
        assert_eq!(payload(&messages), b"line 1\nline 2\nline 3\n");
        assert_eq!(close_code_of(&messages[3]), Some(close_code::NORMAL));
    }

    #[tokio::test]
    async fn non_utf8_chunks_are_binary_frames() {
        let (tx, rx) = fmpsc::unbounded::<Message>();
        let chunks = upstream(vec![b"ok\n", &[0xff, 0xfe]]);
        let outcome = relay(chunks, tx, quiet_client(), options()).await;

        assert_eq!(outcome, RelayOutcome::Completed { bytes: 5 });
        let messages: Vec<Message> = rx.collect().await;
        assert!(matches!(messages[0], Message::Text(_)));
        assert!(matches!(messages[1], Message::Binary(_)));
    }

    #[tokio::test]
    async fn upstream_failure_sends_error_close() {
        let failing: LogStream = stream::iter(vec![
            Ok(Bytes::from_static(b"partial\n")),
            Err(KubeError::Stream("connection reset".into())),
        ])
        .boxed();
        let (tx, rx) = fmpsc::unbounded::<Message>();
        let outcome = relay(failing, tx, quiet_client(), options()).await;

        assert_eq!(outcome, RelayOutcome::UpstreamFailed);
        let messages: Vec<Message> = rx.collect().await;
        assert_eq!(payload(&messages), b"partial\n");
        assert_eq!(close_code_of(messages.last().unwrap()), Some(close_code::ERROR));
    }

    #[tokio::test]
    async fn client_close_releases_upstream() {
        let (guard, released) = oneshot::channel::<()>();
        let held: LogStream = stream::unfold(guard, |guard| async move {
            futures::future::pending::<()>().await;
            Some((Ok(Bytes::new()), guard))
        })
        .boxed();

        let (client_tx, client_rx) = fmpsc::unbounded::<Result<Message, String>>();
        client_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        let (tx, _rx) = fmpsc::unbounded::<Message>();

        let outcome = relay(held, tx, client_rx, options()).await;
        assert_eq!(outcome, RelayOutcome::ClientClosed);
        // The upstream stream, and the guard it owns, were dropped.
        assert!(released.await.is_err());
    }

    #[tokio::test]
    async fn client_error_ends_relay() {
        let (client_tx, client_rx) = fmpsc::unbounded::<Result<Message, String>>();
        client_tx.unbounded_send(Err("reset by peer".into())).unwrap();
        let (tx, _rx) = fmpsc::unbounded::<Message>();

        let held: LogStream = stream::pending().boxed();
        assert_eq!(relay(held, tx, client_rx, options()).await, RelayOutcome::ClientClosed);
    }

    #[tokio::test]
    async fn dropped_client_sink_is_outbound_failure() {
        let (tx, rx) = fmpsc::unbounded::<Message>();
        drop(rx);
        let outcome = relay(upstream(vec![b"a\n"]), tx, quiet_client(), options()).await;
        assert_eq!(outcome, RelayOutcome::OutboundFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_client_hits_write_deadline() {
        // One slot; nobody reads, so the second write blocks.
        let (tx, _rx) = fmpsc::channel::<Message>(0);
        let endless: LogStream = stream::repeat_with(|| Ok(Bytes::from_static(b"tick\n"))).boxed();
        let opts = RelayOptions {
            buffer_chunks: 2,
            write_deadline: Duration::from_millis(50),
        };
        assert_eq!(relay(endless, tx, quiet_client(), opts).await, RelayOutcome::DeadlineExceeded);
    }
}
