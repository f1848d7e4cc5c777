//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use herald_core::{ConnectionId, SubProtocol};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::handler::{CLOSE_GOING_AWAY, Flow, SessionHandler};
use crate::connection::OutboundFrame;
use crate::execution::{GraphQLExecutor, RequestInfo};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::router::RouterHandle;

/// How long a closing session waits for queued frames to be written.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared dependencies of every session.
pub struct SessionState<E: GraphQLExecutor> {
    /// GraphQL engine.
    pub executor: Arc<E>,
    /// Router inbox.
    pub router: RouterHandle<E::Context>,
    /// Keep-alive period, `None` to disable.
    pub keep_alive: Option<Duration>,
    /// Outbound frames buffered per socket.
    pub send_queue_capacity: usize,
    /// Cancelled on server shutdown.
    pub shutdown: CancellationToken,
}

impl<E: GraphQLExecutor> Clone for SessionState<E> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
            router: self.router.clone(),
            keep_alive: self.keep_alive,
            send_queue_capacity: self.send_queue_capacity,
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Run a WebSocket session for an upgraded socket.
///
/// 1. Spawns a writer task draining the outbound queue, with keep-alives
/// 2. Dispatches client frames through [`SessionHandler`]
/// 3. On close, terminate or shutdown, disconnects from the router and lets
///    the writer flush
#[instrument(skip_all, fields(connection_id = %connection_id, protocol = protocol.name()))]
pub async fn run_ws_session<E: GraphQLExecutor>(
    socket: WebSocket,
    connection_id: ConnectionId,
    protocol: &'static dyn SubProtocol,
    info: RequestInfo,
    state: SessionState<E>,
) {
    let (sink, mut stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel(state.send_queue_capacity.max(1));
    let acknowledged = Arc::new(AtomicBool::new(false));

    let started = Instant::now();
    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL, "protocol" => protocol.name()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let mut writer = tokio::spawn(write_frames(
        sink,
        out_rx,
        protocol,
        state.keep_alive,
        Arc::clone(&acknowledged),
    ));

    let mut handler = SessionHandler::new(
        connection_id,
        protocol,
        Arc::new(info),
        Arc::clone(&state.executor),
        state.router.clone(),
        out_tx,
        acknowledged,
    );

    loop {
        let message = tokio::select! {
            () = state.shutdown.cancelled() => {
                let _ = handler.close(CLOSE_GOING_AWAY, "Server shutting down").await;
                break;
            }
            message = stream.next() => message,
        };

        let text = match message {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!(len = data.len(), "non-UTF8 binary frame ignored");
                    continue;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                debug!("client closed the socket");
                break;
            }
            Some(Err(error)) => {
                debug!(error = %error, "socket read failed");
                break;
            }
        };

        if handler.handle_text(&text).await == Flow::Close {
            break;
        }
    }

    // the router drops its copy of the queue on disconnect, ending the writer
    handler.finish();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    info!("client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}

/// Keep-alive ticker that first fires one full period from now.
fn keep_alive_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn next_tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            let _ = ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Drain the outbound queue onto the socket.
///
/// Keep-alives are only sent once the connection is acknowledged. Ends when
/// a close frame is written, the socket fails, or every sender is gone.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundFrame>,
    protocol: &'static dyn SubProtocol,
    keep_alive: Option<Duration>,
    acknowledged: Arc<AtomicBool>,
) {
    let mut ticker = keep_alive.map(keep_alive_ticker);
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(OutboundFrame::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(OutboundFrame::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code,
                        reason: Utf8Bytes::from_static(reason),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            () = next_tick(ticker.as_mut()) => {
                if !acknowledged.load(Ordering::Acquire) {
                    continue;
                }
                let ping = protocol.keep_alive().to_json();
                if sink.send(Message::Text(ping.into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
