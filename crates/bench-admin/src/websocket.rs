/// WebSocket change subscription.
///
/// /ws/feed carries one text frame per `FeedEvent`:
///   on connect      the current experiment list
///   status tick     experiments / countdown / completed when versions moved
///   publish tick    aggregates, relayed from the broadcast channel

use std::sync::atomic::Ordering;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use bench_protocol::feed::FeedEvent;
use bench_protocol::now_ms;

use crate::state::AppState;

/// Handler for /ws/feed
pub async fn ws_feed_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_feed_ws(socket, state))
}

async fn handle_feed_ws(mut socket: WebSocket, state: AppState) {
    let clients = state.inner.ws_client_count.fetch_add(1, Ordering::Relaxed) + 1;
    info!(clients, "feed client connected");

    let (mut cursor, mut rx) = state.inner.feed.subscribe();

    // Send initial experiment list
    if send_event(&mut socket, &state.inner.feed.experiments_event()).await {
        let mut interval = tokio::time::interval(state.inner.config.feed.status_interval());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let events = state.inner.feed.poll(&mut cursor, now_ms());
                    let mut open = true;
                    for event in &events {
                        if !send_event(&mut socket, event).await {
                            open = false;
                            break;
                        }
                    }
                    if !open {
                        break;
                    }
                }
                result = rx.recv() => {
                    match result {
                        Ok(text) => {
                            if socket.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("feed client lagged by {n} snapshots");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                incoming = socket.recv() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(Message::Ping(data))) => {
                            if socket.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            debug!(error = %e, "feed socket error");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    let remaining = state
        .inner
        .ws_client_count
        .fetch_sub(1, Ordering::Relaxed)
        .saturating_sub(1);
    info!(clients = remaining, "feed client disconnected");
}

/// Serialize and send one event. Returns false once the client is gone.
async fn send_event(socket: &mut WebSocket, event: &FeedEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!(kind = event.kind(), error = %e, "failed to serialize feed event");
            return true;
        }
    };
    debug!(kind = event.kind(), "feed event");
    socket.send(Message::Text(text.into())).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::sync::Arc;
    use std::time::Duration;

    use bench_protocol::experiment::{BrokerKind, NewExperiment};
    use bench_protocol::metrics::{Concentrations, MetricMessage};

    use crate::api::build_router;
    use crate::api::config::BenchConfig;
    use crate::launcher::NoopLauncher;

    type Client = tungstenite::WebSocket<TcpStream>;

    async fn serve() -> (AppState, std::net::SocketAddr) {
        let mut config = BenchConfig::default();
        config.feed.status_interval_ms = 20;
        let state = AppState::new(config, Arc::new(NoopLauncher));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (state, addr)
    }

    fn connect(addr: std::net::SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let url = format!("ws://{addr}{}", bench_protocol::FEED_PATH);
        tungstenite::client(url, stream).ok().expect("websocket handshake").0
    }

    fn next_event(client: &mut Client) -> FeedEvent {
        loop {
            match client.read().unwrap() {
                tungstenite::Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_feed_socket_relays_changes_and_snapshots() {
        let (state, addr) = serve().await;
        let observer = state.clone();

        let frames = tokio::task::spawn_blocking(move || {
            let mut client = connect(addr);
            let initial = next_event(&mut client);
            assert_eq!(observer.ws_clients(), 1);

            observer
                .inner
                .scheduler
                .add(NewExperiment {
                    id: Some("e1".into()),
                    name: None,
                    broker: BrokerKind::RabbitMq,
                    producers: 1,
                    consumers: 1,
                    duration_secs: 60,
                })
                .unwrap();
            let listed = next_event(&mut client);

            observer.inner.aggregator.record(
                &MetricMessage {
                    station_id: "a".into(),
                    timestamp_ms: 1_000,
                    coordinates: None,
                    concentrations: Concentrations::default(),
                },
                1_010,
            );
            assert!(observer.inner.feed.publish_snapshot().is_some());
            let aggregates = next_event(&mut client);

            client.close(None).unwrap();
            let _ = client.flush();
            (initial, listed, aggregates)
        })
        .await
        .unwrap();

        match frames.0 {
            FeedEvent::Experiments { experiments } => assert!(experiments.is_empty()),
            other => panic!("unexpected initial frame {other:?}"),
        }
        match frames.1 {
            FeedEvent::Experiments { experiments } => assert_eq!(experiments[0].id, "e1"),
            other => panic!("unexpected change frame {other:?}"),
        }
        match frames.2 {
            FeedEvent::Aggregates { snapshot } => assert_eq!(snapshot.message_count(), 1),
            other => panic!("unexpected snapshot frame {other:?}"),
        }

        for _ in 0..100 {
            if state.ws_clients() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("feed client was never released");
    }
}
