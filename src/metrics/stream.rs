use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::AppState;

/// Push interval of the overview stream.
pub const STREAM_INTERVAL: Duration = Duration::from_secs(5);

// ─── GET /api/monitoring/stream ──────────────────────────────────
/// Server-Sent Events endpoint.
/// Pushes the API overview as JSON immediately and then every 5 s until the
/// client disconnects or the server shuts down. A failed read skips that tick.

pub async fn overview_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<ReceiverStream<Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(4);
    let aggregator = state.aggregator.clone();
    let mut shutdown = state.shutdown.subscribe();

    tokio::spawn(async move {
        if *shutdown.borrow_and_update() {
            return;
        }
        let mut interval = tokio::time::interval(STREAM_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    debug!("overview stream closed for shutdown");
                    break;
                }
            }
            let overview = match aggregator.api_overview().await {
                Ok(overview) => overview,
                Err(err) => {
                    warn!(error = %err, "overview stream tick failed");
                    continue;
                }
            };
            let event = match Event::default().event("overview").json_data(&overview) {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "could not encode overview event");
                    continue;
                }
            };
            if tx.send(Ok(event)).await.is_err() {
                debug!("overview stream client disconnected");
                break;
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
