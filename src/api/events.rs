/// Live status stream
///
/// Server-sent events over the engine's broadcast sink. Each SSE message is
/// named after the event kind (`node` or `run`) and carries the JSON event.

use crate::api::deployments::AppState;
use crate::runtime::events::StatusEvent;
use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use std::convert::Infallible;
use tokio::sync::broadcast::{self, error::RecvError};

#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    pub run_id: Option<String>,
    pub workflow_id: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &StatusEvent) -> bool {
        let (run_id, workflow_id) = match event {
            StatusEvent::Node { run_id, workflow_id, .. }
            | StatusEvent::Run { run_id, workflow_id, .. } => (run_id, workflow_id),
        };
        self.run_id.as_ref().map_or(true, |id| id == run_id)
            && self.workflow_id.as_ref().map_or(true, |id| id == workflow_id)
    }
}

pub fn create_event_routes() -> Router<AppState> {
    Router::new().route("/api/events", get(stream_events))
}

/// GET /api/events?run_id=...&workflow_id=...
async fn stream_events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!("📺 Status stream opened");
    Sse::new(event_stream(state.events.subscribe(), filter)).keep_alive(KeepAlive::default())
}

/// Turn a broadcast receiver into an SSE stream; lagged subscribers skip
/// ahead, the stream ends when the sink goes away
pub fn event_stream(
    receiver: broadcast::Receiver<StatusEvent>,
    filter: EventFilter,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((receiver, filter), |(mut receiver, filter)| async move {
        loop {
            match receiver.recv().await {
                Ok(event) if filter.matches(&event) => {
                    let sse = to_sse(&event);
                    return Some((Ok(sse), (receiver, filter)));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("⚠️ Status stream lagged, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

fn to_sse(event: &StatusEvent) -> Event {
    let name = match event {
        StatusEvent::Node { .. } => "node",
        StatusEvent::Run { .. } => "run",
    };
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(name).data(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::events::{BroadcastSink, StatusSink};
    use crate::runtime::run::RunStatus;
    use futures::StreamExt;

    fn run_event(run_id: &str, status: RunStatus) -> StatusEvent {
        StatusEvent::Run {
            run_id: run_id.to_string(),
            workflow_id: "wf".to_string(),
            status,
            failure: None,
        }
    }

    #[test]
    fn filter_matches_on_run_and_workflow() {
        let event = run_event("r1", RunStatus::Running);
        assert!(EventFilter::default().matches(&event));
        let by_run = EventFilter { run_id: Some("r1".into()), workflow_id: None };
        assert!(by_run.matches(&event));
        let other = EventFilter { run_id: None, workflow_id: Some("other".into()) };
        assert!(!other.matches(&event));
    }

    #[tokio::test]
    async fn stream_skips_filtered_events_and_ends_with_the_sink() {
        let sink = BroadcastSink::new(16);
        let filter = EventFilter { run_id: Some("r2".into()), workflow_id: None };
        let stream = event_stream(sink.subscribe(), filter);

        sink.publish(run_event("r1", RunStatus::Success));
        sink.publish(run_event("r2", RunStatus::Success));
        drop(sink);

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 1);
    }
}
