//! Server-sent event streams over live views
//!
//! Each connection owns one [`LiveView`]. The stream sends a `snapshot`
//! event with the full collection on connect and after every change. When
//! the change stream drops it sends `stale` and ends, and the client
//! reconnects. Disconnecting drops the view, which releases its subscription.

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use tokio::sync::watch;

use crate::app::AppState;
use crate::error::MarketResult;
use crate::store::Query;
use crate::sync::{LiveEntity, LiveView};

enum Phase {
    Initial,
    Streaming,
    Done,
}

struct Session<T: LiveEntity> {
    view: LiveView<T>,
    revisions: watch::Receiver<u64>,
    phase: Phase,
}

fn snapshot_event<T: LiveEntity>(view: &LiveView<T>, name: &str) -> Event {
    Event::default()
        .event(name)
        .json_data(view.snapshot())
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to encode live snapshot");
            Event::default().event("error")
        })
}

/// Open a live view over `query` and stream it as SSE.
pub async fn open<T: LiveEntity>(
    state: &AppState,
    query: Query,
) -> MarketResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let view = LiveView::<T>::open(state.store.clone(), state.changes.clone(), query).await?;
    Ok(stream_view(view))
}

pub fn stream_view<T: LiveEntity>(view: LiveView<T>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session = Session {
        revisions: view.watch(),
        view,
        phase: Phase::Initial,
    };

    let events = stream::unfold(session, |mut session| async move {
        match session.phase {
            Phase::Done => None,
            Phase::Initial => {
                session.revisions.borrow_and_update();
                session.phase = Phase::Streaming;
                let event = snapshot_event(&session.view, "snapshot");
                Some((Ok(event), session))
            }
            Phase::Streaming => {
                if session.revisions.changed().await.is_err() {
                    return None;
                }
                if session.view.is_stale() {
                    session.phase = Phase::Done;
                    return Some((Ok(snapshot_event(&session.view, "stale")), session));
                }
                let event = snapshot_event(&session.view, "snapshot");
                Some((Ok(event), session))
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
