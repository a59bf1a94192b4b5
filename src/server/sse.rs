//! Cursor-polling Server-Sent Event streams.
//!
//! Both event feeds are backed by the database rather than a broadcast
//! channel: each tick reads rows past the cursor, so a reconnecting client
//! resumes exactly where it left off.

use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

use axum::response::sse::{Event, Sse};
use futures::{Stream, StreamExt, stream};

/// Comment sent when the stream opens.
pub fn connected() -> Event {
    Event::default().comment("connected")
}

/// Comment sent on an idle tick.
pub fn keepalive() -> Event {
    Event::default().comment("keepalive")
}

/// Terminal `error` frame.
pub fn error_event(message: &str) -> Event {
    Event::default()
        .event("error")
        .data(serde_json::json!({ "error": message }).to_string())
}

/// Poll `fetch(cursor)` every `interval`.
///
/// `Ok((frames, next))` emits the frames (or a keepalive when empty) and
/// moves the cursor; `Err(frame)` emits that frame and ends the stream.
pub fn poll_stream<F, Fut>(
    cursor: i64,
    interval: Duration,
    fetch: F,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>
where
    F: Fn(i64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(Vec<Event>, i64), Event>> + Send + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let polls = stream::unfold(Some((cursor, ticker, fetch)), |state| async move {
        let (cursor, mut ticker, fetch) = state?;
        ticker.tick().await;
        match fetch(cursor).await {
            Ok((frames, next)) if frames.is_empty() => {
                Some((vec![keepalive()], Some((next, ticker, fetch))))
            }
            Ok((frames, next)) => Some((frames, Some((next, ticker, fetch)))),
            Err(last) => Some((vec![last], None)),
        }
    })
    .flat_map(|frames| stream::iter(frames.into_iter().map(Ok)));

    Sse::new(stream::once(async { Ok(connected()) }).chain(polls))
}
