//! SSE response plumbing.
//!
//! All streaming endpoints use `text/event-stream` with `data: {json}\n\n`
//! framing plus the headers that keep intermediate proxies from buffering or
//! dropping the connection.

use crate::emitter::envelope::Envelope;
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use std::convert::Infallible;

/// Wrap an envelope stream in an SSE response with anti-buffering headers.
pub fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Envelope> + Send + 'static,
{
    let events = stream.map(|envelope| Ok::<_, Infallible>(Event::default().data(envelope.json())));
    let mut response = Sse::new(events).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::envelope::EventType;
    use serde_json::json;

    #[tokio::test]
    async fn response_carries_stream_headers() {
        let envelope = Envelope::new(EventType::GraphStart, "t1", "chat", 1, None, json!({}));
        let response = sse_response(futures::stream::iter(vec![envelope]));
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-cache");
        assert_eq!(response.headers().get("x-accel-buffering").unwrap(), "no");
    }
}
