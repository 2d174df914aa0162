//! Server-sent event stream over `reqwest-eventsource`.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use reqwest_eventsource::{Event, EventSource};

use super::api::{EventStreamConnector, SseFrame, StreamSignal};
use super::client::{ApiClient, check_status};
use crate::{Error, Result};

fn frame(msg: eventsource_stream::Event) -> SseFrame {
    SseFrame {
        event: if msg.event.is_empty() {
            "message".to_string()
        } else {
            msg.event
        },
        data: msg.data,
    }
}

async fn map_error(err: reqwest_eventsource::Error) -> Error {
    match err {
        reqwest_eventsource::Error::Transport(e) => Error::Http(e),
        reqwest_eventsource::Error::InvalidStatusCode(_, response) => {
            let url = response.url().to_string();
            match check_status(response, &url, true).await {
                Err(e) => e,
                Ok(response) => Error::HttpStatus {
                    status: response.status().as_u16(),
                    url,
                },
            }
        }
        other => Error::Other(format!("event stream: {other}")),
    }
}

#[async_trait]
impl EventStreamConnector for ApiClient {
    async fn connect(&self) -> Result<BoxStream<'static, Result<StreamSignal>>> {
        let request = self.stream_request()?;
        let source = EventSource::new(request)
            .map_err(|e| Error::Other(format!("cannot open event stream: {e}")))?;

        // EventSource reconnects on its own; close it on the first error so the
        // notification channel owns the backoff policy.
        let signals = stream::unfold(Some(source), |state| async move {
            let mut source = state?;
            match source.next().await {
                Some(Ok(Event::Open)) => Some((Ok(StreamSignal::Open), Some(source))),
                Some(Ok(Event::Message(msg))) => {
                    Some((Ok(StreamSignal::Frame(frame(msg))), Some(source)))
                }
                Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => {
                    source.close();
                    None
                }
                Some(Err(e)) => {
                    source.close();
                    Some((Err(map_error(e).await), None))
                }
            }
        });

        Ok(signals.boxed())
    }
}
