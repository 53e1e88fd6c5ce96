//! Per-request attempt loop: select an endpoint, send, stream, fail over, give up.
//!
//! Attempts are strictly sequential. Each attempt gets a fresh [`StreamDecoder`];
//! nothing from a failed attempt is merged into the next one. Lines already
//! delivered to the client are never retracted, so a client may see a partial
//! answer followed by a new answer (or a terminal error line).

use crate::config::RetryPolicy;
use crate::decoder::{DecodeError, StreamDecoder};
use crate::pool::EndpointPool;
use crate::request::{ConversationRequest, RequestBuilder};
use crate::restream::{self, GENERIC_ERROR_MESSAGE};
use crate::upstream::{self, UpstreamCallError, UpstreamErrorKind};
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::time::Instant;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pending,
    Success,
    Timeout,
    Error,
    ClientDisconnected,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::ClientDisconnected => "client_disconnected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptState {
    pub endpoint_index: usize,
    pub attempts: usize,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, thiserror::Error)]
pub enum AttemptFailure {
    #[error(transparent)]
    Upstream(UpstreamCallError),
    #[error("stream aborted: {0}")]
    Stream(UpstreamCallError),
    #[error("malformed upstream record: {0}")]
    Decode(#[from] DecodeError),
    #[error("malformed event stream: {0}")]
    Framing(String),
    #[error("upstream closed the stream without any records")]
    EmptyStream,
}

impl AttemptFailure {
    fn outcome(&self) -> AttemptOutcome {
        match self {
            Self::Upstream(err) if err.kind == UpstreamErrorKind::Timeout => {
                AttemptOutcome::Timeout
            }
            _ => AttemptOutcome::Error,
        }
    }
}

impl RetryPolicy {
    /// Whether `failure` may move on to the next endpoint. Failures after the
    /// response started streaming always may; the budget still applies.
    pub fn allows(&self, failure: &AttemptFailure) -> bool {
        match failure {
            AttemptFailure::Upstream(err) => match err.kind {
                UpstreamErrorKind::Timeout => true,
                UpstreamErrorKind::Http => self.retry_on_status,
                UpstreamErrorKind::Transport => self.retry_on_transport,
            },
            AttemptFailure::Stream(_)
            | AttemptFailure::Decode(_)
            | AttemptFailure::Framing(_)
            | AttemptFailure::EmptyStream => true,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    Completed,
    ClientGone,
}

pub struct FailoverController {
    pool: EndpointPool,
    builder: RequestBuilder,
    http: reqwest::Client,
    retry: RetryPolicy,
    timeout_ms: u64,
    conversation_id: String,
}

impl FailoverController {
    pub fn new(
        pool: EndpointPool,
        builder: RequestBuilder,
        http: reqwest::Client,
        retry: RetryPolicy,
        timeout_ms: u64,
    ) -> Self {
        Self {
            pool,
            builder,
            http,
            retry,
            timeout_ms,
            conversation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Drives one conversation to completion, writing every line to `tx`.
    /// Ends with either a finished answer or exactly one terminal error line.
    pub async fn run(self, req: ConversationRequest, tx: mpsc::Sender<String>) -> AttemptState {
        let budget = self.pool.len();
        let mut state = AttemptState {
            endpoint_index: self.pool.initial_index(),
            attempts: 0,
            outcome: AttemptOutcome::Pending,
        };
        let started_at = Instant::now();

        loop {
            state.attempts += 1;
            let endpoint = self.pool.select(state.endpoint_index);
            let out = self.builder.build(&req, endpoint);
            let attempt_started = Instant::now();
            tracing::info!(
                conversation_id = %self.conversation_id,
                attempt = state.attempts,
                endpoint_index = state.endpoint_index,
                resource = %endpoint.resource,
                deployment = %endpoint.deployment,
                "sending upstream request"
            );

            let result = tokio::select! {
                _ = tx.closed() => Ok(StreamEnd::ClientGone),
                opened = upstream::open_stream(&self.http, &out, self.timeout_ms) => match opened {
                    Ok(resp) => {
                        tracing::debug!(
                            conversation_id = %self.conversation_id,
                            elapsed_ms = attempt_started.elapsed().as_millis() as u64,
                            "upstream responded, streaming body"
                        );
                        self.stream_attempt(resp, &tx).await
                    }
                    Err(err) => Err(AttemptFailure::Upstream(err)),
                },
            };

            match result {
                Ok(StreamEnd::Completed) => {
                    state.outcome = AttemptOutcome::Success;
                    record_attempt(state.endpoint_index, state.outcome);
                    tracing::info!(
                        conversation_id = %self.conversation_id,
                        attempt = state.attempts,
                        endpoint_index = state.endpoint_index,
                        elapsed_ms = started_at.elapsed().as_millis() as u64,
                        "conversation stream completed"
                    );
                    return state;
                }
                Ok(StreamEnd::ClientGone) => {
                    state.outcome = AttemptOutcome::ClientDisconnected;
                    record_attempt(state.endpoint_index, state.outcome);
                    tracing::debug!(
                        conversation_id = %self.conversation_id,
                        attempt = state.attempts,
                        endpoint_index = state.endpoint_index,
                        "client disconnected, releasing upstream"
                    );
                    return state;
                }
                Err(failure) => {
                    state.outcome = failure.outcome();
                    record_attempt(state.endpoint_index, state.outcome);
                    tracing::warn!(
                        conversation_id = %self.conversation_id,
                        attempt = state.attempts,
                        endpoint_index = state.endpoint_index,
                        resource = %endpoint.resource,
                        elapsed_ms = attempt_started.elapsed().as_millis() as u64,
                        error = %failure,
                        "upstream attempt failed"
                    );
                    if !self.retry.allows(&failure) || state.attempts >= budget {
                        break;
                    }
                    state.endpoint_index = self.pool.next(state.endpoint_index);
                }
            }
        }

        tracing::error!(
            conversation_id = %self.conversation_id,
            attempts = state.attempts,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "giving up on conversation"
        );
        metrics::counter!("chatrelay_conversation_give_ups_total").increment(1);
        let _ = tx.send(restream::error_line(GENERIC_ERROR_MESSAGE)).await;
        state
    }

    async fn stream_attempt(
        &self,
        resp: reqwest::Response,
        tx: &mpsc::Sender<String>,
    ) -> Result<StreamEnd, AttemptFailure> {
        relay_events(resp.bytes_stream(), tx).await
    }
}

/// Feeds each upstream event's data to a fresh decoder and forwards the snapshots.
/// Comments and other non-data fields never reach the decoder.
async fn relay_events<S, B, E>(
    body: S,
    tx: &mpsc::Sender<String>,
) -> Result<StreamEnd, AttemptFailure>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut decoder = StreamDecoder::new();
    let mut emitted = 0usize;
    let mut events = std::pin::pin!(body.eventsource());

    loop {
        let next = tokio::select! {
            _ = tx.closed() => return Ok(StreamEnd::ClientGone),
            next = events.next() => next,
        };
        let Some(event) = next else { break };
        let event = event.map_err(event_failure)?;
        if !forward_line(&mut decoder, &event.data, tx, &mut emitted).await? {
            return Ok(StreamEnd::ClientGone);
        }
        if decoder.is_finished() {
            break;
        }
    }

    if emitted == 0 {
        return Err(AttemptFailure::EmptyStream);
    }
    Ok(StreamEnd::Completed)
}

fn event_failure<E: Display>(err: EventStreamError<E>) -> AttemptFailure {
    match err {
        EventStreamError::Transport(err) => AttemptFailure::Stream(UpstreamCallError::new(
            UpstreamErrorKind::Transport,
            None,
            err.to_string(),
        )),
        EventStreamError::Utf8(err) => AttemptFailure::Framing(err.to_string()),
        EventStreamError::Parser(err) => AttemptFailure::Framing(err.to_string()),
    }
}

/// Decodes one record and sends what it produced. `Ok(false)` means the client is gone.
async fn forward_line(
    decoder: &mut StreamDecoder,
    line: &str,
    tx: &mpsc::Sender<String>,
    emitted: &mut usize,
) -> Result<bool, AttemptFailure> {
    if decoder.is_finished() {
        return Ok(true);
    }
    let Some(decoded) = decoder.decode(line)? else {
        return Ok(true);
    };
    if let Some(err) = &decoded.upstream_error {
        if tx.send(restream::emit(err)).await.is_err() {
            return Ok(false);
        }
        *emitted += 1;
    }
    if tx.send(restream::emit(&decoded.snapshot)).await.is_err() {
        return Ok(false);
    }
    *emitted += 1;
    Ok(true)
}

fn record_attempt(endpoint_index: usize, outcome: AttemptOutcome) {
    metrics::counter!(
        "chatrelay_upstream_attempts_total",
        "endpoint" => endpoint_index.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}
