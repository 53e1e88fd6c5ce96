use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::failover::FailoverController;
use crate::request::{ClientConversation, ConversationRequest};
use crate::restream::{self, GENERIC_ERROR_MESSAGE};
use crate::upstream::{self, UpstreamCallError, UpstreamErrorKind};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;

/// Snapshot lines buffered between the upstream reader and the client writer.
const STREAM_CHANNEL_CAPACITY: usize = 64;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn conversation(
    State(state): State<AppState>,
    method: Method,
    body: Bytes,
) -> AppResult<Response> {
    if method != Method::POST {
        // Connectivity probe: an empty stream.
        return Ok(event_stream(Body::empty()));
    }

    let client: ClientConversation = serde_json::from_slice(&body).map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, "invalid_conversation", err.to_string())
            .with_param("messages")
    })?;
    let req = ConversationRequest::from_client(client.messages, &state.conversation);
    tracing::info!(
        turns = req.messages.len(),
        use_data = req.data_source.is_some(),
        stream = req.stream,
        "conversation request received"
    );

    if !req.stream {
        return forward_nonstream(&state, req).await;
    }

    let (tx, rx) = mpsc::channel::<String>(STREAM_CHANNEL_CAPACITY);
    let controller = FailoverController::new(
        state.pool.clone(),
        state.builder.clone(),
        state.http.clone(),
        state.conversation.retry,
        state.conversation.request_timeout_ms,
    );
    tokio::spawn(async move {
        let outcome = controller.run(req, tx).await;
        tracing::debug!(
            attempts = outcome.attempts,
            endpoint_index = outcome.endpoint_index,
            outcome = outcome.outcome.as_str(),
            "conversation finished"
        );
    });
    Ok(event_stream(Body::from_stream(restream::body_stream(rx))))
}

async fn forward_nonstream(state: &AppState, req: ConversationRequest) -> AppResult<Response> {
    let index = state.pool.initial_index();
    let endpoint = state.pool.select(index);
    let out = state.builder.build(&req, endpoint);
    tracing::info!(
        endpoint_index = index,
        resource = %endpoint.resource,
        "forwarding non-streaming conversation"
    );
    let (status, value) =
        upstream::call_once(&state.http, &out, state.conversation.request_timeout_ms)
            .await
            .map_err(upstream_error_to_app)?;
    let text = serde_json::to_string(&value)
        .unwrap_or_default()
        .replace('\n', "\\n");
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
        .body(Body::from(text))
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "response_build_failed",
                err.to_string(),
            )
        })
}

fn event_stream(body: Body) -> Response {
    (
        [(header::CONTENT_TYPE, mime::TEXT_EVENT_STREAM.as_ref())],
        body,
    )
        .into_response()
}

fn upstream_error_to_app(err: UpstreamCallError) -> AppError {
    tracing::warn!(kind = err.kind.as_str(), status = ?err.status, code = ?err.code, "{}", err.message);
    let status = match err.kind {
        UpstreamErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    AppError::new(status, "upstream_error", GENERIC_ERROR_MESSAGE).with_type("upstream_error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_errors_do_not_leak_details() {
        let err = UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(StatusCode::UNAUTHORIZED),
            "upstream status 401: key abc123 rejected".to_string(),
        );
        let app = upstream_error_to_app(err);
        assert_eq!(app.status, StatusCode::BAD_GATEWAY);
        assert_eq!(app.message, GENERIC_ERROR_MESSAGE);
    }

    #[test]
    fn timeouts_map_to_gateway_timeout() {
        let err = UpstreamCallError::new(UpstreamErrorKind::Timeout, None, "slow".to_string());
        assert_eq!(upstream_error_to_app(err).status, StatusCode::GATEWAY_TIMEOUT);
    }
}
