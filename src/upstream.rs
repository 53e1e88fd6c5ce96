use crate::request::OutboundRequest;
use axum::http::StatusCode;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// No response headers within the deadline.
    Timeout,
    /// DNS, connect, TLS or mid-body transport failure.
    Transport,
    /// Non-success status or an unreadable body.
    Http,
}

impl UpstreamErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Http => "http",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{} upstream failure: {message}", .kind.as_str())]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            UpstreamErrorKind::Timeout
        } else {
            UpstreamErrorKind::Transport
        };
        let status = err
            .status()
            .and_then(|s| StatusCode::from_u16(s.as_u16()).ok());
        Self::new(kind, status, err.to_string())
    }
}

/// Sends the request and waits for response headers, bounded by `timeout_ms`.
/// The body is left unread so the caller can stream it.
pub async fn open_stream(
    client: &reqwest::Client,
    out: &OutboundRequest,
    timeout_ms: u64,
) -> Result<reqwest::Response, UpstreamCallError> {
    let resp = send_with_deadline(client, out, timeout_ms).await?;
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    if !status.is_success() {
        // Bounded by the same deadline as the headers.
        let text = tokio::time::timeout(Duration::from_millis(timeout_ms), resp.text())
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();
        let code = extract_error_code(&text);
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("upstream status {}: {}", status, text),
        )
        .with_code(code));
    }
    Ok(resp)
}

/// Single blocking exchange used when streaming is disabled. The upstream status
/// is returned as-is alongside its JSON body.
pub async fn call_once(
    client: &reqwest::Client,
    out: &OutboundRequest,
    timeout_ms: u64,
) -> Result<(StatusCode, Value), UpstreamCallError> {
    let resp = send_with_deadline(client, out, timeout_ms).await?;
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let text = resp.text().await.map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Transport, Some(status), err.to_string())
    })?;
    let value: Value = serde_json::from_str(&text).map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Http, Some(status), err.to_string())
    })?;
    Ok((status, value))
}

async fn send_with_deadline(
    client: &reqwest::Client,
    out: &OutboundRequest,
    timeout_ms: u64,
) -> Result<reqwest::Response, UpstreamCallError> {
    let mut req = client.post(&out.url);
    for (name, value) in &out.headers {
        req = req.header(*name, value.as_str());
    }
    req = req.json(&out.payload);
    match tokio::time::timeout(Duration::from_millis(timeout_ms), req.send()).await {
        Ok(Ok(resp)) => Ok(resp),
        Ok(Err(err)) => Err(UpstreamCallError::from_reqwest(err)),
        Err(_) => Err(UpstreamCallError::new(
            UpstreamErrorKind::Timeout,
            None,
            format!("no response within {timeout_ms}ms"),
        )),
    }
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("code"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_error_code_reads_nested_code() {
        assert_eq!(
            extract_error_code(r#"{"error":{"code":"429","message":"slow down"}}"#),
            Some("429".to_string())
        );
        assert_eq!(extract_error_code("not json"), None);
    }
}
