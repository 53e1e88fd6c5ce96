use crate::app::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use mime_guess::MimeGuess;
use std::path::{Component, Path};

async fn asset_response(root: &Path, path: &str) -> Response {
    let Some(full) = resolve(root, path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match tokio::fs::read(&full).await {
        Ok(contents) => {
            let mime: MimeGuess = mime_guess::from_path(path);
            let content_type = mime.first_or_octet_stream();
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type.as_ref())
                .body(Body::from(contents))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Joins `path` under `root`, refusing anything that climbs out of it.
fn resolve(root: &Path, path: &str) -> Option<std::path::PathBuf> {
    let relative = Path::new(path);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(relative))
}

/// Serves the built web client: `/`, `/favicon.ico`, `/assets/*`, and
/// `index.html` for any other GET so client-side routes still load.
pub async fn frontend_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    if req.method() != Method::GET {
        return StatusCode::NOT_FOUND.into_response();
    }

    let root = state.runtime.static_dir.as_path();
    let path = req.uri().path().trim_start_matches('/');
    if path.is_empty() {
        return asset_response(root, "index.html").await;
    }
    if path.starts_with("assets/") || path == "favicon.ico" {
        return asset_response(root, path).await;
    }
    if let Some(full) = resolve(root, path) {
        if tokio::fs::metadata(&full).await.is_ok_and(|m| m.is_file()) {
            return asset_response(root, path).await;
        }
    }

    asset_response(root, "index.html").await
}

#[cfg(test)]
mod tests {
    use super::resolve;
    use std::path::Path;

    #[test]
    fn resolve_rejects_parent_components() {
        let root = Path::new("/srv/static");
        assert!(resolve(root, "../secret").is_none());
        assert!(resolve(root, "assets/../../etc/passwd").is_none());
        assert_eq!(
            resolve(root, "assets/app.js"),
            Some(Path::new("/srv/static/assets/app.js").to_path_buf())
        );
    }
}
