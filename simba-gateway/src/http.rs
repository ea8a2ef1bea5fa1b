//! Static-file HTTP listener.
//!
//! Serves the browser client bundle from the configured directory.
//! Deliberately minimal: no directory listings, no range requests —
//! the UI is a handful of files loaded once.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::info;

#[derive(Clone)]
struct StaticContext {
    root: PathBuf,
    dev_mode: bool,
}

/// Run the static file server until the process exits.
pub async fn run(port: u16, root: PathBuf, dev_mode: bool) -> std::io::Result<()> {
    let context = Arc::new(StaticContext { root, dev_mode });
    let app = Router::new()
        .fallback(get(serve_file))
        .with_state(context);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("http listener on {addr}");
    axum::serve(listener, app).await
}

async fn serve_file(State(context): State<Arc<StaticContext>>, uri: Uri) -> Response {
    let Some(path) = sanitize_path(uri.path()) else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };
    let full = context.root.join(&path);

    let bytes = match tokio::fs::read(&full).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::NOT_FOUND, "not found").into_response(),
    };

    let mime = mime_guess::from_path(&full).first_or_octet_stream();
    let cache = if context.dev_mode {
        "no-cache"
    } else {
        "public, max-age=3600"
    };
    (
        [
            (header::CONTENT_TYPE, mime.as_ref().to_string()),
            (header::CACHE_CONTROL, cache.to_string()),
        ],
        bytes,
    )
        .into_response()
}

/// Map a request path onto a relative file path, refusing traversal.
/// `/` serves `index.html`.
fn sanitize_path(path: &str) -> Option<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    let target = if trimmed.is_empty() { "index.html" } else { trimmed };

    let mut clean = PathBuf::new();
    for component in std::path::Path::new(target).components() {
        match component {
            std::path::Component::Normal(part) => clean.push(part),
            // Anything that can escape the root is refused outright.
            _ => return None,
        }
    }
    Some(clean)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_serves_index() {
        assert_eq!(sanitize_path("/"), Some(PathBuf::from("index.html")));
        assert_eq!(sanitize_path(""), Some(PathBuf::from("index.html")));
    }

    #[test]
    fn plain_paths_pass() {
        assert_eq!(
            sanitize_path("/app/main.js"),
            Some(PathBuf::from("app/main.js"))
        );
    }

    #[test]
    fn traversal_refused() {
        assert_eq!(sanitize_path("/../etc/passwd"), None);
        assert_eq!(sanitize_path("/a/../../b"), None);
    }
}
