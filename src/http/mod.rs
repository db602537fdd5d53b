//! HTTP shell.
//!
//! One axum endpoint serves all three protocols: `POST /` carries the
//! queue service (`x-amz-json-1.0` + `x-amz-target`) and the topic service
//! (form-urlencoded `Action`), everything else is routed to the object
//! service. Virtual-hosted-style object requests are rewritten to
//! path-style before routing. This layer owns all wire-format concerns;
//! the core only ever sees decoded structs.

pub mod s3;
pub mod sns;
pub mod sqs;
pub mod xml;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::{debug, error};
use uuid::Uuid;

use crate::app::App;
use crate::error::{Fault, ServiceError};

use xml::{text_element, XML_DECL};

/// Build the router (separated from serving for tests).
pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(dispatch)
        .with_state(app)
}

/// Bind and serve until the process exits.
pub async fn serve(app: Arc<App>) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{}", app.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(port = listener.local_addr()?.port(), "listening");
    axum::serve(listener, router(app)).await
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn dispatch(State(app): State<Arc<App>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(error) => {
            error!(%error, "failed to read request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let path = rewrite_virtual_host(&app, &parts.headers, &parts.uri);
    debug!(method = %parts.method, path = %path, "dispatching request");

    if path == "/" && parts.method == Method::POST {
        let content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if content_type.starts_with("application/x-amz-json-1.0") {
            return sqs::handle(&app, &parts.headers, &body).await;
        }
        return sns::handle(&app, &parts.headers, &body).await;
    }

    s3::handle(&app, &parts.method, &path, parts.uri.query(), &parts.headers, body).await
}

/// Turn `bucket.s3.host/key` into `/bucket/key`. The first Host label is
/// treated as a bucket when the remainder is an object-service host
/// (`s3.…`) or the configured external host.
fn rewrite_virtual_host(app: &App, headers: &HeaderMap, uri: &Uri) -> String {
    let path = uri.path().to_string();
    let Some(host) = headers.get(HOST).and_then(|v| v.to_str().ok()) else {
        return path;
    };
    let host = host.split(':').next().unwrap_or(host);
    let Some((first, rest)) = host.split_once('.') else {
        return path;
    };
    let external = app
        .config
        .external_host
        .as_deref()
        .map(|h| h.split(':').next().unwrap_or(h));
    let is_object_host = rest.starts_with("s3.") || rest == "s3" || Some(rest) == external;
    if is_object_host && !first.is_empty() {
        let suffix = path.trim_start_matches('/');
        if suffix.is_empty() {
            format!("/{first}")
        } else {
            format!("/{first}/{suffix}")
        }
    } else {
        path
    }
}

/// Region from the AWS4 credential scope
/// (`Credential=<key>/<date>/<region>/<service>/aws4_request`), falling
/// back to the configured default.
pub(crate) fn region_from_headers(app: &App, headers: &HeaderMap) -> String {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| {
            let credential = auth.split("Credential=").nth(1)?;
            let scope = credential.split(',').next()?;
            scope.split('/').nth(2).map(str::to_string)
        })
        .filter(|region| !region.is_empty())
        .unwrap_or_else(|| app.config.default_region.clone())
}

/// Host the request was addressed to; used for constructed queue URLs.
pub(crate) fn request_host(app: &App, headers: &HeaderMap) -> String {
    headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("localhost:{}", app.config.port))
}

// -- error envelopes -------------------------------------------------------

/// Queue-service errors: JSON body in the x-amz-json-1.0 envelope.
pub(crate) fn sqs_error_response(error: &ServiceError) -> Response {
    let body = json!({
        "__type": error.code(),
        "message": error.to_string(),
    });
    (
        error.status(),
        [(CONTENT_TYPE, "application/x-amz-json-1.0")],
        body.to_string(),
    )
        .into_response()
}

/// Topic-service errors: the query-protocol XML envelope.
pub(crate) fn sns_error_response(error: &ServiceError) -> Response {
    let fault = match error.fault() {
        Fault::Sender => "Sender",
        Fault::Server => "Receiver",
    };
    let body = format!(
        "{XML_DECL}<ErrorResponse xmlns=\"http://sns.amazonaws.com/doc/2010-03-31/\"><Error>{}{}{}</Error>{}</ErrorResponse>",
        text_element("Type", fault),
        text_element("Code", error.code()),
        text_element("Message", &error.to_string()),
        text_element("RequestId", &Uuid::new_v4().to_string()),
    );
    (error.status(), [(CONTENT_TYPE, "text/xml")], body).into_response()
}

/// Object-service errors: the S3 XML error document.
pub(crate) fn s3_error_response(error: &ServiceError) -> Response {
    let body = format!(
        "{XML_DECL}<Error>{}{}{}</Error>",
        text_element("Code", error.code()),
        text_element("Message", &error.to_string()),
        text_element("RequestId", &Uuid::new_v4().to_string()),
    );
    (error.status(), [(CONTENT_TYPE, "application/xml")], body).into_response()
}
