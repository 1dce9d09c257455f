//! HTTP surface of the mailbox.
//!
//! Caller identity comes from the `X-User-Id` header, set by the
//! authentication layer in front of this server. Paths may carry an optional
//! `/api` prefix.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use hyper::header::{CONTENT_TYPE, LOCATION, RETRY_AFTER};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::MailError;
use crate::models::{BlacklistRequest, ComposeRequest, EditDraftRequest, IdsRequest, LabelNameRequest, LabelRequest, ReadRequest};
use crate::oracle::{AddOutcome, RemoveOutcome};
use crate::service::MailboxService;

pub const USER_HEADER: &str = "x-user-id";

#[derive(Debug)]
enum ApiError {
    Unauthorized,
    BadRequest(String),
    NoRoute,
    Mail(MailError),
}

impl From<MailError> for ApiError {
    fn from(err: MailError) -> Self {
        ApiError::Mail(err)
    }
}

impl From<hyper::Error> for ApiError {
    fn from(err: hyper::Error) -> Self {
        ApiError::BadRequest(format!("could not read body: {err}"))
    }
}

pub fn status_for(err: &MailError) -> StatusCode {
    match err {
        MailError::NotFound(_) => StatusCode::NOT_FOUND,
        MailError::Validation(_) => StatusCode::BAD_REQUEST,
        MailError::Conflict(_) => StatusCode::CONFLICT,
        MailError::OracleUnavailable(_) | MailError::PartialReconciliation { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        // Client closed the request.
        MailError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT),
        MailError::Config(_) | MailError::Database(_) | MailError::Json(_) | MailError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_body(status: StatusCode, message: &str) -> Response<Body> {
    let body = json!({ "error": message }).to_string();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn error_response(err: ApiError) -> Response<Body> {
    match err {
        ApiError::Unauthorized => error_body(StatusCode::UNAUTHORIZED, "missing X-User-Id header"),
        ApiError::BadRequest(message) => error_body(StatusCode::BAD_REQUEST, &message),
        ApiError::NoRoute => error_body(StatusCode::NOT_FOUND, "no such route"),
        ApiError::Mail(err) => {
            let status = status_for(&err);
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                error!(error = %err, "request failed");
            }
            let mut response = error_body(status, &err.to_string());
            if err.is_retryable() {
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, hyper::header::HeaderValue::from_static("1"));
            }
            response
        }
    }
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Body>, ApiError> {
    let body = serde_json::to_vec(value).map_err(MailError::from)?;
    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty())))
}

fn no_content() -> Result<Response<Body>, ApiError> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    Ok(response)
}

fn parse_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ApiError> {
    let bytes = if bytes.iter().all(u8::is_ascii_whitespace) {
        &b"{}"[..]
    } else {
        bytes
    };
    serde_json::from_slice(bytes).map_err(|err| ApiError::BadRequest(format!("invalid body: {err}")))
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.into_owned())
}

fn path_segments(path: &str) -> Result<Vec<String>, ApiError> {
    let mut segments = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|decoded| decoded.into_owned())
                .map_err(|_| ApiError::BadRequest(format!("bad path segment `{segment}`")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if segments.first().is_some_and(|first| first == "api") {
        segments.remove(0);
    }
    Ok(segments)
}

/// Handles one request. A client that disconnects drops this future, which
/// cancels any classification still running for it.
pub async fn handle(service: &MailboxService, request: Request<Body>) -> Response<Body> {
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = match route(service, request, &cancel).await {
        Ok(response) => response,
        Err(err) => error_response(err),
    };
    debug!(%method, path, status = response.status().as_u16(), "request");
    response
}

async fn route(
    service: &MailboxService,
    request: Request<Body>,
    cancel: &CancellationToken,
) -> Result<Response<Body>, ApiError> {
    let caller = request
        .headers()
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::Unauthorized)?;

    let method = request.method().as_str().to_string();
    let query = request.uri().query().map(str::to_string);
    let segments = path_segments(request.uri().path())?;
    let parts: Vec<&str> = segments.iter().map(String::as_str).collect();
    let body = hyper::body::to_bytes(request.into_body()).await?;
    let caller = caller.as_str();

    match (method.as_str(), parts.as_slice()) {
        ("GET", ["mails"]) => {
            let label = query_param(query.as_deref(), "label");
            json(StatusCode::OK, &service.list(caller, label.as_deref()).await?)
        }
        ("GET", ["mails", "spam"]) => json(StatusCode::OK, &service.spam(caller).await?),
        ("GET", ["mails", "search", query]) => json(StatusCode::OK, &service.search(caller, query).await?),
        ("GET", ["mails", "search", label, query]) => {
            json(StatusCode::OK, &service.search_in_label(caller, label, query).await?)
        }
        ("GET", ["mails", id]) => json(StatusCode::OK, &service.get(caller, id).await?),

        ("POST", ["mails"]) => {
            let request: ComposeRequest = parse_body(&body)?;
            let sent = service.send(caller, request, cancel).await?;
            json(StatusCode::CREATED, &sent.sender_copy)
        }
        ("POST", ["mails", "draft"]) => {
            let request: ComposeRequest = parse_body(&body)?;
            json(StatusCode::CREATED, &service.save_draft(caller, request).await?)
        }
        ("POST", ["mails", id, "spam"]) => json(StatusCode::OK, &service.toggle_spam(caller, id).await?),

        ("PATCH", ["mails", "markAllRead"]) => {
            service.mark_all_read(caller).await?;
            no_content()
        }
        ("PATCH", ["mails", "markUnread"]) => {
            let request: IdsRequest = parse_body(&body)?;
            service.mark_unread(caller, request).await?;
            no_content()
        }
        ("PATCH", ["mails", id, "label"]) => {
            let request: LabelRequest = parse_body(&body)?;
            json(StatusCode::OK, &service.apply_label(caller, id, request).await?)
        }
        ("PATCH", ["mails", id, "read"]) => {
            let request: ReadRequest = parse_body(&body)?;
            json(StatusCode::OK, &service.mark_read(caller, id, request.read).await?)
        }
        ("PATCH", ["mails", id, "star"]) => json(StatusCode::OK, &service.toggle_star(caller, id).await?),
        ("PATCH", ["mails", id, "archive"]) => json(StatusCode::OK, &service.toggle_archive(caller, id).await?),
        ("PATCH", ["mails", id, "trash"]) => json(StatusCode::OK, &service.toggle_trash(caller, id).await?),
        ("PATCH", ["mails", id]) => {
            let request: EditDraftRequest = parse_body(&body)?;
            service.edit_draft(caller, id, request).await?;
            no_content()
        }

        ("DELETE", ["mails", "trash", "clear"]) => {
            let report = service.clear_trash(caller).await?;
            json(
                StatusCode::OK,
                &json!({
                    "message": format!("Deleted {} emails from trash.", report.count),
                    "count": report.count,
                }),
            )
        }
        ("DELETE", ["mails", id, "label", label]) => {
            json(StatusCode::OK, &service.remove_label(caller, id, label).await?)
        }
        ("DELETE", ["mails", id]) => {
            service.delete(caller, id).await?;
            no_content()
        }

        ("GET", ["labels"]) => json(StatusCode::OK, &service.list_labels(caller).await?),
        ("POST", ["labels"]) => {
            let request: LabelNameRequest = parse_body(&body)?;
            let label = service.create_label(caller, request).await?;
            let mut response = json(StatusCode::CREATED, &label)?;
            if let Ok(location) = hyper::header::HeaderValue::from_str(&format!("/api/labels/{}", label.id)) {
                response.headers_mut().insert(LOCATION, location);
            }
            Ok(response)
        }
        ("GET", ["labels", name, "emails"]) => json(StatusCode::OK, &service.label_emails(caller, name).await?),
        ("GET", ["labels", id]) => json(StatusCode::OK, &service.get_label(caller, id).await?),
        ("PATCH", ["labels", id]) => {
            let request: LabelNameRequest = parse_body(&body)?;
            service.rename_label(caller, id, request).await?;
            no_content()
        }
        ("DELETE", ["labels", id]) => {
            service.delete_label(caller, id).await?;
            no_content()
        }

        ("POST", ["blacklist"]) => {
            let request: BlacklistRequest = parse_body(&body)?;
            match service.blacklist_add(request).await? {
                outcome @ AddOutcome::Added => json(StatusCode::CREATED, &json!({ "result": outcome })),
                outcome @ AddOutcome::AlreadyPresent => json(StatusCode::OK, &json!({ "result": outcome })),
            }
        }
        ("DELETE", ["blacklist", url]) => match service.blacklist_remove(url).await? {
            RemoveOutcome::Removed => no_content(),
            RemoveOutcome::NotFound => Err(MailError::not_found(format!("url {url}")).into()),
        },

        ("POST", ["sync"]) => json(StatusCode::OK, &service.sync_mailbox(caller).await?),
        ("GET", ["sync", "pending"]) => json(StatusCode::OK, &service.pending(caller)),
        ("POST", ["sync", "retry"]) => json(StatusCode::OK, &service.retry_pending().await),

        _ => Err(ApiError::NoRoute),
    }
}

/// Serves the mailbox on `addr` until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, service: MailboxService, shutdown: F) -> hyper::Result<()>
where
    F: Future<Output = ()>,
{
    let make_service = make_service_fn(move |_conn| {
        let service = service.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                let service = service.clone();
                async move { Ok::<_, Infallible>(handle(&service, request).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_service);
    info!(%addr, "mailbox listening");
    server.with_graceful_shutdown(shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_decoded_and_unprefixed() {
        let segments = path_segments("/api/blacklist/http%3A%2F%2Fevil.test%2Fx").unwrap();
        assert_eq!(segments, ["blacklist", "http://evil.test/x"]);
        assert_eq!(path_segments("/mails//m1/").unwrap(), ["mails", "m1"]);
    }

    #[test]
    fn test_query_params_are_decoded() {
        assert_eq!(query_param(Some("label=my%20work&x=1"), "label").as_deref(), Some("my work"));
        assert_eq!(query_param(Some("x=1"), "label"), None);
        assert_eq!(query_param(None, "label"), None);
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(status_for(&MailError::not_found("m")), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&MailError::validation("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&MailError::Conflict("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&MailError::OracleUnavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(&MailError::Cancelled).as_u16(), 499);
    }

    #[test]
    fn test_blank_body_reads_as_empty_object() {
        let request: ReadRequest = parse_body(b"  ").unwrap();
        assert!(request.read);
    }
}
