//! Request handlers
//!
//! | Route | Handler | Success |
//! |-------|---------|---------|
//! | `GET /health` | liveness | `200 ok` |
//! | `GET /metrics` | Prometheus text | `200` |
//! | `GET /api/events` | list events | `200` JSON |
//! | `POST /api/events` | create event | `201` JSON |
//! | `GET /api/events/{id}` | event with uploads | `200` JSON |
//! | `POST /api/events/{id}/upload` | upload transaction | `200 {files, count}` |
//! | `GET /api/events/{id}/download` | gallery archive | `200` zip stream |
//! | `GET /media/{key}` | stored blob | `200` stream |

use super::state::AppState;
use crate::archive::ARCHIVE_CONTENT_TYPE;
use crate::blob::BlobError;
use crate::error::GalleryError;
use crate::events::NewEvent;
use crate::metadata::UploadRecord;
use crate::metrics;
use crate::router::{ApiRequestParser, ApiRoute, RouterError};
use crate::upload::{IncomingFile, UploadRequest};
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Full, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::Instrument;

/// Response body: buffered JSON/text or a streamed archive/blob
pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

const GUEST_NAME_FIELD: &str = "guestName";
const MESSAGE_FIELD: &str = "message";
const FILES_FIELD: &str = "files";
const MAX_JSON_BODY: usize = 64 * 1024;

#[derive(Serialize)]
struct UploadResponse<'a> {
    files: &'a [UploadRecord],
    count: usize,
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'a str>,
}

/// Route and handle one request
pub async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<ResponseBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let span = tracing::info_span!(
        "http.request",
        http.method = %method,
        http.target = %path,
        http.status_code = tracing::field::Empty
    );

    async move {
        let response = match ApiRequestParser::parse(method.as_str(), &path) {
            Ok(route) => dispatch(route, req, &state).await,
            Err(e) => router_error(e),
        };
        let status = response.status();
        tracing::Span::current().record("http.status_code", status.as_u16());
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), "Request handled");
        }
        Ok(if method == Method::HEAD {
            strip_body(response)
        } else {
            response
        })
    }
    .instrument(span)
    .await
}

async fn dispatch(route: ApiRoute, req: Request<Incoming>, state: &AppState) -> Response<ResponseBody> {
    let result = match route {
        ApiRoute::Health => Ok(text(StatusCode::OK, "ok")),
        ApiRoute::Metrics => metrics_text(state),
        ApiRoute::ListEvents => state
            .events
            .list_events()
            .await
            .map(|events| json(StatusCode::OK, &events)),
        ApiRoute::CreateEvent => create_event(req, state).await,
        ApiRoute::GetEvent { event_id } => state
            .events
            .get_event(&event_id)
            .await
            .map(|event| json(StatusCode::OK, &event)),
        ApiRoute::Upload { event_id } => upload(event_id, req, state).await,
        ApiRoute::Download { event_id } => download(&event_id, state).await,
        ApiRoute::Media { key } => media(&key, state).await,
    };
    result.unwrap_or_else(|e| error_response(&e))
}

fn metrics_text(state: &AppState) -> Result<Response<ResponseBody>, GalleryError> {
    if !state.metrics_enabled {
        return Err(GalleryError::NotFound("metrics are disabled".into()));
    }
    match metrics::gather_text() {
        Ok(body) => Ok(response(StatusCode::OK, "text/plain; version=0.0.4", body)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            Ok(text(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics"))
        }
    }
}

async fn create_event(
    req: Request<Incoming>,
    state: &AppState,
) -> Result<Response<ResponseBody>, GalleryError> {
    let body = Limited::new(req.into_body(), MAX_JSON_BODY)
        .collect()
        .await
        .map_err(|e| GalleryError::validation("body", e.to_string()))?
        .to_bytes();
    let new_event: NewEvent = serde_json::from_slice(&body)
        .map_err(|e| GalleryError::validation("body", e.to_string()))?;
    let event = state.events.create_event(new_event).await?;
    Ok(json(StatusCode::CREATED, &event))
}

async fn upload(
    event_id: String,
    req: Request<Incoming>,
    state: &AppState,
) -> Result<Response<ResponseBody>, GalleryError> {
    let request = read_upload_form(event_id, req, state).await?;
    let records = state.uploads.execute(request).await?;
    Ok(json(
        StatusCode::OK,
        &UploadResponse {
            files: &records,
            count: records.len(),
        },
    ))
}

/// Parse the multipart upload form
async fn read_upload_form(
    event_id: String,
    req: Request<Incoming>,
    state: &AppState,
) -> Result<UploadRequest, GalleryError> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let boundary = multer::parse_boundary(content_type)
        .map_err(|_| GalleryError::validation("body", "expected multipart/form-data"))?;

    let constraints = multer::Constraints::new().size_limit(
        multer::SizeLimit::new()
            .whole_stream(state.max_body_bytes)
            .per_field(state.max_file_size() as u64),
    );
    let body = BodyStream::new(req.into_body())
        .try_filter_map(|frame| async move { Ok::<_, hyper::Error>(frame.into_data().ok()) });
    let mut multipart = multer::Multipart::with_constraints(body, boundary, constraints);

    let mut request = UploadRequest {
        event_id,
        guest_name: String::new(),
        message: None,
        files: Vec::new(),
    };

    while let Some(field) = multipart.next_field().await.map_err(form_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some(GUEST_NAME_FIELD) => request.guest_name = field.text().await.map_err(form_error)?,
            Some(MESSAGE_FIELD) => request.message = Some(field.text().await.map_err(form_error)?),
            Some(FILES_FIELD) => {
                if request.files.len() >= state.max_files() {
                    return Err(GalleryError::validation(
                        FILES_FIELD,
                        format!("at most {} files per upload", state.max_files()),
                    ));
                }
                let filename = field.file_name().unwrap_or_default().to_string();
                let media_type = field
                    .content_type()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                let bytes = field.bytes().await.map_err(form_error)?;
                request
                    .files
                    .push(IncomingFile::new(filename, media_type, bytes));
            }
            other => {
                tracing::debug!(field = ?other, "Ignoring unknown form field");
            }
        }
    }

    Ok(request)
}

fn form_error(e: multer::Error) -> GalleryError {
    match e {
        multer::Error::FieldSizeExceeded { field_name, limit } => GalleryError::validation(
            field_name.unwrap_or_else(|| FILES_FIELD.to_string()),
            format!("file exceeds {limit} bytes"),
        ),
        multer::Error::StreamSizeExceeded { limit } => {
            GalleryError::validation("body", format!("request exceeds {limit} bytes"))
        }
        other => GalleryError::validation("body", other.to_string()),
    }
}

async fn download(event_id: &str, state: &AppState) -> Result<Response<ResponseBody>, GalleryError> {
    let event = state.events.load(event_id).await?;
    let download = state.archives.stream(&event)?;

    let body = StreamBody::new(download.body.map_ok(Frame::data));
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, ARCHIVE_CONTENT_TYPE)
        .header(
            CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", download.filename),
        )
        .body(body.boxed_unsync())
        .expect("Failed to build archive response"))
}

async fn media(key: &str, state: &AppState) -> Result<Response<ResponseBody>, GalleryError> {
    let stream = match state.blobs.get(key).await {
        Ok(stream) => stream,
        Err(BlobError::NotFound(_)) | Err(BlobError::InvalidKey(_)) => {
            return Err(GalleryError::NotFound(format!("media {key}")))
        }
        Err(e) => {
            tracing::error!(key = %key, error = %e, "Failed to read blob");
            return Ok(text(StatusCode::BAD_GATEWAY, "storage unavailable"));
        }
    };

    let body = StreamBody::new(
        stream
            .map_err(std::io::Error::other)
            .map_ok(Frame::data),
    );
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, state.media_type_for(key))
        .body(body.boxed_unsync())
        .expect("Failed to build media response"))
}

fn error_response(err: &GalleryError) -> Response<ResponseBody> {
    let status = err.status();
    if status.is_server_error() {
        tracing::error!(error = %err, "Request failed");
    } else {
        tracing::info!(error = %err, "Request rejected");
    }
    let field = match err {
        GalleryError::Validation { field, .. } => Some(field.as_str()),
        _ => None,
    };
    json(
        status,
        &ErrorResponse {
            error: &err.to_string(),
            field,
        },
    )
}

fn router_error(err: RouterError) -> Response<ResponseBody> {
    let status = match err {
        RouterError::NotFound(_) => StatusCode::NOT_FOUND,
        RouterError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
        RouterError::InvalidPath(_) => StatusCode::BAD_REQUEST,
    };
    json(
        status,
        &ErrorResponse {
            error: &err.to_string(),
            field: None,
        },
    )
}

fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    match serde_json::to_vec(value) {
        Ok(body) => response(status, "application/json", body),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize response");
            text(StatusCode::INTERNAL_SERVER_ERROR, "serialization error")
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<ResponseBody> {
    response(status, "text/plain", body)
}

fn response(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(full(body))
        .expect("Failed to build response")
}

fn full(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn strip_body(response: Response<ResponseBody>) -> Response<ResponseBody> {
    let (parts, _) = response.into_parts();
    Response::from_parts(parts, full(Bytes::new()))
}
