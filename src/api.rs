//! HTTP surface of the index manager.
//!
//! JSON bodies for unary operations; the upload stream is
//! newline-delimited JSON in the request body and the build-status stream
//! is newline-delimited JSON in the response body. Vector ids are opaque
//! byte strings and travel hex-encoded.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;

use crate::error::{OpResult, Status};
use crate::index::distance::Distance;
use crate::manager::{IndexManager, UploadChunk, UploadSession};

pub fn create_router(manager: Arc<IndexManager>) -> Router {
    Router::new()
        .route("/v1/indexes", post(create_index).get(list_indexes))
        .route("/v1/indexes/upload", post(upload_vectors))
        .route("/v1/indexes/build-status", get(build_status))
        .route("/v1/indexes/:name/build", post(trigger_index_build))
        .route("/v1/indexes/:name/state", get(retrieve_index_state))
        .route("/v1/indexes/:name/search", post(find_nearest_neighbours))
        .route("/v1/indexes/:name", delete(drop_index))
        .route("/v1/mode/build", post(switch_to_build_mode))
        .route("/v1/mode/search", post(switch_to_search_mode))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

#[derive(Debug, Clone, Deserialize)]
struct CreateIndexRequest {
    index_name: String,
    distance: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UploadChunkWire {
    index_name: String,
    vector_components: Vec<f32>,
    /// Hex-encoded opaque vector id.
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct FindNearestNeighboursRequest {
    k: usize,
    vector_components: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
struct FindNearestNeighboursResponse {
    ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct IndexStateResponse {
    state: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct IndexListResponse {
    index_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

async fn create_index(
    State(manager): State<Arc<IndexManager>>,
    headers: HeaderMap,
    Json(body): Json<CreateIndexRequest>,
) -> Response {
    let request_id = request_id(&headers);

    let distance: Distance = match body.distance.parse() {
        Ok(distance) => distance,
        Err(e) => {
            return error_response(&request_id, &Status::invalid_argument(e.to_string()));
        }
    };

    respond_empty(
        &request_id,
        manager.create_index(&body.index_name, distance).await,
    )
}

async fn trigger_index_build(
    State(manager): State<Arc<IndexManager>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let request_id = request_id(&headers);
    respond_empty(&request_id, manager.trigger_index_build(&name).await)
}

async fn upload_vectors(
    State(manager): State<Arc<IndexManager>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let request_id = request_id(&headers);

    let mut session = match manager.begin_upload().await {
        Ok(session) => session,
        Err(status) => return error_response(&request_id, &status),
    };

    let mut stream = body.into_data_stream();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(next) = stream.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(e) => {
                session.fail();
                return error_response(
                    &request_id,
                    &Status::Internal(anyhow::anyhow!("failed to read upload stream: {e}")),
                );
            }
        };
        buffer.extend_from_slice(&bytes);

        while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            if let Err(status) = handle_upload_line(&mut session, &line[..line.len() - 1]) {
                session.fail();
                return error_response(&request_id, &status);
            }
        }
    }

    if !buffer.is_empty() {
        if let Err(status) = handle_upload_line(&mut session, &buffer) {
            session.fail();
            return error_response(&request_id, &status);
        }
    }

    respond_empty(&request_id, session.complete())
}

fn handle_upload_line(session: &mut UploadSession, line: &[u8]) -> OpResult<()> {
    let text = std::str::from_utf8(line)
        .map_err(|_| Status::invalid_argument("upload chunk is not valid UTF-8"))?;
    if text.trim().is_empty() {
        return Ok(());
    }

    let wire: UploadChunkWire = serde_json::from_str(text)
        .map_err(|e| Status::invalid_argument(format!("malformed upload chunk: {e}")))?;
    let id = decode_hex(&wire.id)
        .ok_or_else(|| Status::invalid_argument(format!("malformed vector id `{}`", wire.id)))?;

    session.on_chunk(&UploadChunk {
        index_name: wire.index_name,
        vector_components: wire.vector_components,
        id,
    })
}

async fn build_status(State(manager): State<Arc<IndexManager>>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);

    match manager.build_status().await {
        Ok(receiver) => {
            let stream = ReceiverStream::new(receiver).map(|progress| {
                let mut line = serde_json::to_vec(&progress).unwrap_or_default();
                line.push(b'\n');
                Ok::<_, std::convert::Infallible>(Bytes::from(line))
            });

            let mut response = Response::new(Body::from_stream(stream));
            response.headers_mut().insert(
                "content-type",
                HeaderValue::from_static("application/x-ndjson"),
            );
            set_request_id(&mut response, &request_id);
            response
        }
        Err(status) => error_response(&request_id, &status),
    }
}

async fn retrieve_index_state(
    State(manager): State<Arc<IndexManager>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let request_id = request_id(&headers);

    match manager.retrieve_index_state(&name).await {
        Ok(state) => json_response(
            StatusCode::OK,
            &request_id,
            &IndexStateResponse {
                state: state.as_str(),
            },
        ),
        Err(status) => error_response(&request_id, &status),
    }
}

async fn list_indexes(State(manager): State<Arc<IndexManager>>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);

    match manager.list_indexes().await {
        Ok(index_names) => json_response(
            StatusCode::OK,
            &request_id,
            &IndexListResponse { index_names },
        ),
        Err(status) => error_response(&request_id, &status),
    }
}

async fn find_nearest_neighbours(
    State(manager): State<Arc<IndexManager>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<FindNearestNeighboursRequest>,
) -> Response {
    let request_id = request_id(&headers);

    match manager
        .find_nearest_neighbours(&name, body.k, body.vector_components)
        .await
    {
        Ok(ids) => json_response(
            StatusCode::OK,
            &request_id,
            &FindNearestNeighboursResponse {
                ids: ids.iter().map(|id| encode_hex(id)).collect(),
            },
        ),
        Err(status) => error_response(&request_id, &status),
    }
}

async fn drop_index(
    State(manager): State<Arc<IndexManager>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let request_id = request_id(&headers);
    respond_empty(&request_id, manager.drop_index(&name).await)
}

async fn switch_to_build_mode(
    State(manager): State<Arc<IndexManager>>,
    headers: HeaderMap,
) -> Response {
    let request_id = request_id(&headers);
    respond_empty(&request_id, manager.switch_to_build_mode().await)
}

async fn switch_to_search_mode(
    State(manager): State<Arc<IndexManager>>,
    headers: HeaderMap,
) -> Response {
    let request_id = request_id(&headers);
    respond_empty(&request_id, manager.switch_to_search_mode().await)
}

fn respond_empty(request_id: &str, result: OpResult<()>) -> Response {
    match result {
        Ok(()) => json_response(StatusCode::OK, request_id, &serde_json::json!({})),
        Err(status) => error_response(request_id, &status),
    }
}

fn json_response<T: Serialize>(status: StatusCode, request_id: &str, payload: &T) -> Response {
    let mut response = (status, Json(payload)).into_response();
    set_request_id(&mut response, request_id);
    response
}

fn error_response(request_id: &str, status: &Status) -> Response {
    let payload = ErrorBody {
        code: status.code(),
        message: status.to_string(),
    };
    json_response(http_status(status), request_id, &payload)
}

fn http_status(status: &Status) -> StatusCode {
    match status {
        Status::NotFound(_) => StatusCode::NOT_FOUND,
        Status::AlreadyExists(_) => StatusCode::CONFLICT,
        Status::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
        Status::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Status::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
        Status::PermissionDenied(_) => StatusCode::FORBIDDEN,
        Status::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Status::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(new_request_id)
}

fn set_request_id(response: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
}

fn new_request_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("req_{}", encode_hex(&bytes))
}

pub fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

pub fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if !s.is_ascii() || s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
