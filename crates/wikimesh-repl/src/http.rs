//! HTTP surface: the message endpoint and the registration handshake.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::error::{ReplError, Result};
use crate::instance::{RegisterOutcome, RegistrationRequest};
use crate::message::{Metadata, MessageHeader};
use crate::node::ReplicationNode;
use crate::receiver::InboundMessage;
use crate::transport::{decode_metadata, METADATA_HEADER_PREFIX, SIGNATURE_HEADER};

impl IntoResponse for ReplError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Query parameters of `POST /message`.
#[derive(Debug, Deserialize)]
pub struct MessageParams {
    /// Id of the instance that sent this request.
    pub instance: String,
    /// Message type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Message id.
    pub id: String,
    /// Origin uri.
    pub source: Option<String>,
    /// Origin date, RFC 3339.
    pub date: Option<String>,
    /// Comma separated receiver uris.
    pub receivers: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnregisterParams {
    id: String,
}

pub(crate) fn metadata_from_headers(headers: &HeaderMap) -> Result<Metadata> {
    let mut metadata = Metadata::new();
    for (name, value) in headers {
        let Some(key) = name.as_str().strip_prefix(METADATA_HEADER_PREFIX) else {
            continue;
        };
        let key = decode_metadata(key)?;
        let value = value
            .to_str()
            .map_err(|_| ReplError::invalid(format!("metadata '{}' is not text", key)))?;
        metadata.add(&key, decode_metadata(value)?);
    }
    Ok(metadata)
}

fn parse_date(date: Option<&str>) -> Result<DateTime<Utc>> {
    match date {
        None => Ok(Utc::now()),
        Some(text) => DateTime::parse_from_rfc3339(text)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| ReplError::invalid(format!("bad date '{}': {}", text, e))),
    }
}

/// Turn an HTTP request into an inbound message.
pub fn inbound_message(
    node: &ReplicationNode,
    params: MessageParams,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<InboundMessage> {
    if params.id.is_empty() || params.kind.is_empty() {
        return Err(ReplError::invalid("message id and type are required"));
    }
    let source = match params.source.filter(|s| !s.is_empty()) {
        Some(source) => source,
        None => node
            .registry()
            .get_instance(&params.instance)
            .map(|i| i.uri)
            .unwrap_or_else(|| params.instance.clone()),
    };
    let receivers = params
        .receivers
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect();
    let header = MessageHeader {
        id: params.id,
        date: parse_date(params.date.as_deref())?,
        kind: params.kind,
        source,
        receivers,
        metadata: metadata_from_headers(headers)?,
    };
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Ok(InboundMessage {
        header,
        instance: params.instance,
        body,
        signature,
    })
}

async fn message_handler(
    State(node): State<Arc<ReplicationNode>>,
    Query(params): Query<MessageParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    let inbound = inbound_message(&node, params, &headers, body)?;
    let outcome = node.receive(inbound).await?;
    debug!(?outcome, "message accepted");
    Ok(StatusCode::OK)
}

async fn register_handler(
    State(node): State<Arc<ReplicationNode>>,
    Query(request): Query<RegistrationRequest>,
) -> Result<Response> {
    let response = node.handle_register(&request)?;
    let status = match response.outcome {
        RegisterOutcome::Conflict => StatusCode::CONFLICT,
        _ => StatusCode::OK,
    };
    Ok((status, Json(response)).into_response())
}

async fn unregister_handler(
    State(node): State<Arc<ReplicationNode>>,
    Query(params): Query<UnregisterParams>,
) -> Result<StatusCode> {
    if node.handle_unregister(&params.id)? {
        Ok(StatusCode::OK)
    } else {
        Err(ReplError::NotFound {
            what: format!("instance {}", params.id),
        })
    }
}

async fn instances_handler(State(node): State<Arc<ReplicationNode>>) -> impl IntoResponse {
    Json(node.registry().instances())
}

async fn health_handler(State(node): State<Arc<ReplicationNode>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": if node.is_running() { "ok" } else { "stopped" },
        "instance": node.local(),
    }))
}

/// Router serving `node`.
pub fn router(node: Arc<ReplicationNode>) -> Router {
    Router::new()
        .route("/message", post(message_handler))
        .route("/instance/register", post(register_handler))
        .route("/instance/unregister", post(unregister_handler))
        .route("/instances", get(instances_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

/// Serve `node` on `addr` until the listener fails.
pub async fn serve(node: Arc<ReplicationNode>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Replication API listening on {}", addr);
    axum::serve(listener, router(node).into_make_service()).await?;
    Ok(())
}
