//! Peer client: the byte-stream transport to a named instance plus the
//! registration handshake calls.
//!
//! [`HttpPeerClient`] talks to the HTTP surface in [`crate::http`]. The
//! in-process [`crate::loopback::LoopbackNetwork`] implements the same trait
//! for tests and embedded fleets.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::error::{ReplError, Result};
use crate::instance::{Instance, LocalInstance, RegisterResponse, RegistrationRequest};
use crate::message::OutboundMessage;

/// Path segment of the message endpoint.
pub const MESSAGE_PATH: &str = "message";
/// Path of the registration endpoint.
pub const REGISTER_PATH: &str = "instance/register";
/// Path of the unregistration endpoint.
pub const UNREGISTER_PATH: &str = "instance/unregister";
/// Prefix of headers carrying custom metadata.
pub const METADATA_HEADER_PREFIX: &str = "x-wikimesh-meta-";
/// Header carrying the message signature.
pub const SIGNATURE_HEADER: &str = "x-wikimesh-signature";

/// Outbound side of the wire protocol.
#[async_trait]
pub trait PeerClient: Send + Sync + 'static {
    /// Deliver one message to `target`. `signature` travels alongside.
    async fn send_message(
        &self,
        target: &Instance,
        message: &OutboundMessage,
        signature: Option<&str>,
    ) -> Result<()>;

    /// Ask `target_uri` to register us.
    async fn register(
        &self,
        target_uri: &str,
        request: &RegistrationRequest,
    ) -> Result<RegisterResponse>;

    /// Tell `target_uri` to forget us. Returns false when the peer did not
    /// know us.
    async fn unregister(&self, target_uri: &str, local_id: &str) -> Result<bool>;
}

/// Query parameters of the message endpoint.
pub fn message_query(local: &LocalInstance, message: &OutboundMessage) -> Vec<(&'static str, String)> {
    let header = &message.header;
    let mut query = vec![
        ("instance", local.id.clone()),
        ("type", header.kind.clone()),
        ("id", header.id.clone()),
        ("source", header.source.clone()),
        ("date", header.date.to_rfc3339()),
    ];
    if !header.receivers.is_empty() {
        query.push(("receivers", header.receivers.join(",")));
    }
    query
}

/// `base` joined with `path`, tolerating a trailing slash on `base`.
pub fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

/// HTTP implementation of [`PeerClient`].
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    client: reqwest::Client,
    local: LocalInstance,
}

impl HttpPeerClient {
    /// Client presenting `local` as the immediate hop.
    pub fn new(local: LocalInstance, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReplError::Config {
                msg: format!("http client: {}", e),
            })?;
        Ok(Self::with_client(local, client))
    }

    /// Client over an already configured reqwest client.
    pub fn with_client(local: LocalInstance, client: reqwest::Client) -> Self {
        Self { client, local }
    }

    fn check_status(uri: &str, status: StatusCode) -> Result<()> {
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(uri, status.as_u16()))
        }
    }
}

/// Error for a failed peer answer: server errors are transient, anything
/// else is the peer refusing us.
pub fn status_error(uri: &str, status: u16) -> ReplError {
    if status >= 500 {
        ReplError::network(format!("{} answered {}", uri, status))
    } else {
        ReplError::Rejected {
            uri: uri.to_string(),
            status,
        }
    }
}

/// Header name and value carrying one metadata entry. Both are
/// percent-encoded, so any text fits in a header.
pub fn metadata_header(key: &str, value: &str) -> (String, String) {
    (
        format!(
            "{}{}",
            METADATA_HEADER_PREFIX,
            urlencoding::encode(&key.to_ascii_lowercase())
        ),
        urlencoding::encode(value).into_owned(),
    )
}

/// Inverse of the encoding in [`metadata_header`].
pub fn decode_metadata(text: &str) -> Result<String> {
    urlencoding::decode(text)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| ReplError::invalid(format!("metadata '{}' is not UTF-8", text)))
}

fn network_error(uri: &str, e: reqwest::Error) -> ReplError {
    if e.is_builder() {
        // The request could not be built; sending it again will not help.
        ReplError::invalid(format!("{}: {}", uri, e))
    } else if e.is_timeout() {
        ReplError::network(format!("{}: timed out", uri))
    } else {
        ReplError::network(format!("{}: {}", uri, e))
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn send_message(
        &self,
        target: &Instance,
        message: &OutboundMessage,
        signature: Option<&str>,
    ) -> Result<()> {
        let url = endpoint(&target.uri, MESSAGE_PATH);
        let mut request = self
            .client
            .post(&url)
            .query(&message_query(&self.local, message))
            .body(message.body.clone());
        for (key, value) in message.header.metadata.iter() {
            let (name, value) = metadata_header(key, value);
            request = request.header(name, value);
        }
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        let response = request.send().await.map_err(|e| network_error(&url, e))?;
        debug!(target = %target.uri, id = %message.header.id, status = %response.status(), "message posted");
        Self::check_status(&target.uri, response.status())
    }

    async fn register(
        &self,
        target_uri: &str,
        request: &RegistrationRequest,
    ) -> Result<RegisterResponse> {
        let url = endpoint(target_uri, REGISTER_PATH);
        let response = self
            .client
            .post(&url)
            .query(request)
            .send()
            .await
            .map_err(|e| network_error(&url, e))?;
        let status = response.status();
        if status == StatusCode::CONFLICT {
            // The body still describes the peer and the conflict outcome.
            return response
                .json::<RegisterResponse>()
                .await
                .map_err(|e| network_error(&url, e));
        }
        Self::check_status(target_uri, status)?;
        response
            .json::<RegisterResponse>()
            .await
            .map_err(|e| network_error(&url, e))
    }

    async fn unregister(&self, target_uri: &str, local_id: &str) -> Result<bool> {
        let url = endpoint(target_uri, UNREGISTER_PATH);
        let response = self
            .client
            .post(&url)
            .query(&[("id", local_id)])
            .send()
            .await
            .map_err(|e| network_error(&url, e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check_status(target_uri, response.status())?;
        Ok(true)
    }
}
