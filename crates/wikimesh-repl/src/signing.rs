//! Message signing on a link between two instances.
//!
//! The link key is proposed by the instance that starts the registration
//! handshake and stored by both sides as the peer's `receive_key`. The sender
//! signs with it and the receiver verifies with the same key.

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

use crate::error::{ReplError, Result};
use crate::message::OutboundMessage;

type HmacSha256 = Hmac<Sha256>;

/// Signs outbound messages and verifies inbound ones.
pub trait MessageSigner: Send + Sync {
    /// Signature to attach when sending on a link with `key`.
    fn sign(&self, key: Option<&str>, message: &OutboundMessage) -> Result<Option<String>>;

    /// Check the signature presented by a peer whose link key is `key`.
    fn verify(&self, key: Option<&str>, message: &OutboundMessage, signature: Option<&str>)
        -> Result<()>;
}

/// Accepts everything and signs nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSigner;

impl MessageSigner for NoopSigner {
    fn sign(&self, _key: Option<&str>, _message: &OutboundMessage) -> Result<Option<String>> {
        Ok(None)
    }

    fn verify(
        &self,
        _key: Option<&str>,
        _message: &OutboundMessage,
        _signature: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }
}

/// HMAC-SHA256 over the canonical message bytes, hex encoded.
#[derive(Debug, Default, Clone, Copy)]
pub struct HmacSigner;

impl HmacSigner {
    /// Canonical form: header fields, sorted metadata, then the body.
    fn canonical(message: &OutboundMessage) -> Vec<u8> {
        let header = &message.header;
        let date = header.date.to_rfc3339();
        let receivers = header.receivers.join(",");
        let mut buf = Vec::with_capacity(message.body.len() + 128);
        for field in [
            header.id.as_str(),
            header.kind.as_str(),
            header.source.as_str(),
            date.as_str(),
            receivers.as_str(),
        ] {
            buf.extend_from_slice(field.as_bytes());
            buf.push(b'\n');
        }
        let mut meta: Vec<(String, &str)> = header
            .metadata
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        meta.sort();
        for (k, v) in meta {
            buf.extend_from_slice(k.as_bytes());
            buf.push(b'=');
            buf.extend_from_slice(v.as_bytes());
            buf.push(b'\n');
        }
        buf.extend_from_slice(&message.body);
        buf
    }

    fn mac(key: &str, message: &OutboundMessage) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).map_err(|e| {
            ReplError::Signature {
                msg: format!("bad link key: {}", e),
            }
        })?;
        mac.update(&Self::canonical(message));
        Ok(mac)
    }
}

impl MessageSigner for HmacSigner {
    fn sign(&self, key: Option<&str>, message: &OutboundMessage) -> Result<Option<String>> {
        let key = key.ok_or_else(|| ReplError::Signature {
            msg: "no link key for target".to_string(),
        })?;
        let tag = Self::mac(key, message)?.finalize().into_bytes();
        Ok(Some(hex::encode(tag)))
    }

    fn verify(
        &self,
        key: Option<&str>,
        message: &OutboundMessage,
        signature: Option<&str>,
    ) -> Result<()> {
        let key = key.ok_or_else(|| ReplError::Signature {
            msg: "no link key for sender".to_string(),
        })?;
        let signature = signature.ok_or_else(|| ReplError::Signature {
            msg: "missing signature".to_string(),
        })?;
        let tag = hex::decode(signature).map_err(|_| ReplError::Signature {
            msg: "signature is not hex".to_string(),
        })?;
        Self::mac(key, message)?
            .verify_slice(&tag)
            .map_err(|_| ReplError::Signature {
                msg: format!("signature mismatch for message {}", message.header.id),
            })
    }
}

/// Generate a random 32-byte link key, hex encoded.
pub fn generate_link_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}
