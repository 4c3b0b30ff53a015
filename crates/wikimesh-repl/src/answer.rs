//! Ask/answer correlation over the asynchronous transport.
//!
//! `ask` records the exact set of instances expected to answer and returns a
//! future. Each answer names its question in the `question` metadata key.
//! The future resolves when the last expected instance has answered, with
//! the answers in arrival order.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ReplError, Result};
use crate::instance::LocalInstance;
use crate::message::{Message, MessageHeader, OutboundMessage};
use crate::registry::InstanceRegistry;
use crate::relay::RelayEngine;

/// Message type of answers.
pub const ANSWER_TYPE: &str = "answer";
/// Metadata key naming the question an answer replies to.
pub const QUESTION_KEY: &str = "question";

/// One answer to a question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    /// Uri of the answering instance.
    pub source: String,
    /// Header of the answer message.
    pub header: MessageHeader,
    /// Answer body.
    pub body: Bytes,
}

struct PendingQuestion {
    outstanding: HashSet<String>,
    answers: Vec<Answer>,
    done: oneshot::Sender<Vec<Answer>>,
}

/// Resolves with every answer once all expected instances replied.
///
/// Fails with [`ReplError::Shutdown`] if the question is cancelled or the
/// correlator is dropped first.
#[derive(Debug)]
pub struct AnswerFuture {
    question_id: String,
    rx: oneshot::Receiver<Vec<Answer>>,
}

impl AnswerFuture {
    /// Id of the question this future waits on.
    pub fn question_id(&self) -> &str {
        &self.question_id
    }
}

impl Future for AnswerFuture {
    type Output = Result<Vec<Answer>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| ReplError::Shutdown))
    }
}

/// Correlation table of pending questions.
pub struct AnswerCorrelator {
    local: LocalInstance,
    registry: Arc<InstanceRegistry>,
    relay: Arc<RelayEngine>,
    pending: Mutex<HashMap<String, PendingQuestion>>,
}

impl AnswerCorrelator {
    /// New correlator.
    pub fn new(local: LocalInstance, registry: Arc<InstanceRegistry>, relay: Arc<RelayEngine>) -> Self {
        Self {
            local,
            registry,
            relay,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Start waiting for answers to `question_id` from exactly `receivers`.
    /// An empty set resolves immediately.
    pub fn expect(&self, question_id: &str, receivers: HashSet<String>) -> Result<AnswerFuture> {
        let (done, rx) = oneshot::channel();
        if receivers.is_empty() {
            let _ = done.send(Vec::new());
        } else {
            let mut pending = self.pending.lock();
            if pending.contains_key(question_id) {
                return Err(ReplError::invalid(format!(
                    "question {} is already pending",
                    question_id
                )));
            }
            pending.insert(
                question_id.to_string(),
                PendingQuestion {
                    outstanding: receivers,
                    answers: Vec::new(),
                    done,
                },
            );
        }
        Ok(AnswerFuture {
            question_id: question_id.to_string(),
            rx,
        })
    }

    /// Send `question` and wait for answers from `receivers`, or from every
    /// registered instance when none are given.
    pub fn ask(&self, question: Message, receivers: Option<Vec<String>>) -> Result<AnswerFuture> {
        let mut outbound = question.into_outbound()?;
        let receivers = match receivers {
            Some(list) if !list.is_empty() => list,
            _ => self
                .registry
                .registered_instances()
                .into_iter()
                .map(|i| i.uri)
                .filter(|uri| *uri != self.local.uri)
                .collect(),
        };
        outbound.header.receivers = receivers.clone();
        outbound.instance = None;

        let id = outbound.id().to_string();
        let future = self.expect(&id, receivers.iter().cloned().collect())?;
        if receivers.is_empty() {
            debug!(question = %id, "no instance to ask");
            return Ok(future);
        }
        if let Err(e) = self.relay.relay_to(&outbound, &receivers) {
            self.cancel(&id);
            return Err(e);
        }
        info!(question = %id, kind = %outbound.header.kind, receivers = receivers.len(), "question sent");
        Ok(future)
    }

    /// [`AnswerCorrelator::ask`] bounded by `timeout`. The entry is evicted
    /// on expiry.
    pub async fn ask_timeout(
        &self,
        question: Message,
        receivers: Option<Vec<String>>,
        timeout: Duration,
    ) -> Result<Vec<Answer>> {
        let future = self.ask(question, receivers)?;
        let id = future.question_id().to_string();
        match tokio::time::timeout(timeout, future).await {
            Ok(result) => result,
            Err(_) => {
                self.cancel(&id);
                Err(ReplError::Timeout {
                    ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Record an incoming answer.
    pub fn on_receive(&self, mut answer: Message) -> Result<()> {
        let question_id = answer
            .header
            .metadata
            .first(QUESTION_KEY)
            .ok_or_else(|| ReplError::invalid("answer without question id"))?
            .to_string();
        let responder = answer.header.source.clone();

        let mut pending = self.pending.lock();
        let entry = pending
            .get_mut(&question_id)
            .ok_or_else(|| ReplError::invalid(format!("unknown question {}", question_id)))?;
        if !entry.outstanding.contains(&responder) {
            return Err(ReplError::invalid(format!(
                "unexpected answer from {} to question {}",
                responder, question_id
            )));
        }
        let body = answer.payload.take()?;
        entry.outstanding.remove(&responder);
        entry.answers.push(Answer {
            source: responder.clone(),
            header: answer.header,
            body,
        });
        debug!(question = %question_id, from = %responder, outstanding = entry.outstanding.len(), "answer received");

        if entry.outstanding.is_empty() {
            if let Some(done) = pending.remove(&question_id) {
                let _ = done.done.send(done.answers);
            }
        }
        Ok(())
    }

    /// Forget a pending question. Returns true if it was pending.
    pub fn cancel(&self, question_id: &str) -> bool {
        let removed = self.pending.lock().remove(question_id).is_some();
        if removed {
            debug!(question = %question_id, "question cancelled");
        }
        removed
    }

    /// Number of pending questions.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Instances that have not answered `question_id` yet.
    pub fn outstanding(&self, question_id: &str) -> Option<HashSet<String>> {
        self.pending
            .lock()
            .get(question_id)
            .map(|p| p.outstanding.clone())
    }

    /// Reply to `question` with `body`, addressed to its origin.
    pub fn answer_to(&self, question: &MessageHeader, body: impl Into<Bytes>) -> Result<()> {
        let reply = answer_message(question, &self.local.uri, body);
        let target = self
            .registry
            .get_instance_by_uri(&question.source)
            .filter(|i| i.is_registered())
            .ok_or_else(|| ReplError::UnknownInstance {
                instance: question.source.clone(),
            })?;
        self.relay.relay_to(&reply, &[target.uri])?;
        Ok(())
    }
}

/// Answer message for `question`, from `local_uri`.
pub fn answer_message(question: &MessageHeader, local_uri: &str, body: impl Into<Bytes>) -> OutboundMessage {
    let mut header = MessageHeader::new(Uuid::new_v4().to_string(), ANSWER_TYPE, local_uri);
    header.receivers = vec![question.source.clone()];
    header.metadata.set(QUESTION_KEY, question.id.clone());
    OutboundMessage::new(header, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{
        Instance, InstanceStatus, RegisterOutcome, RegisterResponse, RegistrationRequest,
    };
    use crate::message_log::MessageLog;
    use crate::sender::{RetryConfig, SenderQueues};
    use crate::signing::NoopSigner;
    use crate::topology::{ReplicationConfig, TopologyResolver};
    use crate::transport::PeerClient;
    use async_trait::async_trait;

    struct SilentPeer;

    #[async_trait]
    impl PeerClient for SilentPeer {
        async fn send_message(&self, _t: &Instance, _m: &OutboundMessage, _s: Option<&str>) -> Result<()> {
            Ok(())
        }

        async fn register(&self, uri: &str, _r: &RegistrationRequest) -> Result<RegisterResponse> {
            Ok(RegisterResponse {
                instance: LocalInstance::new("x", "x", uri),
                outcome: RegisterOutcome::Created,
                status: None,
                key: None,
            })
        }

        async fn unregister(&self, _uri: &str, _id: &str) -> Result<bool> {
            Ok(true)
        }
    }

    fn correlator(peers: &[&str]) -> AnswerCorrelator {
        let local = LocalInstance::new("q", "q", "http://q");
        let client: Arc<dyn PeerClient> = Arc::new(SilentPeer);
        let registry = Arc::new(InstanceRegistry::in_memory(local.clone(), client.clone()));
        for uri in peers {
            registry
                .add_instance(Instance::new(*uri, *uri, *uri, InstanceStatus::Registered))
                .unwrap();
        }
        let log = Arc::new(MessageLog::in_memory());
        let sender = Arc::new(SenderQueues::new(
            registry.clone(),
            log.clone(),
            client,
            Arc::new(NoopSigner),
            RetryConfig::default(),
        ));
        let topology = Arc::new(TopologyResolver::in_memory(ReplicationConfig::default()));
        let relay = Arc::new(RelayEngine::new(local.clone(), registry.clone(), log, sender, topology));
        AnswerCorrelator::new(local, registry, relay)
    }

    fn answer(question: &str, from: &str, body: &'static [u8]) -> Message {
        let mut header = MessageHeader::new(Uuid::new_v4().to_string(), ANSWER_TYPE, from);
        header.metadata.set(QUESTION_KEY, question);
        Message::new(header, Bytes::from_static(body))
    }

    fn set(uris: &[&str]) -> HashSet<String> {
        uris.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_completes_after_all_answers() {
        let c = correlator(&[]);
        let future = c.expect("q1", set(&["http://a", "http://b"])).unwrap();
        c.on_receive(answer("q1", "http://b", b"from b")).unwrap();
        assert_eq!(c.outstanding("q1"), Some(set(&["http://a"])));
        c.on_receive(answer("q1", "http://a", b"from a")).unwrap();
        assert_eq!(c.pending(), 0);

        let answers = future.await.unwrap();
        let sources: Vec<_> = answers.iter().map(|a| a.source.as_str()).collect();
        assert_eq!(sources, vec!["http://b", "http://a"]);
        assert_eq!(answers[1].body, Bytes::from_static(b"from a"));
    }

    #[tokio::test]
    async fn test_unexpected_responder_rejected() {
        let c = correlator(&[]);
        let _future = c.expect("q1", set(&["http://a", "http://b"])).unwrap();
        let err = c.on_receive(answer("q1", "http://c", b"x")).unwrap_err();
        assert!(matches!(err, ReplError::InvalidMessage { .. }));
        assert_eq!(c.outstanding("q1").unwrap().len(), 2);

        c.on_receive(answer("q1", "http://a", b"x")).unwrap();
        let again = c.on_receive(answer("q1", "http://a", b"x"));
        assert!(matches!(again, Err(ReplError::InvalidMessage { .. })));
    }

    #[test]
    fn test_unknown_question_rejected() {
        let c = correlator(&[]);
        let err = c.on_receive(answer("nope", "http://a", b"x")).unwrap_err();
        assert!(matches!(err, ReplError::InvalidMessage { .. }));

        let mut header = MessageHeader::new("m", ANSWER_TYPE, "http://a");
        header.metadata.set("other", "x");
        assert!(c.on_receive(Message::new(header, Bytes::new())).is_err());
    }

    #[tokio::test]
    async fn test_empty_receivers_complete_immediately() {
        let c = correlator(&[]);
        let answers = c.expect("q1", HashSet::new()).unwrap().await.unwrap();
        assert!(answers.is_empty());
        assert_eq!(c.pending(), 0);
    }

    #[tokio::test]
    async fn test_cancel_fails_future() {
        let c = correlator(&[]);
        let future = c.expect("q1", set(&["http://a"])).unwrap();
        assert!(c.cancel("q1"));
        assert!(matches!(future.await, Err(ReplError::Shutdown)));
        assert!(!c.cancel("q1"));
    }

    #[test]
    fn test_duplicate_question_id_rejected() {
        let c = correlator(&[]);
        let _f = c.expect("q1", set(&["http://a"])).unwrap();
        assert!(c.expect("q1", set(&["http://b"])).is_err());
    }

    #[tokio::test]
    async fn test_ask_defaults_to_registered_instances() {
        let c = correlator(&["http://a", "http://b"]);
        let question = Message::new(MessageHeader::new("q1", "ping", "http://q"), Bytes::new());
        let future = c.ask(question, None).unwrap();
        assert_eq!(c.outstanding("q1"), Some(set(&["http://a", "http://b"])));

        c.on_receive(answer("q1", "http://a", b"1")).unwrap();
        c.on_receive(answer("q1", "http://b", b"2")).unwrap();
        assert_eq!(future.await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ask_timeout_evicts() {
        let c = correlator(&["http://a"]);
        let question = Message::new(MessageHeader::new("q1", "ping", "http://q"), Bytes::new());
        let result = c
            .ask_timeout(question, Some(vec!["http://a".into()]), Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(ReplError::Timeout { ms: 5000 })));
        assert_eq!(c.pending(), 0);
    }

    #[test]
    fn test_answer_message_shape() {
        let question = MessageHeader::new("q1", "ping", "http://origin");
        let reply = answer_message(&question, "http://me", Bytes::from_static(b"pong"));
        assert_eq!(reply.header.kind, ANSWER_TYPE);
        assert_eq!(reply.header.source, "http://me");
        assert_eq!(reply.header.receivers, vec!["http://origin".to_string()]);
        assert_eq!(reply.header.metadata.first("Question"), Some("q1"));
    }
}
