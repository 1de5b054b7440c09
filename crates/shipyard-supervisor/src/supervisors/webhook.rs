//! Webhook delivery.
//!
//! Each subscription has a cursor into the event log. Events past the
//! cursor that match the subscription's filters are POSTed one at a time;
//! the cursor only moves once the receiver answers 2xx, so delivery is at
//! least once. A failing subscription is retried on the next pass and is
//! flagged `degraded` after `failure_threshold` consecutive failures.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use shipyard_state::{Record, StateChangeEvent, Subscription};
use tracing::{debug, info, warn};

use super::SupervisorDeps;
use crate::error::{SupervisorError, SupervisorResult};
use crate::scheduler::{Cadence, Supervisor, WorkFuture};

/// Events read from the log per subscription and pass.
const BATCH: usize = 100;

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// Transport for webhook payloads.
pub trait WebhookSender: Send + Sync {
    fn send<'a>(&'a self, url: &'a str, payload: &'a [u8]) -> SendFuture<'a>;
}

/// Plain HTTP/1.1 POST with a bounded timeout.
#[derive(Debug, Clone)]
pub struct HttpWebhookSender {
    timeout: Duration,
}

impl HttpWebhookSender {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn post(url: &str, payload: &[u8]) -> Result<(), String> {
        let uri: http::Uri = url.parse().map_err(|e| format!("invalid url {url}: {e}"))?;
        if uri.scheme_str().is_some_and(|s| s != "http") {
            return Err(format!("unsupported scheme in {url}"));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| format!("url {url} has no host"))?
            .clone();
        let address = match authority.port_u16() {
            Some(_) => authority.to_string(),
            None => format!("{}:80", authority.host()),
        };

        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| format!("connect {address}: {e}"))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| format!("handshake with {address}: {e}"))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "webhook connection closed with error");
            }
        });

        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(path)
            .header(http::header::HOST, authority.as_str())
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(http::header::USER_AGENT, "shipyard-webhook/0.1")
            .body(Full::new(Bytes::copy_from_slice(payload)))
            .map_err(|e| format!("build request: {e}"))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| format!("request to {url}: {e}"))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("{url} answered {}", response.status()))
        }
    }
}

impl WebhookSender for HttpWebhookSender {
    fn send<'a>(&'a self, url: &'a str, payload: &'a [u8]) -> SendFuture<'a> {
        Box::pin(async move {
            match tokio::time::timeout(self.timeout, Self::post(url, payload)).await {
                Ok(result) => result,
                Err(_) => Err(format!("{url} timed out after {:?}", self.timeout)),
            }
        })
    }
}

pub struct WebhookSupervisor {
    deps: SupervisorDeps,
    owner: String,
    sender: Arc<dyn WebhookSender>,
    failure_threshold: u32,
}

impl WebhookSupervisor {
    pub fn new(deps: SupervisorDeps, sender: Arc<dyn WebhookSender>, failure_threshold: u32) -> Self {
        let owner = deps.owner("webhook");
        Self {
            deps,
            owner,
            sender,
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub async fn run_once(&self) -> SupervisorResult<()> {
        let subscriptions = self.deps.store.list_all::<Subscription>(|_| true)?;
        for subscription in subscriptions {
            if let Err(e) = self.deliver(&subscription.id).await {
                warn!(subscription = %subscription.id, error = %e, "webhook delivery pass failed");
            }
        }
        Ok(())
    }

    /// Deliver pending events to one subscription. Returns how many were
    /// acknowledged by the receiver.
    pub async fn deliver(&self, id: &str) -> SupervisorResult<usize> {
        let Some(_guard) = self.deps.lock::<Subscription>(id, &self.owner)? else {
            return Ok(0);
        };
        let mut subscription = self.deps.store.require::<Subscription>(id)?;
        if subscription.is_deleted() {
            return Ok(0);
        }
        let events = self
            .deps
            .store
            .list_events(subscription.last_delivered_sequence, BATCH, |_| true)?;
        if events.is_empty() {
            return Ok(0);
        }

        let mut delivered = 0;
        for event in &events {
            if !subscription.matches(event) {
                subscription.last_delivered_sequence = event.sequence;
                continue;
            }
            match self.send(&subscription.url, event).await {
                Ok(()) => {
                    subscription.last_delivered_sequence = event.sequence;
                    if subscription.failure_count > 0 || subscription.degraded {
                        info!(subscription = %id, "webhook receiver recovered");
                    }
                    subscription.failure_count = 0;
                    subscription.degraded = false;
                    delivered += 1;
                }
                Err(e) => {
                    subscription.failure_count = subscription.failure_count.saturating_add(1);
                    if subscription.failure_count >= self.failure_threshold && !subscription.degraded {
                        subscription.degraded = true;
                        warn!(subscription = %id, failures = subscription.failure_count, "webhook subscription degraded");
                    }
                    debug!(subscription = %id, sequence = event.sequence, error = %e, "webhook delivery failed");
                    break;
                }
            }
        }
        subscription.last_attempt_at = self.deps.now();
        self.deps.store.update(&mut subscription)?;
        Ok(delivered)
    }

    async fn send(&self, url: &str, event: &StateChangeEvent) -> SupervisorResult<()> {
        let payload = serde_json::to_vec(event).map_err(|e| SupervisorError::Webhook(e.to_string()))?;
        self.sender
            .send(url, &payload)
            .await
            .map_err(SupervisorError::Webhook)
    }
}

impl Supervisor for WebhookSupervisor {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn cadence(&self) -> Cadence {
        Cadence::Slow
    }

    fn do_work(&self) -> WorkFuture<'_> {
        Box::pin(self.run_once())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisors::testing::Harness;
    use shipyard_state::{Cluster, ClusterMetadata, ClusterState, ResourceKind};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct FakeSender {
        down: AtomicBool,
        received: Mutex<Vec<StateChangeEvent>>,
    }

    impl FakeSender {
        fn received(&self) -> Vec<StateChangeEvent> {
            self.received.lock().unwrap().clone()
        }
    }

    impl WebhookSender for FakeSender {
        fn send<'a>(&'a self, _url: &'a str, payload: &'a [u8]) -> SendFuture<'a> {
            let result = if self.down.load(Ordering::SeqCst) {
                Err("connection refused".to_string())
            } else {
                let event: StateChangeEvent = serde_json::from_slice(payload).unwrap();
                self.received.lock().unwrap().push(event);
                Ok(())
            };
            Box::pin(std::future::ready(result))
        }
    }

    fn emit(harness: &Harness, id: &str) {
        let mut cluster = Cluster::new(id.to_string(), "aws", ClusterMetadata::default(), 0);
        harness.store().create(&mut cluster).unwrap();
        harness
            .deps
            .recorder
            .transition(&mut cluster, ClusterState::CreationInProgress)
            .unwrap();
    }

    fn subscribe(harness: &Harness, kind: Option<ResourceKind>) {
        let mut subscription = Subscription::new("s1".into(), "http://hooks.local/events".into(), 0);
        subscription.resource_type = kind;
        harness.store().create(&mut subscription).unwrap();
    }

    fn subscription(harness: &Harness) -> Subscription {
        harness.store().require::<Subscription>("s1").unwrap()
    }

    #[tokio::test]
    async fn delivers_in_order_and_advances_the_cursor() {
        let harness = Harness::new();
        subscribe(&harness, None);
        emit(&harness, "c1");
        emit(&harness, "c2");
        let sender = Arc::new(FakeSender::default());
        let supervisor = WebhookSupervisor::new(harness.deps.clone(), sender.clone(), 3);

        assert_eq!(supervisor.deliver("s1").await.unwrap(), 2);
        let ids: Vec<_> = sender.received().into_iter().map(|e| e.resource_id).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert_eq!(subscription(&harness).last_delivered_sequence, 2);

        assert_eq!(supervisor.deliver("s1").await.unwrap(), 0);
        assert_eq!(sender.received().len(), 2);
    }

    #[tokio::test]
    async fn filtered_events_are_skipped() {
        let harness = Harness::new();
        subscribe(&harness, Some(ResourceKind::Installation));
        emit(&harness, "c1");
        let sender = Arc::new(FakeSender::default());
        let supervisor = WebhookSupervisor::new(harness.deps.clone(), sender.clone(), 3);

        assert_eq!(supervisor.deliver("s1").await.unwrap(), 0);
        assert!(sender.received().is_empty());
        assert_eq!(subscription(&harness).last_delivered_sequence, 1);
    }

    #[tokio::test]
    async fn failures_degrade_then_recover() {
        let harness = Harness::new();
        subscribe(&harness, None);
        emit(&harness, "c1");
        let sender = Arc::new(FakeSender::default());
        sender.down.store(true, Ordering::SeqCst);
        let supervisor = WebhookSupervisor::new(harness.deps.clone(), sender.clone(), 2);

        supervisor.deliver("s1").await.unwrap();
        let failing = subscription(&harness);
        assert_eq!(failing.failure_count, 1);
        assert!(!failing.degraded);
        assert_eq!(failing.last_delivered_sequence, 0);
        assert_eq!(failing.last_attempt_at, 1_000_000);

        supervisor.deliver("s1").await.unwrap();
        assert!(subscription(&harness).degraded);

        sender.down.store(false, Ordering::SeqCst);
        assert_eq!(supervisor.deliver("s1").await.unwrap(), 1);
        let recovered = subscription(&harness);
        assert_eq!(recovered.failure_count, 0);
        assert!(!recovered.degraded);
        assert_eq!(recovered.last_delivered_sequence, 1);
    }

    /// Accept one connection, read a full request and answer with `status`.
    async fn one_shot_server(status: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{address}/hooks"), handle)
    }

    #[tokio::test]
    async fn http_sender_posts_json() {
        let (url, server) = one_shot_server("200 OK").await;
        let sender = HttpWebhookSender::new(Duration::from_secs(5));
        sender.send(&url, br#"{"sequence":1}"#).await.unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hooks HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("content-type: application/json"));
        assert!(request.ends_with(r#"{"sequence":1}"#));
    }

    #[tokio::test]
    async fn http_sender_reports_non_success() {
        let (url, server) = one_shot_server("500 Internal Server Error").await;
        let sender = HttpWebhookSender::new(Duration::from_secs(5));
        let err = sender.send(&url, b"{}").await.unwrap_err();
        assert!(err.contains("500"));
        server.await.unwrap();
    }
}
