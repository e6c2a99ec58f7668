//! In-memory stand-ins for the broker, HTTP server and reboot primitive.

#![allow(dead_code)]

use async_trait::async_trait;
use device_agent::firmware::{FirmwareUpdater, HttpFetcher, HttpResponse, UpdateError};
use device_agent::mqtt_service::{InboundMessage, Transport, TransportError, Will};
use device_agent::service_utils::Rebooter;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug, Default)]
pub struct Broker {
    pub will: Option<Will>,
    pub connected: bool,
    pub disconnects: usize,
    pub subscriptions: Vec<String>,
    pub published: Vec<Published>,
    pub inbox: VecDeque<InboundMessage>,
    pub fail_connect: bool,
    pub fail_publish: bool,
    pub fail_next_receives: usize,
}

impl Broker {
    pub fn published_to(&self, topic: &str) -> Vec<&Published> {
        self.published.iter().filter(|p| p.topic == topic).collect()
    }
}

#[derive(Clone, Default)]
pub struct MockTransport {
    pub broker: Arc<Mutex<Broker>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_inbound(&self, topic: &str, payload: &[u8]) {
        self.broker.lock().unwrap().inbox.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, will: Will) -> Result<(), TransportError> {
        let mut broker = self.broker.lock().unwrap();
        broker.will = Some(will);
        if broker.fail_connect {
            return Err(TransportError::Connect("connection refused".into()));
        }
        broker.connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.broker.lock().unwrap().subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), TransportError> {
        let mut broker = self.broker.lock().unwrap();
        if broker.fail_publish {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "queue full".into(),
            });
        }
        broker.published.push(Published {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            qos,
            retain,
        });
        Ok(())
    }

    async fn try_recv(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        let mut broker = self.broker.lock().unwrap();
        if broker.fail_next_receives > 0 {
            broker.fail_next_receives -= 1;
            return Err(TransportError::Receive("connection reset".into()));
        }
        Ok(broker.inbox.pop_front())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut broker = self.broker.lock().unwrap();
        broker.connected = false;
        broker.disconnects += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingRebooter {
    count: AtomicUsize,
}

impl CountingRebooter {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Rebooter for CountingRebooter {
    fn reboot(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Serves one canned response and records requested URLs.
#[derive(Clone)]
pub struct MockFetcher {
    pub status: u16,
    pub body: Vec<u8>,
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new(status: u16, body: &[u8]) -> Self {
        Self {
            status,
            body: body.to_vec(),
            requests: Arc::default(),
        }
    }

    pub fn requested(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpFetcher for MockFetcher {
    async fn get(&self, url: &str) -> Result<HttpResponse, UpdateError> {
        self.requests.lock().unwrap().push(url.to_string());
        Ok(HttpResponse {
            status: self.status,
            body: self.body.clone(),
        })
    }
}

pub fn updater(
    dir: &Path,
    fetcher: MockFetcher,
    rebooter: Arc<CountingRebooter>,
) -> FirmwareUpdater {
    FirmwareUpdater::new(
        dir.join("app.py"),
        dir.join("archive"),
        Box::new(fetcher),
        rebooter,
    )
}

pub fn upgrade_payload(url: &str) -> Vec<u8> {
    format!(r#"{{"d":{{"upgrade":{{"fw_url":"{}"}}}}}}"#, url).into_bytes()
}
