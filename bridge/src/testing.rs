//! Test doubles for the bridge's I/O seams
//!
//! [`ScriptedTransport`] answers HTTP requests from a closure and records what
//! it was sent; [`RecordingSink`] keeps every event it receives and can be
//! told to fail. Both are public so integration tests and embedders can drive
//! a [`Bridge`](crate::Bridge) without a controller or Grafana.

use crate::upstream::transport::{HttpRequest, HttpResponse, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use vahti_core::{CanonicalEvent, Sink, SinkError};

type Responder = dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// Transport that answers every request from a closure
pub struct ScriptedTransport {
    responder: Box<Responder>,
    delay: Option<Duration>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep this long (tokio time) before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every request received so far, in order
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests whose URL contains `fragment`
    pub fn requests_matching(&self, fragment: &str) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.contains(fragment))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(&request)
    }
}

/// Sink that records delivered events
pub struct RecordingSink {
    name: &'static str,
    events: Mutex<Vec<CanonicalEvent>>,
    failing: AtomicBool,
    /// Fail only for events whose id is listed
    fail_ids: Mutex<Vec<String>>,
    attempts: AtomicU64,
    shutdown: AtomicBool,
}

impl RecordingSink {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            events: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            fail_ids: Mutex::new(Vec::new()),
            attempts: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Reject every delivery while set
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Reject deliveries of this event id
    pub fn fail_on(&self, id: impl Into<String>) {
        self.fail_ids.lock().push(id.into());
    }

    /// Events accepted so far, in delivery order
    pub fn events(&self) -> Vec<CanonicalEvent> {
        self.events.lock().clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.id.clone()).collect()
    }

    /// Deliveries attempted, including rejected ones
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn was_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn emit(&self, event: &CanonicalEvent) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) || self.fail_ids.lock().contains(&event.id) {
            return Err(SinkError::Rejected {
                status: 500,
                message: "scripted failure".to_string(),
            });
        }
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn health(&self) -> bool {
        !self.failing.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<(), SinkError> {
        self.shutdown.store(true, Ordering::SeqCst);
        Ok(())
    }
}
