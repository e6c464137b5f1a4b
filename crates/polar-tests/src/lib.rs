//! Test doubles and fixtures for the polar integration tests.
//!
//! Nothing here talks to a real daemon: [`MockTransport`] answers HTTP
//! requests from a per-path script, [`MockConnector`] hands out in-memory
//! streaming connections and [`MockEventQueue`] plays a daemon's pending
//! event queue.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use polar_core::{Config, Error, Implementation, LightningNode, NodePaths, NodePorts, PendingEvent};
use polar_nodes::{
    EventSource, HttpRequest, HttpResponse, HttpTransport, LightningFactory, RequestBody,
    StreamConnection, StreamConnector, StreamTarget,
};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::{Notify, broadcast};

/// Admin macaroon bytes written for LND fixtures.
pub const MACAROON: [u8; 3] = [0x02, 0x01, 0x03];

/// Rune written for c-lightning fixtures.
pub const RUNE: &str = "test-rune";

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Respond with a status and JSON body.
    Json(u16, Value),
    /// Fail without a response.
    Unreachable(String),
    /// Never answer, like a long poll with nothing to deliver.
    Hang,
}

/// Long-poll endpoint returning the head of a daemon event queue.
pub const WAIT_NEXT_PATH: &str = "/v1/events/wait_next";

/// Endpoint acknowledging the head of a daemon event queue.
pub const HANDLED_PATH: &str = "/v1/events/handled";

/// Scripted [`HttpTransport`].
///
/// Replies are looked up by URL path, query included first and then without
/// it. A path's replies are consumed in order and the last one repeats.
/// The event endpoints can instead be served from a [`MockEventQueue`].
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<HttpRequest>>,
    events: Mutex<Option<Arc<MockEventQueue>>>,
}

impl MockTransport {
    /// Create a transport with no routes.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer `path` with `200` and `body`.
    pub fn respond(&self, path: &str, body: Value) {
        self.script(path, vec![Reply::Json(200, body)]);
    }

    /// Answer `path` with `status` and `body`.
    pub fn respond_status(&self, path: &str, status: u16, body: Value) {
        self.script(path, vec![Reply::Json(status, body)]);
    }

    /// Fail requests to `path` as unreachable.
    pub fn unreachable(&self, path: &str) {
        self.script(path, vec![Reply::Unreachable("connection refused".into())]);
    }

    /// Answer `path` with `replies` in order, repeating the last.
    pub fn script(&self, path: &str, replies: Vec<Reply>) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), replies.into());
    }

    /// Serve the event endpoints from `queue` instead of a script.
    pub fn serve_events(&self, queue: Arc<MockEventQueue>) {
        *self.events.lock().unwrap() = Some(queue);
    }

    /// Every request sent so far.
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests sent to `path`, query ignored.
    #[must_use]
    pub fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| strip_query(url_path(&r.url)) == path)
            .collect()
    }

    /// JSON body of the last request to `path`.
    #[must_use]
    pub fn last_json(&self, path: &str) -> Option<Value> {
        self.requests_to(path).pop().and_then(|r| match r.body {
            RequestBody::Json(json) => Some(json),
            _ => None,
        })
    }

    /// Form fields of the last request to `path`.
    #[must_use]
    pub fn last_form(&self, path: &str) -> Option<HashMap<String, String>> {
        self.requests_to(path).pop().and_then(|r| match r.body {
            RequestBody::Form(fields) => Some(fields.into_iter().collect()),
            _ => None,
        })
    }

    fn next_reply(&self, path: &str) -> Option<Reply> {
        let mut routes = self.routes.lock().unwrap();
        let key = if routes.contains_key(path) {
            path
        } else {
            strip_query(path)
        };
        let queue = routes.get_mut(key)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> polar_core::Result<HttpResponse> {
        let path = url_path(&request.url).to_string();
        self.requests.lock().unwrap().push(request);

        let events = self.events.lock().unwrap().clone();
        if let Some(queue) = events {
            match strip_query(&path) {
                WAIT_NEXT_PATH => {
                    let event = queue.wait_next().await?;
                    return Ok(HttpResponse {
                        status: 200,
                        body: serde_json::to_value(event)?,
                    });
                }
                HANDLED_PATH => {
                    let ok = queue.handled().await.is_ok();
                    return Ok(HttpResponse {
                        status: 200,
                        body: serde_json::json!({ "ok": ok }),
                    });
                }
                _ => {}
            }
        }

        match self.next_reply(&path) {
            Some(Reply::Json(status, body)) => Ok(HttpResponse { status, body }),
            Some(Reply::Unreachable(message)) => Err(Error::Transport(message)),
            Some(Reply::Hang) => std::future::pending().await,
            None => Ok(HttpResponse {
                status: 404,
                body: Value::String(format!("no route for {path}")),
            }),
        }
    }
}

fn url_path(url: &str) -> &str {
    let after_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    after_scheme.find('/').map_or("/", |i| &after_scheme[i..])
}

fn strip_query(path: &str) -> &str {
    path.split_once('?').map_or(path, |(path, _)| path)
}

/// In-memory streaming connection handed out by [`MockConnector`].
pub struct MockConnection {
    /// Target the connection was opened for.
    pub target: StreamTarget,
    open: AtomicBool,
    tx: broadcast::Sender<String>,
}

impl MockConnection {
    /// Deliver `message` to subscribers as if the daemon sent it.
    pub fn push(&self, message: impl Into<String>) {
        let _ = self.tx.send(message.into());
    }

    /// Whether the connection has not been disconnected.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Drop the connection from the daemon's side.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

struct SharedConnection(Arc<MockConnection>);

impl StreamConnection for SharedConnection {
    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.0.tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.0.is_open()
    }

    fn disconnect(&self) {
        self.0.close();
    }
}

/// Scripted [`StreamConnector`] counting the connections it creates.
#[derive(Default)]
pub struct MockConnector {
    delay: Duration,
    refuse: AtomicBool,
    attempts: AtomicUsize,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnector {
    /// Connector that connects immediately.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connector that takes `delay` to connect.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    /// Make further connection attempts fail.
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connections created.
    #[must_use]
    pub fn created(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Number of connection attempts, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of created connections that were disconnected.
    #[must_use]
    pub fn disconnected(&self) -> usize {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.is_open())
            .count()
    }

    /// Connections created so far, oldest first.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().unwrap().clone()
    }

    /// The most recently created connection.
    #[must_use]
    pub fn last(&self) -> Option<Arc<MockConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl StreamConnector for MockConnector {
    async fn connect(&self, target: &StreamTarget) -> polar_core::Result<Box<dyn StreamConnection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("refused {}", target.url)));
        }

        let (tx, _) = broadcast::channel(64);
        let connection = Arc::new(MockConnection {
            target: target.clone(),
            open: AtomicBool::new(true),
            tx,
        });
        self.connections.lock().unwrap().push(Arc::clone(&connection));
        Ok(Box::new(SharedConnection(connection)))
    }
}

/// A daemon-side pending event queue.
///
/// `wait_next` returns the head without removing it and blocks while the
/// queue is empty; `handled` removes the head.
#[derive(Default)]
pub struct MockEventQueue {
    events: Mutex<VecDeque<PendingEvent>>,
    notify: Notify,
    delivered: Mutex<Vec<PendingEvent>>,
    acknowledged: Mutex<Vec<PendingEvent>>,
}

impl MockEventQueue {
    /// Queue holding `events`.
    #[must_use]
    pub fn with_events(events: impl IntoIterator<Item = PendingEvent>) -> Arc<Self> {
        let queue = Self::default();
        queue.events.lock().unwrap().extend(events);
        Arc::new(queue)
    }

    /// Append an event.
    pub fn push(&self, event: PendingEvent) {
        self.events.lock().unwrap().push_back(event);
        self.notify.notify_waiters();
    }

    /// Events returned by `wait_next`, in order.
    #[must_use]
    pub fn delivered(&self) -> Vec<PendingEvent> {
        self.delivered.lock().unwrap().clone()
    }

    /// Events removed by `handled`, in order.
    #[must_use]
    pub fn acknowledged(&self) -> Vec<PendingEvent> {
        self.acknowledged.lock().unwrap().clone()
    }

    /// Events still queued.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl EventSource for MockEventQueue {
    async fn wait_next(&self) -> polar_core::Result<PendingEvent> {
        loop {
            let notified = self.notify.notified();
            let head = self.events.lock().unwrap().front().cloned();
            if let Some(event) = head {
                self.delivered.lock().unwrap().push(event.clone());
                return Ok(event);
            }
            notified.await;
        }
    }

    async fn handled(&self) -> polar_core::Result<()> {
        let head = self.events.lock().unwrap().pop_front();
        match head {
            Some(event) => {
                self.acknowledged.lock().unwrap().push(event);
                Ok(())
            }
            None => Err(Error::protocol("events/handled", "no event to acknowledge")),
        }
    }
}

/// A factory wired to mocks, with credential files on disk.
pub struct Harness {
    /// Directory holding credentials; removed on drop.
    pub dir: TempDir,
    /// Scripted HTTP transport.
    pub transport: Arc<MockTransport>,
    /// Scripted stream connector.
    pub connector: Arc<MockConnector>,
    /// Factory under test.
    pub factory: LightningFactory,
}

impl Harness {
    /// Harness with the default configuration.
    pub fn new() -> Result<Self> {
        Self::build(MockConnector::new(), |_| {})
    }

    /// Harness whose connector takes `delay` to connect.
    pub fn with_connect_delay(delay: Duration) -> Result<Self> {
        Self::build(MockConnector::with_delay(delay), |_| {})
    }

    /// Harness with a tweaked configuration.
    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Result<Self> {
        Self::build(MockConnector::new(), tweak)
    }

    fn build(connector: Arc<MockConnector>, tweak: impl FnOnce(&mut Config)) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        write_credentials(dir.path())?;

        let mut config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        tweak(&mut config);

        let transport = MockTransport::new();
        let factory =
            LightningFactory::with_transports(config, transport.clone(), connector.clone());
        Ok(Self {
            dir,
            transport,
            connector,
            factory,
        })
    }

    /// A node named `name` with its REST API on `rest`.
    #[must_use]
    pub fn node(&self, implementation: Implementation, name: &str, rest: u16) -> LightningNode {
        node(1, implementation, name, rest)
    }
}

/// A node descriptor with credential paths relative to the data directory.
#[must_use]
pub fn node(network_id: u32, implementation: Implementation, name: &str, rest: u16) -> LightningNode {
    LightningNode::new(
        network_id,
        name,
        implementation,
        NodePorts {
            rest,
            grpc: Some(rest + 1000),
            p2p: 9735,
            web: None,
        },
    )
    .with_paths(NodePaths {
        admin_macaroon: Some("admin.macaroon".into()),
        rune: Some("rune".into()),
        ..NodePaths::default()
    })
}

fn write_credentials(dir: &Path) -> std::io::Result<()> {
    std::fs::write(dir.join("admin.macaroon"), MACAROON)?;
    std::fs::write(dir.join("rune"), RUNE)
}

/// Poll `condition` every few milliseconds for up to a second.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
