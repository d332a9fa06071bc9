//! Shared helpers for the daemon integration tests: an in-process server on a
//! temporary socket, a callback sink, and model handles with controllable timing.
#![allow(dead_code)]

use granville::driver::{ModelHandle, Ranking, rules};
use granville::errors::DriverError;
use granville::pool::ModelPool;
use granville::protocol::{self, AckMessage, RequestMessage, ResultMessage};
use granville::{AppState, ServeConfig, Server};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const RESULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A server running in-process on a socket inside its own temporary directory.
pub struct TestDaemon {
    pub server: Server,
    pub dir: TempDir,
}

impl TestDaemon {
    pub async fn start(handles: Vec<Box<dyn ModelHandle>>) -> Self {
        Self::start_with(handles, ServeConfig::default()).await
    }

    pub async fn start_with(handles: Vec<Box<dyn ModelHandle>>, mut config: ServeConfig) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        config.socket_path = dir.path().join("granville.sock");

        let handles = handles
            .into_iter()
            .enumerate()
            .map(|(i, handle)| (PathBuf::from(format!("model-{i}.bin")), handle))
            .collect();
        let pool = ModelPool::from_handles("test", handles).expect("Failed to build pool");
        let state = Arc::new(AppState::new(config, Arc::new(pool)));
        let server = Server::start(state).await.expect("Failed to start server");
        Self { server, dir }
    }

    pub fn socket(&self) -> &Path {
        self.server.socket_path()
    }

    pub fn sink(&self, name: &str) -> CallbackSink {
        CallbackSink::bind(&self.dir.path().join(format!("{name}.sock")))
    }

    pub async fn submit(&self, request: &RequestMessage) -> AckMessage {
        submit(self.socket(), request).await
    }
}

/// Send one request and read the acknowledgment.
pub async fn submit(socket: &Path, request: &RequestMessage) -> AckMessage {
    let mut stream = UnixStream::connect(socket)
        .await
        .expect("Failed to connect to daemon");
    protocol::write_message(&mut stream, request)
        .await
        .expect("Failed to send request");
    protocol::read_message(&mut stream, 64 * 1024)
        .await
        .expect("Failed to read acknowledgment")
}

pub fn request(text: &str, callback: &CallbackSink) -> RequestMessage {
    RequestMessage {
        id: Some(Uuid::new_v4().to_string()),
        text: Some(text.to_string()),
        callback: Some(callback.addr()),
        ..Default::default()
    }
}

/// Accepts result deliveries on a Unix socket and forwards the decoded messages.
pub struct CallbackSink {
    path: PathBuf,
    rx: mpsc::UnboundedReceiver<ResultMessage>,
    task: JoinHandle<()>,
}

impl CallbackSink {
    pub fn bind(path: &Path) -> Self {
        let listener = UnixListener::bind(path).expect("Failed to bind callback socket");
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Ok(message) = protocol::read_message(&mut stream, 1024 * 1024).await {
                        let _ = tx.send(message);
                    }
                });
            }
        });
        Self {
            path: path.to_path_buf(),
            rx,
            task,
        }
    }

    pub fn addr(&self) -> String {
        self.path.display().to_string()
    }

    pub async fn recv(&mut self) -> ResultMessage {
        tokio::time::timeout(RESULT_TIMEOUT, self.rx.recv())
            .await
            .expect("Timed out waiting for a result")
            .expect("Callback sink closed")
    }

    pub async fn recv_n(&mut self, n: usize) -> Vec<ResultMessage> {
        let mut results = Vec::with_capacity(n);
        for _ in 0..n {
            results.push(self.recv().await);
        }
        results
    }

    /// Assert that nothing arrives within `wait`.
    pub async fn expect_nothing(&mut self, wait: Duration) {
        if let Ok(Some(message)) = tokio::time::timeout(wait, self.rx.recv()).await {
            panic!("Unexpected result delivered: {message:?}");
        }
    }
}

impl Drop for CallbackSink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Poll `condition` every few milliseconds until it holds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(RESULT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timed out waiting for {what}"));
}

/// Ranks with the built-in rules and takes `delay` to generate.
pub struct SlowHandle {
    pub delay: Duration,
}

impl ModelHandle for SlowHandle {
    fn generate(&mut self, text: &str, _max_tokens: Option<u32>) -> Result<String, DriverError> {
        std::thread::sleep(self.delay);
        Ok(json!({ "text": text }).to_string())
    }

    fn rank_and_redact(&mut self, text: &str) -> Result<Ranking, DriverError> {
        Ok(rules::rank(text))
    }
}

/// Records the order generations start in. A generation of the text `"block"`
/// waits until the test opens the gate.
pub struct GatedHandle {
    pub log: Arc<Mutex<Vec<String>>>,
    pub gate: std_mpsc::Receiver<()>,
}

impl GatedHandle {
    pub fn new() -> (Self, Arc<Mutex<Vec<String>>>, std_mpsc::Sender<()>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (open, gate) = std_mpsc::channel();
        let handle = Self {
            log: Arc::clone(&log),
            gate,
        };
        (handle, log, open)
    }
}

impl ModelHandle for GatedHandle {
    fn generate(&mut self, text: &str, _max_tokens: Option<u32>) -> Result<String, DriverError> {
        self.log.lock().unwrap().push(text.to_string());
        if text == "block" {
            let _ = self.gate.recv();
        }
        Ok(json!({ "text": text }).to_string())
    }

    fn rank_and_redact(&mut self, text: &str) -> Result<Ranking, DriverError> {
        Ok(rules::rank(text))
    }
}

/// Every call fails.
pub struct FailingHandle;

impl ModelHandle for FailingHandle {
    fn generate(&mut self, _text: &str, _max_tokens: Option<u32>) -> Result<String, DriverError> {
        Err(DriverError::Generate("out of memory".to_string()))
    }

    fn rank_and_redact(&mut self, _text: &str) -> Result<Ranking, DriverError> {
        Err(DriverError::Rank("model unavailable".to_string()))
    }
}
