//! Admission listener
//!
//! Accepts connections on the daemon's Unix socket. Each connection carries one
//! request: it is decoded, validated and answered with an acknowledgment before the
//! connection is closed, and accepted tasks are then handed to the ranker.
use crate::AppState;
use crate::errors::{AdmissionError, DaemonError};
use crate::protocol::{self, AckMessage, RequestMessage};
use crate::ranker;
use crate::task::Task;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bind the admission socket, replacing a stale socket file left by an earlier run.
pub fn bind(path: &Path) -> Result<UnixListener, DaemonError> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(source) => {
            return Err(DaemonError::Bind {
                path: path.to_path_buf(),
                source,
            });
        }
    }
    UnixListener::bind(path).map_err(|source| DaemonError::Bind {
        path: path.to_path_buf(),
        source,
    })
}

/// Accept connections until `shutdown` flips to `true`, then remove the socket file.
#[instrument(skip_all, fields(socket = %socket_path.display()))]
pub async fn run(
    listener: UnixListener,
    socket_path: PathBuf,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Accepting tasks");
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(handle_connection(Arc::clone(&state), stream));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    drop(listener);
    if let Err(e) = std::fs::remove_file(&socket_path) {
        if e.kind() != ErrorKind::NotFound {
            warn!(error = %e, "Failed to remove socket file");
        }
    }
    info!("Stopped accepting tasks");
}

async fn handle_connection(state: Arc<AppState>, mut stream: UnixStream) {
    let outcome = read_request(&state, &mut stream).await;
    let ack = match &outcome {
        Ok(_) => AckMessage::accepted(),
        Err(reason) => AckMessage::rejected(reason),
    };

    if let Err(e) = protocol::write_message(&mut stream, &ack).await {
        debug!(error = %e, "Failed to write acknowledgment");
    }
    let _ = stream.shutdown().await;
    drop(stream);

    match outcome {
        Ok(task) => {
            info!(
                task_id = %task.id,
                ranked = task.ranked,
                priority = ?task.priority(),
                "Accepted task"
            );
            ranker::hand_off(&state, task);
        }
        Err(reason) => {
            info!(%reason, "Rejected task");
        }
    }
}

async fn read_request(state: &AppState, stream: &mut UnixStream) -> Result<Task, AdmissionError> {
    let read_timeout = state.config.read_timeout;
    let request: RequestMessage = tokio::time::timeout(
        read_timeout,
        protocol::read_message(stream, state.config.max_message_bytes),
    )
    .await
    .map_err(|_| AdmissionError::ReadTimeout(read_timeout))??;

    admit(state, request)
}

/// Validate a request and reserve everything an accepted task needs: its id in the
/// live set, a queue slot and its place in arrival order. On error nothing stays
/// reserved.
pub fn admit(state: &AppState, request: RequestMessage) -> Result<Task, AdmissionError> {
    let mut task = request.into_task()?;

    if !state.register(task.id) {
        return Err(AdmissionError::DuplicateId(task.id));
    }
    match state.scheduler.try_admit() {
        Ok(sequence) => {
            task.set_sequence(sequence);
            Ok(task)
        }
        Err(e) => {
            state.unregister(&task.id);
            Err(e)
        }
    }
}
