//! Command-line parsing and validation
//!
//! Parsing is done with clap; [`ServeArgs::validate`] turns the `serve` arguments
//! into the [`ServeConfig`] the library runs with.
use anyhow::{anyhow, bail};
use clap::{Args, Parser, Subcommand};
use granville::protocol::DEFAULT_MAX_MESSAGE_BYTES;
use granville::{DEFAULT_SOCKET_PATH, ServeConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound for `--callback-retries`.
pub const MAX_CALLBACK_RETRIES: u32 = 10;

#[derive(Debug, Parser)]
#[command(name = "granville", version, about = "Local inference daemon", long_about = None)]
pub struct Cli {
    /// Enable debug logging for granville.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load models and serve tasks on a Unix socket.
    Serve(ServeArgs),

    /// Inspect the available model drivers.
    Driver {
        #[command(subcommand)]
        command: DriverCommand,
    },

    /// Print the version.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum DriverCommand {
    /// List the registered drivers.
    List,
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Model files to load; each becomes one model instance.
    #[arg(value_name = "MODEL")]
    pub models: Vec<PathBuf>,

    /// Path of the Unix socket tasks are submitted on.
    #[arg(short, long, env = "GRANVILLE_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    pub socket: PathBuf,

    /// Driver used to load every model.
    #[arg(short, long, default_value = "rules")]
    pub driver: String,

    /// Maximum number of accepted tasks waiting for a model. Unbounded if unset.
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Timeout for a single callback delivery attempt, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub callback_timeout_ms: u64,

    /// Extra delivery attempts after the first one fails.
    #[arg(long, default_value_t = 2)]
    pub callback_retries: u32,

    /// How long a client may take to send its request, in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    pub read_timeout_ms: u64,

    /// Largest accepted request, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    pub max_message_bytes: usize,
}

impl ServeArgs {
    pub fn validate(&self) -> Result<ServeConfig, anyhow::Error> {
        if self.models.is_empty() {
            bail!("at least one model path is required");
        }
        if self.queue_capacity == Some(0) {
            return Err(anyhow!("queue capacity must be at least 1"));
        }
        if self.callback_timeout_ms == 0 || self.read_timeout_ms == 0 {
            bail!("timeouts must be greater than zero");
        }
        if self.callback_retries > MAX_CALLBACK_RETRIES {
            bail!("callback retries must be at most {MAX_CALLBACK_RETRIES}");
        }

        Ok(ServeConfig::builder()
            .socket_path(self.socket.clone())
            .maybe_queue_capacity(self.queue_capacity)
            .callback_timeout(Duration::from_millis(self.callback_timeout_ms))
            .callback_retries(self.callback_retries)
            .read_timeout(Duration::from_millis(self.read_timeout_ms))
            .max_message_bytes(self.max_message_bytes)
            .build())
    }
}
