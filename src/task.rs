//! Tasks, priorities and results.
//!
//! A [`Task`] is created by the listener once a request passes validation and lives
//! until its [`TaskResult`] has been handed to the callback dispatcher.
use crate::errors::AdmissionError;
use bon::Builder;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;
use uuid::Uuid;

/// Urgency tier of a task. Ordering follows dispatch precedence, so
/// `Priority::Critical > Priority::Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clients are inconsistent about case ("normal" vs "NORMAL"), so parsing ignores it.
impl FromStr for Priority {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AdmissionError::InvalidPriority(s.to_string()))
    }
}

/// Where a task's result is delivered.
///
/// Plain strings are Unix socket paths; `tcp://host:port` selects a TCP socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallbackAddr {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for CallbackAddr {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AdmissionError::MissingCallback);
        }
        match s.strip_prefix("tcp://") {
            Some("") => Err(AdmissionError::MissingCallback),
            Some(addr) => Ok(CallbackAddr::Tcp(addr.to_string())),
            None => Ok(CallbackAddr::Unix(PathBuf::from(s))),
        }
    }
}

impl fmt::Display for CallbackAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackAddr::Unix(path) => write!(f, "{}", path.display()),
            CallbackAddr::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// One caller-submitted unit of generation work.
///
/// The priority is write-once: after it has been resolved (explicitly, by default
/// or by ranking) [`Task::resolve_priority`] keeps the existing value.
#[derive(Debug, Clone, Builder)]
pub struct Task {
    pub id: Uuid,
    #[builder(into)]
    pub text: String,
    pub callback: CallbackAddr,
    #[builder(default)]
    pub ranked: bool,
    priority: Option<Priority>,
    pub max_tokens: Option<u32>,
    #[builder(default = SystemTime::now())]
    pub submitted_at: SystemTime,
    /// Arrival order, reserved when the task is admitted.
    #[builder(skip)]
    sequence: Option<u64>,
}

impl Task {
    pub fn priority(&self) -> Option<Priority> {
        self.priority
    }

    /// Whether the task must go through the ranking stage before it can be queued.
    pub fn needs_ranking(&self) -> bool {
        self.ranked && self.priority.is_none()
    }

    /// Sets the priority unless one is already present, returning the effective value.
    pub fn resolve_priority(&mut self, priority: Priority) -> Priority {
        *self.priority.get_or_insert(priority)
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = Some(sequence);
    }

    /// Priority for dispatch; unresolved tasks count as [`Priority::Normal`].
    pub fn effective_priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }
}

/// The outcome of one task, produced by exactly one model instance.
///
/// A failed generation (or ranking) still produces a result so the caller always
/// hears back; in that case `error` is set and `tool_input_json` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub id: Uuid,
    pub tool_input_json: String,
    pub priority: Priority,
    pub model_id: u32,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn success(task: &Task, model_id: u32, tool_input_json: String) -> Self {
        Self {
            id: task.id,
            tool_input_json,
            priority: task.effective_priority(),
            model_id,
            error: None,
        }
    }

    pub fn failure(task: &Task, model_id: u32, error: impl fmt::Display) -> Self {
        Self {
            id: task.id,
            tool_input_json: String::new(),
            priority: task.effective_priority(),
            model_id,
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
