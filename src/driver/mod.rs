//! Driver abstraction over model backends
//!
//! A [`Driver`] knows how to load one family of models; each successful load yields a
//! [`ModelHandle`] that owns a single running model instance. The daemon only ever
//! talks to backends through these two traits, so several model families can share
//! one pool.
//!
//! Handle methods are blocking. The pool runs every handle on a dedicated thread,
//! so implementations are free to take seconds per call.

pub mod rules;

use crate::errors::{DaemonError, DriverError};
use crate::task::Priority;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub use rules::RulesDriver;

/// Output of a ranking pass: the urgency tier and the PII-free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ranking {
    pub priority: Priority,
    pub redacted: String,
}

/// A backend capable of loading model instances.
///
/// # Example
///
/// ```ignore
/// use granville::driver::{Driver, ModelHandle, Ranking};
///
/// #[derive(Debug)]
/// struct LlamaDriver;
///
/// impl Driver for LlamaDriver {
///     fn name(&self) -> &str {
///         "llama"
///     }
///
///     fn load(&self, path: &Path) -> Result<Box<dyn ModelHandle>, DriverError> {
///         let model = llama::Model::open(path).map_err(|e| DriverError::Load {
///             path: path.to_path_buf(),
///             reason: e.to_string(),
///         })?;
///         Ok(Box::new(LlamaHandle { model }))
///     }
/// }
/// ```
pub trait Driver: Send + Sync + fmt::Debug {
    /// Name used to select the driver on the command line.
    fn name(&self) -> &str;

    /// One-line description shown by `driver list`.
    fn description(&self) -> &str {
        ""
    }

    /// Load the model at `path` and return a handle to the running instance.
    fn load(&self, path: &Path) -> Result<Box<dyn ModelHandle>, DriverError>;
}

/// One loaded model instance.
///
/// Handles are moved onto their own worker thread and never shared, so methods take
/// `&mut self` and only `Send` is required.
pub trait ModelHandle: Send {
    /// Generate a tool-input JSON document for `text`.
    fn generate(&mut self, text: &str, max_tokens: Option<u32>) -> Result<String, DriverError>;

    /// Classify the urgency of `text` and return it with PII replaced by placeholders.
    fn rank_and_redact(&mut self, text: &str) -> Result<Ranking, DriverError>;

    /// Release backend resources. Called once, on the worker thread, at shutdown.
    fn unload(&mut self) {}
}

/// The set of drivers available to this process, keyed by name.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the drivers compiled into this binary.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RulesDriver));
        registry
    }

    /// Add a driver, replacing (and returning) any driver registered under the same name.
    pub fn register(&mut self, driver: Arc<dyn Driver>) -> Option<Arc<dyn Driver>> {
        self.drivers.insert(driver.name().to_string(), driver)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>, DaemonError> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| DaemonError::UnknownDriver {
                name: name.to_string(),
                available: self.names().join(", "),
            })
    }

    /// Driver names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Driver>> {
        self.drivers.values()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}

/// A driver whose handles refuse every call. Useful where a pool is needed but no
/// backend should ever run.
#[derive(Debug, Clone, Default)]
pub struct NoOpDriver;

struct NoOpHandle;

impl Driver for NoOpDriver {
    fn name(&self) -> &str {
        "noop"
    }

    fn load(&self, _path: &Path) -> Result<Box<dyn ModelHandle>, DriverError> {
        Ok(Box::new(NoOpHandle))
    }
}

impl ModelHandle for NoOpHandle {
    fn generate(&mut self, _text: &str, _max_tokens: Option<u32>) -> Result<String, DriverError> {
        Err(DriverError::Generate("noop driver cannot generate".to_string()))
    }

    fn rank_and_redact(&mut self, _text: &str) -> Result<Ranking, DriverError> {
        Err(DriverError::Rank("noop driver cannot rank".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_lists_rules_driver() {
        let registry = DriverRegistry::builtin();
        assert_eq!(registry.names(), vec!["rules"]);
        assert!(registry.get("rules").is_ok());
    }

    #[test]
    fn test_unknown_driver_lists_alternatives() {
        let mut registry = DriverRegistry::builtin();
        registry.register(Arc::new(NoOpDriver));

        let err = registry.get("llama").unwrap_err();
        assert_eq!(
            err.to_string(),
            "unknown driver 'llama' (available: noop, rules)"
        );
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = DriverRegistry::new();
        assert!(registry.register(Arc::new(NoOpDriver)).is_none());
        assert!(registry.register(Arc::new(NoOpDriver)).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_noop_handle_refuses_work() {
        let mut handle = NoOpDriver.load(Path::new("unused")).unwrap();
        assert!(matches!(
            handle.generate("hi", None),
            Err(DriverError::Generate(_))
        ));
        assert!(matches!(
            handle.rank_and_redact("hi"),
            Err(DriverError::Rank(_))
        ));
    }
}
