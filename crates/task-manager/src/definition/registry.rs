//! Task definition registry
//!
//! Definitions are collected into a [`TaskDefinitionRegistry`] during setup
//! and frozen into an immutable [`TaskTypeDictionary`] when the node starts.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::runner::{FnRunner, RunContext, RunResult, TaskRunError, TaskRunner};
use crate::reliability::RetryPolicy;

/// Default run timeout of a task type
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// What happens to a task instance once it ran out of attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedPolicy {
    /// Keep the document with status `failed`
    #[default]
    MarkFailed,
    /// Delete the document
    Remove,
}

/// Static description of a task type
#[derive(Clone)]
pub struct TaskDefinition {
    pub task_type: String,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Run deadline, also how long a claim is held before it can be recovered
    pub timeout: Duration,
    /// Per-node cap on concurrent runs of this type
    pub max_concurrency: Option<usize>,
    /// Falls back to the node's `max_attempts` when unset
    pub max_attempts: Option<u32>,
    pub retry_policy: RetryPolicy,
    pub on_exhausted: ExhaustedPolicy,
    pub runner: Arc<dyn TaskRunner>,
}

impl TaskDefinition {
    /// Definition backed by an async closure
    ///
    /// # Example
    ///
    /// ```
    /// use everruns_task_manager::{RunContext, RunResult, TaskDefinition};
    /// use std::time::Duration;
    ///
    /// let definition = TaskDefinition::new("cleanup", |_ctx: RunContext| async {
    ///     Ok(RunResult::done())
    /// })
    /// .with_timeout(Duration::from_secs(30))
    /// .with_max_concurrency(1);
    /// ```
    pub fn new<F, Fut>(task_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RunResult, TaskRunError>> + Send + 'static,
    {
        Self::with_runner(task_type, FnRunner::new(f))
    }

    pub fn with_runner(task_type: impl Into<String>, runner: impl TaskRunner) -> Self {
        Self {
            task_type: task_type.into(),
            title: None,
            description: None,
            timeout: DEFAULT_TASK_TIMEOUT,
            max_concurrency: None,
            max_attempts: None,
            retry_policy: RetryPolicy::default(),
            on_exhausted: ExhaustedPolicy::default(),
            runner: Arc::new(runner),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_on_exhausted(mut self, on_exhausted: ExhaustedPolicy) -> Self {
        self.on_exhausted = on_exhausted;
        self
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidTaskType {
            task_type: self.task_type.clone(),
            reason: reason.to_string(),
        };

        if self.task_type.is_empty() {
            return Err(invalid("task type must not be empty"));
        }
        if self.task_type.chars().any(char::is_whitespace) {
            return Err(invalid("task type must not contain whitespace"));
        }
        if self.timeout.is_zero() {
            return Err(invalid("timeout must be greater than zero"));
        }
        if self.max_concurrency == Some(0) {
            return Err(invalid("max_concurrency must be at least 1"));
        }
        if self.max_attempts == Some(0) {
            return Err(invalid("max_attempts must be at least 1"));
        }
        Ok(())
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("task_type", &self.task_type)
            .field("title", &self.title)
            .field("timeout", &self.timeout)
            .field("max_concurrency", &self.max_concurrency)
            .field("max_attempts", &self.max_attempts)
            .field("on_exhausted", &self.on_exhausted)
            .finish_non_exhaustive()
    }
}

/// Mutable collection of definitions, used during setup
#[derive(Debug, Default)]
pub struct TaskDefinitionRegistry {
    definitions: BTreeMap<String, TaskDefinition>,
}

impl TaskDefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition; a type can only be registered once
    pub fn register(&mut self, definition: TaskDefinition) -> Result<(), RegistryError> {
        definition.validate()?;
        if self.definitions.contains_key(&definition.task_type) {
            return Err(RegistryError::DuplicateTaskType(definition.task_type));
        }
        self.definitions
            .insert(definition.task_type.clone(), definition);
        Ok(())
    }

    /// Register several definitions, stopping at the first error
    pub fn register_all(
        &mut self,
        definitions: impl IntoIterator<Item = TaskDefinition>,
    ) -> Result<(), RegistryError> {
        definitions
            .into_iter()
            .try_for_each(|definition| self.register(definition))
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.definitions.contains_key(task_type)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Freeze into the immutable dictionary shared by the running node
    pub fn freeze(self, default_max_attempts: u32) -> TaskTypeDictionary {
        TaskTypeDictionary {
            definitions: self
                .definitions
                .into_iter()
                .map(|(task_type, definition)| (task_type, Arc::new(definition)))
                .collect(),
            default_max_attempts: default_max_attempts.max(1),
        }
    }
}

/// Immutable lookup of registered task types
#[derive(Debug, Clone)]
pub struct TaskTypeDictionary {
    definitions: HashMap<String, Arc<TaskDefinition>>,
    default_max_attempts: u32,
}

impl TaskTypeDictionary {
    pub fn get(&self, task_type: &str) -> Option<&Arc<TaskDefinition>> {
        self.definitions.get(task_type)
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.definitions.contains_key(task_type)
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.definitions.keys().cloned().collect();
        types.sort();
        types
    }

    /// Effective attempt limit of a definition
    pub fn max_attempts(&self, definition: &TaskDefinition) -> u32 {
        definition.max_attempts.unwrap_or(self.default_max_attempts)
    }

    /// Look up a definition, failing for unknown types
    pub fn ensure_registered(&self, task_type: &str) -> Result<&Arc<TaskDefinition>, RegistryError> {
        self.get(task_type)
            .ok_or_else(|| RegistryError::UnknownTaskType(task_type.to_string()))
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("task type {0:?} is already registered")]
    DuplicateTaskType(String),

    #[error("invalid task definition {task_type:?}: {reason}")]
    InvalidTaskType { task_type: String, reason: String },

    #[error("unknown task type: {0}")]
    UnknownTaskType(String),
}
