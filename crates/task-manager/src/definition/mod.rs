//! Task types: definitions, runners and the registry

mod registry;
mod runner;

pub use registry::{
    ExhaustedPolicy, RegistryError, TaskDefinition, TaskDefinitionRegistry, TaskTypeDictionary,
    DEFAULT_TASK_TIMEOUT,
};
pub use runner::{FnRunner, RunContext, RunResult, TaskRunError, TaskRunFailure, TaskRunner};
