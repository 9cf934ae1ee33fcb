//! Persistence layer for task documents

mod memory;
mod postgres;
mod store;
mod task_store;

pub use memory::InMemoryTaskDocumentStore;
pub use postgres::PostgresTaskDocumentStore;
pub use store::{
    matches_type_pattern, AggregationRequest, FetchResult, StoreError, TaskAggregation,
    TaskDocumentStore, TaskQuery, TaskSort,
};
pub use task_store::{
    BulkItemError, BulkResult, StoreErrorEvent, TaskStore, UpdateOptions,
};
