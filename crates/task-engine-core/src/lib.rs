//! Core scheduling engine: the lease-based task state machine, the
//! worker pool, and the transactional resource lock manager.
//!
//! `TaskEngine` (see [`engine`]) is the entry point most callers want;
//! the other modules are its collaborators and are also usable on their
//! own (a caller that only needs `AdapterLock`, say, can depend on this
//! crate without ever constructing an engine).

pub mod adapter;
pub mod backoff;
pub mod bus;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod handler;
pub mod lock;
pub mod pool;
pub mod repository;
pub mod state;

pub use adapter::{Adapter, PostgresAdapter};
pub use bus::{BroadcastEventBus, BusEvent, EventBus, EventKind};
pub use config::{EngineConfig, EngineConfigFile, EngineConfigOverrides, WorkerPoolConfig};
pub use context::{LogLevel, LoggingBufferConfig, TaskContext, TaskLogger};
pub use engine::TaskEngine;
pub use error::EngineError;
pub use handler::{Handler, HandlerOutcome, HandlerRegistry, RequestedStatus as HandlerRequestedStatus, StateChangeRequest};
pub use lock::{AdapterLock, LockHooks, Transaction};
pub use pool::{PoolJobOutcome, WorkerPool};
pub use repository::{InMemoryTaskRepository, PgTaskRepository, TaskRepository};
pub use state::TaskStateMachine;
