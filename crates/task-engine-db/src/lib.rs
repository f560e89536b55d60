//! PostgreSQL-backed task repository: row models, connection pooling, and
//! the query functions the engine uses to claim, observe, and transition
//! tasks.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
