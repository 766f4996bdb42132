//! Storage module for persistent data storage
//!
//! Provides SQLite-based persistence for the task queue.

mod database;

pub use database::{TaskDb, TaskStats};
