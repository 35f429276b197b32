// src/lib.rs
pub mod conn;
pub mod error;
pub mod queue;
pub mod server;
pub mod syscalls;

mod listener;
mod table;

// Re-exports for users
pub use conn::Connection;
pub use error::{NocturneError, NocturneResult};
pub use queue::WorkQueue;
pub use server::Server;
