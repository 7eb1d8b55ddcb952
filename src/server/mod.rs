//! Server module for Huddle
//!
//! # Module Structure
//!
//! - `config`: Configuration structures for the server
//! - `loader`: Configuration loading from files and environment
//! - `validation`: Startup configuration checks
//! - `health`: Health endpoint
//! - `background_tasks`: Idle session sweeper and persistence retry
//! - `init`: Server initialization and run loop

mod background_tasks;
pub mod config;
mod health;
mod init;
mod loader;
mod validation;

// Re-export public API
pub use init::run;
pub use loader::load_config;
