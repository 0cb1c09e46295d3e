//! Overseer - supervises the chat worker process and streams its logs
//!
//! - `logs`: parse, buffer and tail the worker's log file
//! - `actors`: event bus and process supervisor (ractor)
//! - `viewer`: per-connection viewer sessions
//! - `api`: HTTP and WebSocket surface

pub mod actors;
pub mod api;
pub mod app_state;
pub mod config;
pub mod logs;
pub mod viewer;

pub use app_state::AppState;
pub use config::Config;
