#![recursion_limit = "1024"]
pub mod build;
pub mod cancel;
pub mod classify;
pub mod content;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod ids;
pub mod lifecycle;
pub mod logging;
pub mod queue;
pub mod semantic_index;
pub mod services;
pub mod settings;
pub mod transport;
pub mod workspace;
