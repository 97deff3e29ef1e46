//! Talos - Template-Driven Network Probe Execution Engine
//!
//! Executes declarative probe templates (HTTP, DNS, TLS) against targets:
//! workflow trees condition child execution on parent matches, the HTTP
//! executor provides serial, parallel, pipelined, race, and fuzzing
//! modes, and structurally identical templates are clustered into a
//! single network operation with fan-out matching.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod input;
pub mod limiter;
pub mod oob;
pub mod operators;
pub mod template;

pub use config::EngineConfig;
pub use error::{ErrorClass, ErrorX, Result};
pub use input::MetaInput;
