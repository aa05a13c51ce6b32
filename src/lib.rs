//! `reqflow`: a durable, distributed HTTP request queue.
//!
//! Embedders construct an [`Engine`] via [`EngineBuilder`], `enqueue` work,
//! and subscribe to [`events::EngineEvent`] for lifecycle notifications. The
//! CLI/HTTP/RPC surface an app puts in front of this, and the monitoring
//! dashboard that visualizes it, are deliberately out of scope here — this
//! crate is the scheduling and dispatch core only.

pub mod backpressure;
pub mod circuit_breaker;
pub mod config;
pub mod durable;
pub mod engine;
pub mod error;
pub mod events;
pub mod http_executor;
pub mod index;
pub mod model;
pub mod rate_limiter;
pub mod retry;
pub mod worker;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult};
pub use events::EngineEvent;
pub use model::{Method, Request, RequestInput, RequestState, RequestStatus, Stats};
