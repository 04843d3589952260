//! Luthien: an interposing HTTP gateway between LLM clients and upstream
//! providers. See `SPEC_FULL.md` for the full design.

pub mod admin;
pub mod config;
pub mod convert;
pub mod credentials;
pub mod error;
pub mod http;
pub mod judge;
pub mod observability;
pub mod pipeline;
pub mod policy;
pub mod sanitize;
pub mod stream;
pub mod telemetry;
pub mod transaction;
pub mod types;
pub mod upstream;

pub use config::Config;
pub use error::GatewayError;
