//! Prepare/resolve pipeline and name resolver tying together dbcask's
//! registry, snapshot, connector, and runtime crates.
//!
//! [`Engine`] is the single entry point: [`Engine::prepare`] gets or builds
//! a content-addressed database state and materializes a fresh instance
//! from it; [`Engine::resolve`] turns a human-friendly name or an instance
//! ID into the instance it names.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod resolver;

pub type Result<T> = std::result::Result<T, Error>;

pub use config::Config;
pub use error::Error;
pub use pipeline::{Engine, PrepareOutcome, PrepareRequest, PrepareStep, PgbenchStep, PsqlStep};
pub use resolver::ResolveResult;
