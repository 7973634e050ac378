//! Tether Core
//!
//! Lifetime and thread-safety layer between host code and a single-threaded
//! script engine:
//! - Dispatcher: per-environment work queue owned by the engine thread
//! - Scope: nested, thread-affine lifetime regions
//! - Value: scope-bound engine handles with validated access
//! - Reference: persistent strong/weak handles usable from any thread
//! - Fault: one error type for everything crossing the boundary

pub mod callback;
pub mod config;
pub mod dispatcher;
pub mod env;
pub mod fault;
pub mod reference;
pub mod scope;
pub mod value;

pub use callback::CallbackArgs;
pub use config::{ConfigError, EnvConfig};
pub use dispatcher::{Deferral, Dispatcher, DispatcherStats, ShutdownState, Work};
pub use env::{EnvId, Environment};
pub use fault::{EngineFault, Fault, FaultKind, TraceConvention, UsageFault};
pub use reference::Reference;
pub use scope::{Scope, ScopeGuard, ScopeId, ScopeKind};
pub use value::Value;

pub use tether_script;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
