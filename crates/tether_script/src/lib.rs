//! Tether Script Engine Seam
//!
//! The bridge talks to a script engine only through the [`Engine`] trait:
//! opaque value handles, nested handle regions, counted persistent references
//! and a uniform host-callback entry point.
//!
//! ## Architecture
//!
//! - **engine:** the trait surface and raw handle types
//! - **quickjs:** [`QuickJsEngine`], the rquickjs-backed engine the `tether`
//!   binary runs on (feature `quickjs`, on by default)
//! - **heap:** `HeapEngine`, an in-process engine with a mark-sweep collector
//!   and deterministic failure injection for the bridge tests (feature `heap`)

pub mod engine;
#[cfg(any(test, feature = "heap"))]
pub mod heap;
#[cfg(feature = "quickjs")]
pub mod quickjs;

pub use engine::{
    CallbackHost, CallbackToken, Engine, EngineError, EngineFrame, EngineResult, EngineStatus,
    RawRef, RawScope, RawValue, SourceLocation, ValueKind,
};
#[cfg(any(test, feature = "heap"))]
pub use heap::HeapEngine;
#[cfg(feature = "quickjs")]
pub use quickjs::QuickJsEngine;
