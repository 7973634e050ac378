//! Faults crossing the host/engine boundary
//!
//! Every recoverable failure in the bridge is a [`Fault`]. Engine failures are
//! wrapped in an [`EngineFault`] that keeps both stacks captured at the fault
//! site: the native backtrace and the engine's own call stack. A host fault
//! thrown into the engine by a callback rides along as the `cause` of the
//! engine error and comes back out as one more layer of the merged trace.
//!
//! Fatal conditions are not values; see [`fail_fast`].

mod fatal;
mod trace;

pub use fatal::{fail_fast, set_fatal_hook, FatalReport, FaultHandling};
pub use trace::{
    elide_plumbing, is_plumbing, parse_engine_trace, parse_native_backtrace, render_frames,
    translate_trace, FrameOrigin, TraceConvention, TraceFrame,
};

use crate::env::EnvId;
use crate::scope::{ScopeId, ScopeKind};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;
use tether_script::{EngineError, EngineFrame, EngineStatus};
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FaultKind {
    ScopeClosed,
    WrongThread,
    Engine,
    Usage,
}

/// A recoverable failure surfaced at the violated call site.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("{operation}: {kind} scope {scope} is closed")]
    ScopeClosed {
        operation: &'static str,
        scope: ScopeId,
        kind: ScopeKind,
    },

    #[error("{operation}: owned by thread {owner:?} but called from thread {current:?}")]
    WrongThread {
        operation: &'static str,
        owner: ThreadId,
        current: ThreadId,
    },

    #[error(transparent)]
    Engine(Box<EngineFault>),

    #[error(transparent)]
    Usage(#[from] UsageFault),
}

/// Violations of the bridge's own invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageFault {
    #[error("scope {scope} is already closed")]
    ScopeAlreadyClosed { scope: ScopeId },

    #[error("scope {scope} is not the innermost scope on this thread (innermost: {innermost:?})")]
    NotInnermost {
        scope: ScopeId,
        innermost: Option<ScopeId>,
    },

    #[error("cannot open a {kind} scope: {reason}")]
    IllegalNesting {
        kind: ScopeKind,
        reason: &'static str,
    },

    #[error("environment {env} already opened its root scope")]
    RootAlreadyOpened { env: EnvId },

    #[error("{kind} scope {scope} does not support escape")]
    NotEscapable { scope: ScopeId, kind: ScopeKind },

    #[error("scope {scope} already escaped a value")]
    AlreadyEscaped { scope: ScopeId },

    #[error("value does not belong to scope {scope}")]
    ForeignValue { scope: ScopeId },

    #[error("{operation}: values belong to different environments")]
    ForeignEnvironment { operation: &'static str },

    #[error("reference {reference} was already disposed")]
    DoubleDispose { reference: u64 },

    #[error("{operation}: reference {reference} is disposed")]
    ReferenceDisposed {
        operation: &'static str,
        reference: u64,
    },

    #[error("{operation}: dispatcher has shut down")]
    DispatcherClosed { operation: &'static str },

    #[error("{operation}: blocking on the dispatcher from its own thread would deadlock")]
    WouldDeadlock { operation: &'static str },

    #[error("{operation}: no scope is open on this thread")]
    NoCurrentScope { operation: &'static str },

    #[error("{operation}: scope {scope} has no environment")]
    NoEnvironment {
        operation: &'static str,
        scope: ScopeId,
    },

    #[error("{operation}: environment {env} is not attached to this thread")]
    UnknownEnvironment {
        operation: &'static str,
        env: EnvId,
    },

    #[error("no host callback registered for token {token}")]
    UnknownCallback { token: u64 },

    #[error("environment failed to start: {reason}")]
    EnvironmentStartup { reason: String },
}

/// An engine-reported failure with the diagnostics of both runtimes.
#[derive(Debug)]
pub struct EngineFault {
    pub operation: &'static str,
    pub status: EngineStatus,
    pub message: String,
    pub engine_stack: Vec<EngineFrame>,
    pub native_stack: Backtrace,
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for EngineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: engine fault {}: {}",
            self.operation, self.status, self.message
        )
    }
}

impl std::error::Error for EngineFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl Fault {
    /// Wrap an engine failure raised by `operation`.
    pub fn engine(operation: &'static str, err: EngineError) -> Self {
        FaultHandling::check_raise(operation);
        let native_stack = Backtrace::capture();
        Fault::Engine(Box::new(EngineFault {
            operation,
            status: err.status,
            message: err.message,
            engine_stack: err.stack,
            native_stack,
            cause: err.cause,
        }))
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            Fault::ScopeClosed { .. } => FaultKind::ScopeClosed,
            Fault::WrongThread { .. } => FaultKind::WrongThread,
            Fault::Engine(_) => FaultKind::Engine,
            Fault::Usage(_) => FaultKind::Usage,
        }
    }

    pub fn is_scope_closed(&self) -> bool {
        self.kind() == FaultKind::ScopeClosed
    }

    pub fn is_wrong_thread(&self) -> bool {
        self.kind() == FaultKind::WrongThread
    }

    pub fn as_engine(&self) -> Option<&EngineFault> {
        match self {
            Fault::Engine(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn as_usage(&self) -> Option<&UsageFault> {
        match self {
            Fault::Usage(inner) => Some(inner),
            _ => None,
        }
    }

    /// Convert into an engine exception so it can be thrown across the
    /// boundary. The fault itself travels as the exception's cause.
    pub fn into_engine_error(self) -> EngineError {
        let _handling = FaultHandling::enter("throw into engine");
        let status = match &self {
            Fault::Engine(inner) => inner.status,
            _ => EngineStatus::PendingException,
        };
        EngineError::new(status, self.to_string()).with_cause(Arc::new(self))
    }

    /// One interleaved trace of every layer, innermost first.
    pub fn merged_trace(&self, convention: TraceConvention) -> String {
        match self {
            Fault::Engine(inner) => inner.merged_trace(convention),
            other => format!("{other}\n"),
        }
    }
}

impl EngineFault {
    /// This fault and every engine fault nested in its cause chain,
    /// innermost first.
    fn layers(&self) -> Vec<&EngineFault> {
        let mut layers = vec![self];
        let mut cause = self.cause.as_deref();
        while let Some(err) = cause {
            let next = match err.downcast_ref::<Fault>() {
                Some(Fault::Engine(inner)) => Some(inner.as_ref()),
                _ => err.downcast_ref::<EngineFault>(),
            };
            match next {
                Some(inner) => {
                    layers.push(inner);
                    cause = inner.cause.as_deref();
                }
                None => break,
            }
        }
        layers.reverse();
        layers
    }

    /// Host error (not an engine fault) at the bottom of the chain, if any.
    fn root_host_cause(&self) -> Option<String> {
        let innermost = *self.layers().first()?;
        innermost.cause.as_ref().map(|cause| cause.to_string())
    }

    pub fn native_frames(&self) -> Vec<TraceFrame> {
        if self.native_stack.status() == BacktraceStatus::Captured {
            parse_native_backtrace(&self.native_stack.to_string())
        } else {
            Vec::new()
        }
    }

    pub fn merged_trace(&self, convention: TraceConvention) -> String {
        let layers = self.layers();
        let frames = elide_plumbing(
            layers
                .iter()
                .map(|layer| {
                    layer
                        .engine_stack
                        .iter()
                        .map(TraceFrame::from)
                        .chain(layer.native_frames())
                        .collect()
                })
                .collect(),
        );

        let mut out = format!("{}: {}\n", self.status, self.message);
        if let Some(cause) = self.root_host_cause() {
            out.push_str(&format!("caused by: {cause}\n"));
        }
        for (index, layer) in frames.iter().enumerate() {
            if index > 0 {
                out.push_str("    --- host/engine boundary ---\n");
            }
            out.push_str(&render_frames(layer, convention));
        }
        out
    }
}
