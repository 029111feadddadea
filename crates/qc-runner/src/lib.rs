//! Procedure execution for tileboard QA/QC sessions.
//!
//! A [`Session`] owns the board identity, the ordered list of recorded
//! [`qc_core::ProcedureResult`]s and an optional hardware controller. Task
//! types declare their arguments and interfaces up front; the session binds,
//! validates and runs them, and persists every outcome to the manifest.

pub mod capability;
pub mod config;
pub mod contract;
pub mod interactive;
pub mod lock;
pub mod procedure;
pub mod procedures;
pub mod session;
pub mod validate;
pub mod wildcard;

pub use capability::{
    CancelFlag, Cancelled, Capabilities, CapabilityKind, ChannelProgress, Iterate, LogProgress,
    ProgressEvent, ProgressReporter, SESSION_ATTRIBUTES,
};
pub use config::RunnerConfig;
pub use contract::{
    bind_arguments, ArgDecl, ArgKind, BindError, BoundArguments, ContractError, InterfaceDecl,
    TaskRegistry, TaskType,
};
pub use interactive::InteractiveSession;
pub use lock::{RunLock, RunRejected};
pub use procedure::{InstanceState, Procedure, ProcedureContext, ProcedureInstance};
pub use procedures::builtin_registry;
pub use session::{session_dir, Session, SessionError};
pub use validate::{Choices, Range, ValidationContext, ValidationError, Validator};
