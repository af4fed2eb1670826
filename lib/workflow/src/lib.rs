//! Workflow engine for haulflow.
//!
//! This crate provides the workflow runtime, including:
//!
//! - **Definitions**: JSON documents parsed into a validated step graph
//! - **Expressions**: a small total language for conditions and `{{ }}` templates
//! - **Actions**: a registry of named handlers with config schemas
//! - **Runtime**: workers that claim instances and advance them step by step
//! - **Signals**: event, approval and delay waits, resolved through a durable inbox
//! - **State**: the `StateStore` contract and an in-memory implementation

pub mod actions;
pub mod broker;
pub mod catalog;
pub mod config;
pub mod context;
pub mod cursor;
pub mod definition;
pub mod engine;
pub mod error;
pub mod expression;
pub mod graph;
pub mod handler;
pub mod instance;
pub mod parser;
pub mod record;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod step;
pub mod store;
pub mod timer;
pub mod wait;
pub mod worker;

pub use actions::register_builtins;
pub use broker::{SignalBroker, SignalEnvelope, SignalKind, SignalOutcome};
pub use catalog::{DefinitionCatalog, DefinitionSource};
pub use config::RuntimeConfig;
pub use context::ExecutionContext;
pub use definition::{DefinitionDocument, TriggerSpec, WorkflowDefinition};
pub use engine::Engine;
pub use error::{DefinitionError, EngineError, RegistryError, StoreError};
pub use expression::{Env, EvalError, Expression};
pub use handler::{ActionHandler, HandlerError, HandlerErrorKind};
pub use instance::{InstanceStatus, StartRequest, WorkflowInstance};
pub use parser::parse_definition;
pub use record::{StepOutcome, StepRecord};
pub use registry::{ActionRegistry, ConfigSchema, FieldType};
pub use retry::{RetryPolicy, RetrySpec};
pub use runtime::Runtime;
pub use step::{JoinMode, StepId, StepSpec};
pub use store::{Created, InstanceSnapshot, MemoryStateStore, StateStore, StepCommit};
pub use timer::TimerLoop;
pub use wait::{PendingWait, Signal, WaitKind, WaitMatch, WaitResolution};
pub use worker::Worker;
