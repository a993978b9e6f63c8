//! shimlet: process bridge between a function host runtime and a long-lived
//! worker subprocess speaking newline-delimited JSON over stdio.

pub mod bridge;
pub mod config;
pub mod handler;
pub mod invocation;
pub mod logging;
pub mod pending;
pub mod service;
pub mod supervisor;
pub mod worker;

pub use config::{BridgeConfig, ConfigError, CorrelationMode, FatalPolicy, WorkerCommand};
pub use handler::HostAdapter;
pub use invocation::{Completion, Invocation, InvocationError, InvocationResult};
pub use service::RequestResponseBridge;
pub use supervisor::{
    CommandSpawner, FatalReason, SpawnError, WorkerExit, WorkerSpawner, WorkerSupervisor,
};
pub use worker::{Handler, HandlerError, WorkerConfig, handler_fn, run_worker};
