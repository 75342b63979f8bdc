#![allow(unused_assignments)]

//! # appforge
//!
//! Script-driven installer and supervisor for AI applications on ephemeral
//! GPU hosts.
//!
//! ## Features
//!
//! - **Script Interpreter**: Executes JSON/YAML/object-literal install and start scripts
//!   step by step, with `when` guards and `{{ expression }}` templating
//! - **Per-Application Environments**: One isolated Python environment per application
//! - **Daemon Supervision**: Long-running servers in their own process group, with
//!   ready-pattern detection, restart policies and graceful stop
//! - **Health Monitoring**: Process liveness plus optional HTTP probes
//! - **Durable Registry**: A JSON registry reconciled against the filesystem at startup
//!
//! ## Quick Start
//!
//! ```no_run
//! use appforge::Engine;
//!
//! # async fn example() -> Result<(), appforge::Error> {
//! let engine = Engine::builder().root("/srv/appforge").build().await?;
//! engine
//!     .install("comfyui", "https://github.com/example/comfyui.pinokio.git")
//!     .await?;
//! let running = engine.run("comfyui").await?;
//! println!("{:?}", running);
//! engine.stop("comfyui").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! - One operation per application at a time; a second one fails with
//!   [`Error::OperationInProgress`]
//! - Different applications install and run fully in parallel
//! - Registry writes are serialized inside [`state::StateStore`]

pub mod command;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod environment;
pub mod error;
pub mod expr;
pub mod hash;
pub mod healthcheck;
pub mod host;
pub mod process;
pub mod script;
pub mod state;
pub mod sync;

// Re-export commonly used types
pub use config::{EngineConfig, RestartPolicy};
pub use coordinator::{Engine, EngineBuilder, RunningApp};
pub use error::{Error, Result};
pub use healthcheck::HealthStatus;
pub use host::HostFacts;
pub use script::{ProgressEvent, ProgressSink, ScriptDocument};
pub use state::{AppRecord, InstallState, RunState};
