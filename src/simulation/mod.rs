//! Simulation lifecycle.
//!
//! A start request is decoded by the dispatcher, registered, acknowledged and
//! then handed to a pool thread. That thread builds the engine system with
//! cancellation checkpoints between the expensive stages, then runs the step
//! loop: emitters, motors, one integration step, and a report on cadence.
//!
//! ## Module Organization
//!
//! - `registry`: id → cancellation flag map shared with the dispatcher
//! - `system`: engine system assembly shared by Simulate and Relax
//! - `reporter`: position broadcasts and NaN detection
//! - `orchestrator`: startup checkpoints, backend selection and the step loop

pub mod orchestrator;
pub mod registry;
pub mod reporter;
pub mod system;

use thiserror::Error;

use crate::{emitter, engine, motor, topology, transport};

pub use orchestrator::{Collaborators, Orchestrator, RelaxRequest, SimulationRequest, SimulationRun, StartupOutcome};
pub use registry::{CancellationToken, SimulationRegistry};
pub use reporter::Reporter;

/// Failure while preparing a simulation or a relaxation.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("simulation {0} is already running")]
    AlreadyRunning(i64),

    #[error(transparent)]
    Topology(#[from] topology::Error),

    #[error(transparent)]
    Engine(#[from] engine::Error),

    #[error("invalid motor: {0}")]
    Motor(#[from] motor::Error),

    #[error(transparent)]
    Emitter(#[from] emitter::Error),

    #[error("spring of anchor {anchor} targets unknown atom {atom}")]
    UnknownSpringTarget { anchor: i64, atom: u32 },

    #[error("no backend produced finite positions (tried: {0})")]
    NoUsableBackend(String),
}

/// Failure inside the step loop.
#[derive(Debug, Error)]
pub enum SteppingError {
    #[error("engine step failed: {0}")]
    Engine(#[from] engine::Error),

    #[error("emitter failed: {0}")]
    Emitter(#[from] emitter::Error),

    #[error("publishing a report failed: {0}")]
    Publish(#[from] transport::Error),
}
