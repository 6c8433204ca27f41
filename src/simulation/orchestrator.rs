//! Startup and step loop of a simulation run.
//!
//! Startup checks the cancellation flag at five checkpoints:
//! 1. before charges and force-field parameterization
//! 2. after parameterization
//! 3. after the engine system is configured
//! 4. after restraints, motors and emitters are built
//! 5. after the backend is selected and the reporter attached
//!
//! A cancelled startup deregisters the run without publishing anything. A
//! failed startup publishes an `err:<id>` message on the broadcast channel,
//! since the host already got its acknowledgement.

use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

use super::reporter::Reporter;
use super::system;
use super::{CancellationToken, SimulationRegistry, StartupError, SteppingError};
use crate::dispatcher::{error_chain, error_frames};
use crate::emitter::Emitter;
use crate::engine::{Backend, Context, ForceFieldList, ForceFieldProvider};
use crate::motor::Motor;
use crate::payload::{Header, SimulationParameters, StateRecord};
use crate::topology::{ChargeModel, Topology};
use crate::transport::Publisher;
use crate::virtual_objects::VirtualObjects;

/// Andersen collision frequency, 1/ps.
const THERMOSTAT_COLLISION_FREQUENCY: f64 = 1.0;
/// Integration step used while relaxing, ps.
const RELAX_STEP_SIZE_PS: f64 = 0.004;

/// Everything decoded from a Simulate request.
pub struct SimulationRequest {
    pub id: i64,
    pub parameters: SimulationParameters,
    pub force_fields: ForceFieldList,
    pub header: Header,
    pub topology: Topology,
    pub state: StateRecord,
    pub objects: VirtualObjects,
}

/// Everything decoded from a Relax request.
pub struct RelaxRequest {
    pub temperature: f64,
    pub force_fields: ForceFieldList,
    pub header: Header,
    pub topology: Topology,
    pub state: StateRecord,
    pub objects: VirtualObjects,
}

/// Chemistry and physics collaborators plus the settings they run with.
pub struct Collaborators {
    pub charges: Arc<dyn ChargeModel>,
    pub force_field: Arc<dyn ForceFieldProvider>,
    /// Priority order.
    pub backends: Vec<Arc<dyn Backend>>,
    /// kJ/mol/nm²
    pub lock_stiffness: f64,
    pub relax_max_iterations: u32,
    pub emitter_seed: Option<u64>,
}

pub enum StartupOutcome {
    Ready(Box<SimulationRun>),
    Aborted { stage: u8 },
    Failed(StartupError),
}

/// A started simulation, owned by its worker thread.
pub struct SimulationRun {
    id: i64,
    token: CancellationToken,
    context: Box<dyn Context>,
    motors: Vec<Motor>,
    emitters: Vec<Emitter>,
    reporter: Reporter,
    total_steps: u32,
    /// ns
    step_size: f64,
}

impl SimulationRun {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn context(&self) -> &dyn Context {
        self.context.as_ref()
    }

    /// Runs the step loop and removes the run from `registry` however it ends.
    pub fn run(mut self, registry: &SimulationRegistry) {
        match self.step_loop() {
            Ok(Some(step)) => log::info!("Aborted simulation on thread while running step #{step}"),
            Ok(None) => log::info!("Simulation {} finished after {} steps", self.id, self.total_steps),
            Err(err) => log::error!("Simulation {} failed: {}", self.id, error_chain(&err)),
        }
        registry.deregister(self.id, &self.token);
    }

    /// Returns the step at which cancellation was seen, if any.
    fn step_loop(&mut self) -> Result<Option<u32>, SteppingError> {
        for step in 0..self.total_steps {
            if self.token.is_cancelled() {
                return Ok(Some(step));
            }
            for emitter in &mut self.emitters {
                emitter.advance(self.context.as_mut(), self.step_size)?;
            }
            for motor in &mut self.motors {
                motor.advance(self.context.as_mut(), self.step_size)?;
            }
            self.context.step()?;
            if self.reporter.is_due(u64::from(step) + 1) {
                self.reporter.report(self.context.as_ref())?;
            }
        }
        Ok(None)
    }
}

/// Builds a run, stopping at the first checkpoint that sees cancellation.
pub fn start_up(request: SimulationRequest, token: CancellationToken, collaborators: &Collaborators, publisher: Arc<dyn Publisher>) -> StartupOutcome {
    match try_start_up(request, token, collaborators, publisher) {
        Ok(outcome) => outcome,
        Err(err) => StartupOutcome::Failed(err),
    }
}

fn try_start_up(
    request: SimulationRequest,
    token: CancellationToken,
    collaborators: &Collaborators,
    publisher: Arc<dyn Publisher>,
) -> Result<StartupOutcome, StartupError> {
    let checkpoint = |stage| token.is_cancelled().then_some(StartupOutcome::Aborted { stage });
    let SimulationRequest {
        id,
        parameters,
        force_fields,
        header,
        topology,
        state,
        objects,
    } = request;
    let temperature = parameters.temperature_in_kelvins;
    let step_size = parameters.time_step_in_nanoseconds();

    if let Some(aborted) = checkpoint(1) {
        return Ok(aborted);
    }
    let mut description = system::parameterize(&topology, collaborators.charges.as_ref(), collaborators.force_field.as_ref(), &force_fields)?;
    if let Some(aborted) = checkpoint(2) {
        return Ok(aborted);
    }

    system::configure(&mut description, &topology, &header, temperature, step_size * 1000.0);
    let mut positions = system::engine_positions(&topology, &state)?;
    if let Some(aborted) = checkpoint(3) {
        return Ok(aborted);
    }

    system::add_restraints(&mut description, &mut positions, &topology, &objects, collaborators.lock_stiffness)?;
    let motors = objects
        .motors
        .iter()
        .map(|document| Motor::from_document(document, &topology))
        .collect::<Result<Vec<_>, _>>()?;
    let mut emitters = objects
        .emitters
        .iter()
        .map(|document| Emitter::from_document(document, &topology, collaborators.emitter_seed))
        .collect::<Result<Vec<_>, _>>()?;
    if let Some(aborted) = checkpoint(4) {
        return Ok(aborted);
    }

    let mut context = system::select_backend(&collaborators.backends, &description, &positions)?;
    context.set_velocities_to_temperature(temperature)?;
    context.add_thermostat(temperature, THERMOSTAT_COLLISION_FREQUENCY);
    for emitter in &mut emitters {
        emitter.setup(context.as_mut(), step_size)?;
        if emitter.initial_delay() == 0.0 {
            for instance in 0..emitter.molecules_per_instance() {
                emitter.enable(context.as_mut(), instance)?;
            }
        }
    }
    let reporter = Reporter::new(id, parameters.steps_per_report, Arc::new(topology), publisher, token.clone());
    if let Some(aborted) = checkpoint(5) {
        return Ok(aborted);
    }

    Ok(StartupOutcome::Ready(Box::new(SimulationRun {
        id,
        token,
        context,
        motors,
        emitters,
        reporter,
        total_steps: parameters.total_step_count,
        step_size,
    })))
}

/// Owns the worker pool and starts runs on it.
pub struct Orchestrator {
    registry: Arc<SimulationRegistry>,
    publisher: Arc<dyn Publisher>,
    collaborators: Arc<Collaborators>,
    pool: ThreadPool,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<SimulationRegistry>,
        publisher: Arc<dyn Publisher>,
        collaborators: Collaborators,
        max_workers: usize,
    ) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(max_workers.max(1))
            .thread_name(|index| format!("simulation-{index}"))
            .build()?;
        Ok(Self {
            registry,
            publisher,
            collaborators: Arc::new(collaborators),
            pool,
        })
    }

    pub fn registry(&self) -> &Arc<SimulationRegistry> {
        &self.registry
    }

    /// Registers the request id. Fails when a live run already uses it.
    pub fn register(&self, id: i64) -> Result<CancellationToken, StartupError> {
        self.registry.register(id)
    }

    /// Runs startup and the step loop of a registered request on the pool.
    pub fn spawn(&self, request: SimulationRequest, token: CancellationToken) {
        let registry = Arc::clone(&self.registry);
        let publisher = Arc::clone(&self.publisher);
        let collaborators = Arc::clone(&self.collaborators);
        self.pool.spawn(move || {
            let id = request.id;
            let remap = request.topology.index_map().remap_buffer();
            match start_up(request, token.clone(), &collaborators, Arc::clone(&publisher)) {
                StartupOutcome::Ready(run) => run.run(&registry),
                StartupOutcome::Aborted { stage } => {
                    if registry.deregister(id, &token) {
                        log::info!("Aborted simulation while starting, step #{stage}");
                    }
                }
                StartupOutcome::Failed(err) => {
                    log::error!("Simulation {id} failed to start: {}", error_chain(&err));
                    let frames = error_frames(format!("err:{id}"), remap, &err);
                    if let Err(publish_err) = publisher.publish(frames) {
                        log::error!("Failed to publish start failure of simulation {id}: {publish_err}");
                    }
                    registry.deregister(id, &token);
                }
            }
        });
    }

    /// Minimizes the energy of the request and returns explicit atom
    /// positions in wire order.
    pub fn relax(&self, request: &RelaxRequest) -> Result<Vec<[f64; 3]>, StartupError> {
        let collaborators = &self.collaborators;
        let mut description = system::parameterize(
            &request.topology,
            collaborators.charges.as_ref(),
            collaborators.force_field.as_ref(),
            &request.force_fields,
        )?;
        system::configure(&mut description, &request.topology, &request.header, request.temperature, RELAX_STEP_SIZE_PS);
        let mut positions = system::engine_positions(&request.topology, &request.state)?;
        system::add_restraints(&mut description, &mut positions, &request.topology, &request.objects, collaborators.lock_stiffness)?;

        let mut context = system::select_backend(&collaborators.backends, &description, &positions)?;
        context.minimize(collaborators.relax_max_iterations)?;
        system::explicit_positions(&request.topology, &context.positions()).ok_or_else(|| {
            crate::engine::Error::LengthMismatch {
                expected: request.topology.explicit_atom_count(),
                actual: context.particle_count(),
            }
            .into()
        })
    }
}
