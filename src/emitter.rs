//! Particle emitters.
//!
//! Every templated instance of an emitter is parked at setup: its particles
//! lose their mass and nonbonded interaction and are moved out of the way.
//! Instances are brought back one by one, in index order, as their spawn
//! time passes. A re-enabled particle gets back its cached mass, parameters
//! and position, plus half its cached velocity and a push along a random
//! direction inside the emission cone.

use std::collections::HashMap;
use std::f64::consts::PI;

use glam::DVec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use thiserror::Error;

use crate::engine::{self, Context, NonbondedParameters};
use crate::topology::Topology;
use crate::virtual_objects::EmitterDocument;

/// Share of the cached velocity kept by a re-enabled particle.
const TEMPERATURE_CONSERVATION_FACTOR: f64 = 0.5;

#[derive(Debug, Error)]
pub enum Error {
    #[error("emitter {0} has a zero axis direction")]
    ZeroAxis(i64),

    #[error("emitter {0} needs at least one molecule per instance")]
    NoMoleculesPerInstance(i64),

    #[error("emitter {emitter} references unknown atom {atom}")]
    UnknownAtom { emitter: i64, atom: u32 },

    #[error(transparent)]
    Engine(#[from] engine::Error),
}

/// State of a particle before it was parked.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ParkedParticle {
    mass: f64,
    nonbonded: NonbondedParameters,
    position: DVec3,
    velocity: DVec3,
}

/// Uniformly random direction at most `half_angle` radians away from `axis`.
///
/// The tilt angle is drawn uniformly, so directions bunch toward the axis.
/// `axis` must be unit length; a zero half-angle returns it unchanged.
pub fn random_direction_in_cone<R: Rng>(axis: DVec3, half_angle: f64, rng: &mut R) -> DVec3 {
    if half_angle == 0.0 {
        return axis;
    }
    let random = DVec3::new(rng.sample(StandardNormal), rng.sample(StandardNormal), rng.sample(StandardNormal));
    let perpendicular = axis.cross(random).try_normalize().unwrap_or_else(|| axis.any_orthonormal_vector());
    let angle = rng.gen_range(0.0..=half_angle.abs().min(PI));
    let (sin, cos) = angle.sin_cos();
    axis * cos + perpendicular.cross(axis) * sin + perpendicular * perpendicular.dot(axis) * (1.0 - cos)
}

pub struct Emitter {
    id: i64,
    axis: DVec3,
    initial_delay: f64,
    interval: f64,
    /// nm/ps
    speed: f64,
    spread_angle: f64,
    molecules_per_instance: usize,
    /// Engine indices per instance.
    instances: Vec<Vec<usize>>,
    parked: HashMap<usize, ParkedParticle>,
    enabled: Vec<bool>,
    high_water: Option<usize>,
    /// ns
    clock: f64,
    rng: StdRng,
}

impl Emitter {
    pub fn from_document(document: &EmitterDocument, topology: &Topology, seed: Option<u64>) -> Result<Self, Error> {
        let parameters = &document.parameters;
        let axis = DVec3::from_array(document.axis_direction)
            .try_normalize()
            .ok_or(Error::ZeroAxis(document.emitter_id))?;
        if parameters.molecules_per_instance == 0 {
            return Err(Error::NoMoleculesPerInstance(document.emitter_id));
        }

        let map = topology.index_map();
        let instances = document
            .atoms_list
            .iter()
            .map(|atoms| {
                atoms
                    .iter()
                    .map(|&atom| {
                        map.engine(atom).ok_or(Error::UnknownAtom {
                            emitter: document.emitter_id,
                            atom,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut total = parameters.total_instance_count as usize;
        if total > instances.len() {
            log::warn!(
                "Emitter {} declares {total} instances but lists {}; emitting only those",
                document.emitter_id,
                instances.len()
            );
            total = instances.len();
        }

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ document.emitter_id as u64),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            id: document.emitter_id,
            axis,
            initial_delay: parameters.initial_delay_in_nanoseconds,
            interval: parameters.instance_rate_time_in_nanoseconds,
            speed: parameters.instance_speed_nanometers_per_picosecond,
            spread_angle: parameters.spread_angle,
            molecules_per_instance: parameters.molecules_per_instance as usize,
            instances,
            parked: HashMap::new(),
            enabled: vec![false; total],
            high_water: None,
            clock: 0.0,
            rng,
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn initial_delay(&self) -> f64 {
        self.initial_delay
    }

    pub fn molecules_per_instance(&self) -> usize {
        self.molecules_per_instance
    }

    pub fn instance_count(&self) -> usize {
        self.enabled.len()
    }

    /// Highest instance index enabled so far.
    pub fn high_water(&self) -> Option<usize> {
        self.high_water
    }

    pub fn is_enabled(&self, instance: usize) -> bool {
        self.enabled.get(instance).copied().unwrap_or(false)
    }

    /// Spawn time of `instance`, ns since the start of the run.
    pub fn spawn_time(&self, instance: usize) -> f64 {
        self.initial_delay + (instance / self.molecules_per_instance) as f64 * self.interval
    }

    /// Parks every templated particle. The emitter clock starts one step ahead.
    ///
    /// NaN velocities anywhere in the context are zeroed as well.
    pub fn setup(&mut self, context: &mut dyn Context, dt: f64) -> Result<(), Error> {
        self.clock += dt;
        let mut positions = context.positions();
        let mut velocities = context.velocities();
        for velocity in velocities.iter_mut().filter(|velocity| velocity.is_nan()) {
            *velocity = DVec3::ZERO;
        }

        for &particle in self.instances.iter().flatten() {
            let cached = ParkedParticle {
                mass: context.mass(particle)?,
                nonbonded: context.nonbonded(particle)?,
                position: positions[particle],
                velocity: velocities[particle],
            };
            self.parked.insert(particle, cached);
            context.set_mass(particle, 0.0)?;
            context.set_nonbonded(particle, NonbondedParameters::NONE)?;
            positions[particle] = DVec3::new(0.0, 0.0, particle as f64);
            velocities[particle] = DVec3::ZERO;
        }
        context.set_positions(&positions)?;
        context.set_velocities(&velocities)?;
        log::debug!("Emitter {} parked {} particles", self.id, self.parked.len());
        Ok(())
    }

    /// Moves the clock by `dt` ns and enables every instance now due.
    pub fn advance(&mut self, context: &mut dyn Context, dt: f64) -> Result<(), Error> {
        self.clock += dt;
        let first = self.high_water.map_or(0, |index| index + 1);
        for instance in first..self.enabled.len() {
            if self.spawn_time(instance) > self.clock {
                break;
            }
            self.enable(context, instance)?;
        }
        Ok(())
    }

    /// Restores one instance. Returns `false` when it was already enabled.
    pub fn enable(&mut self, context: &mut dyn Context, instance: usize) -> Result<bool, Error> {
        if instance >= self.enabled.len() || self.enabled[instance] {
            return Ok(false);
        }
        let mut positions = context.positions();
        let mut velocities = context.velocities();
        let push = random_direction_in_cone(self.axis, self.spread_angle, &mut self.rng) * self.speed;
        for &particle in &self.instances[instance] {
            let Some(cached) = self.parked.get(&particle) else {
                continue;
            };
            context.set_mass(particle, cached.mass)?;
            context.set_nonbonded(particle, cached.nonbonded)?;
            positions[particle] = cached.position;
            velocities[particle] = cached.velocity * TEMPERATURE_CONSERVATION_FACTOR + push;
        }
        self.enabled[instance] = true;
        self.high_water = Some(self.high_water.map_or(instance, |index| index.max(instance)));
        context.set_velocities(&velocities)?;
        context.set_positions(&positions)?;
        Ok(true)
    }
}
