//! Physics-engine collaborator contract.
//!
//! A [`SystemDescription`] lists particles, harmonic terms and integrator
//! settings. A [`Backend`] binds a description to an execution context that
//! owns positions and velocities and advances one integration step at a time.
//!
//! Units: nm, ps, g/mol, kJ/mol. Velocities crossing this contract are nm/ps.
//!
//! ## Module Organization
//!
//! - `forcefield`: force-field list parsing and the parameterization collaborator
//! - `reference`: deterministic CPU velocity-Verlet backend

pub mod forcefield;
pub mod reference;

use std::sync::Arc;

use glam::DVec3;
use thiserror::Error;

pub use forcefield::{ElementForceField, ForceFieldList, ForceFieldProvider};
pub use reference::ReferenceBackend;

/// Boltzmann constant in kJ/mol/K.
pub const BOLTZMANN: f64 = 0.008_314_462_618;

#[derive(Debug, Error)]
pub enum Error {
    #[error("backend '{backend}' is not available: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("particle {index} is out of range ({count} particles)")]
    ParticleOutOfRange { index: usize, count: usize },

    #[error("expected {expected} values, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("particle {particle} has a non-finite coordinate after step {step}")]
    NonFinitePosition { particle: usize, step: u64 },

    #[error("invalid system: {0}")]
    InvalidSystem(String),

    #[error("force field error: {0}")]
    ForceField(String),
}

impl Error {
    pub fn invalid_system(details: impl Into<String>) -> Self {
        Self::InvalidSystem(details.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NonbondedParameters {
    pub charge: f64,
    pub sigma: f64,
    pub epsilon: f64,
}

impl NonbondedParameters {
    /// No charge and no dispersion.
    pub const NONE: Self = Self {
        charge: 0.0,
        sigma: 0.0,
        epsilon: 0.0,
    };

    /// Parameters given to massless helper particles (anchors, lock points).
    pub const INERT: Self = Self {
        charge: 0.0,
        sigma: 1.0,
        epsilon: 0.0,
    };
}

/// `E = k/2 · (r − length)²` between two particles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HarmonicBond {
    pub particle1: usize,
    pub particle2: usize,
    pub length: f64,
    pub k: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Integrator {
    Verlet,
    /// Friction in 1/ps.
    Langevin { temperature: f64, friction: f64 },
}

impl Integrator {
    /// `langevin` selects Langevin dynamics with 1/ps friction, anything else Verlet.
    pub fn from_name(name: &str, temperature: f64) -> Self {
        if name == "langevin" {
            Integrator::Langevin {
                temperature,
                friction: 1.0,
            }
        } else {
            Integrator::Verlet
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemDescription {
    pub masses: Vec<f64>,
    pub nonbonded: Vec<NonbondedParameters>,
    pub bonds: Vec<HarmonicBond>,
    /// Pairs excluded from nonbonded interaction.
    pub exceptions: Vec<(usize, usize)>,
    pub periodic_box: Option<[f64; 3]>,
    pub integrator: Integrator,
    pub step_size_ps: f64,
}

impl Default for SystemDescription {
    fn default() -> Self {
        Self {
            masses: Vec::new(),
            nonbonded: Vec::new(),
            bonds: Vec::new(),
            exceptions: Vec::new(),
            periodic_box: None,
            integrator: Integrator::Verlet,
            step_size_ps: 0.002,
        }
    }
}

impl SystemDescription {
    pub fn particle_count(&self) -> usize {
        self.masses.len()
    }

    /// Appends a particle and returns its index.
    pub fn add_particle(&mut self, mass: f64, nonbonded: NonbondedParameters) -> usize {
        self.masses.push(mass);
        self.nonbonded.push(nonbonded);
        self.masses.len() - 1
    }

    pub fn add_bond(&mut self, bond: HarmonicBond) {
        self.bonds.push(bond);
    }

    pub fn add_exception(&mut self, particle1: usize, particle2: usize) {
        self.exceptions.push((particle1, particle2));
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.nonbonded.len() != self.masses.len() {
            return Err(Error::LengthMismatch {
                expected: self.masses.len(),
                actual: self.nonbonded.len(),
            });
        }
        let count = self.particle_count();
        for bond in &self.bonds {
            for index in [bond.particle1, bond.particle2] {
                if index >= count {
                    return Err(Error::ParticleOutOfRange { index, count });
                }
            }
        }
        if !(self.step_size_ps > 0.0) {
            return Err(Error::invalid_system(format!("step size must be positive, got {} ps", self.step_size_ps)));
        }
        Ok(())
    }
}

/// Execution backend able to instantiate a [`Context`].
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self, system: &SystemDescription) -> Result<Box<dyn Context>, Error>;
}

/// A running system bound to one backend.
///
/// Getters return snapshots; setters replace the whole array.
pub trait Context: Send {
    fn backend_name(&self) -> &str;

    fn particle_count(&self) -> usize;

    fn positions(&self) -> Vec<DVec3>;

    fn set_positions(&mut self, positions: &[DVec3]) -> Result<(), Error>;

    fn velocities(&self) -> Vec<DVec3>;

    fn set_velocities(&mut self, velocities: &[DVec3]) -> Result<(), Error>;

    /// Draws Maxwell-Boltzmann velocities for every particle with mass.
    fn set_velocities_to_temperature(&mut self, temperature: f64) -> Result<(), Error>;

    fn mass(&self, particle: usize) -> Result<f64, Error>;

    /// A mass of zero pins the particle in place.
    fn set_mass(&mut self, particle: usize, mass: f64) -> Result<(), Error>;

    fn nonbonded(&self, particle: usize) -> Result<NonbondedParameters, Error>;

    fn set_nonbonded(&mut self, particle: usize, parameters: NonbondedParameters) -> Result<(), Error>;

    /// Andersen thermostat; collision frequency in 1/ps.
    fn add_thermostat(&mut self, temperature: f64, collision_frequency: f64);

    fn step(&mut self) -> Result<(), Error>;

    fn minimize(&mut self, max_iterations: u32) -> Result<(), Error>;
}

/// Slot for an accelerated engine. No such engine is linked into this build.
#[derive(Debug, Default)]
pub struct NativeBackend;

impl Backend for NativeBackend {
    fn name(&self) -> &str {
        "native"
    }

    fn create(&self, _system: &SystemDescription) -> Result<Box<dyn Context>, Error> {
        Err(Error::Unavailable {
            backend: self.name().to_string(),
            reason: "no native engine is linked into this build".to_string(),
        })
    }
}

/// Resolves a configured backend name.
pub fn backend_by_name(name: &str, seed: Option<u64>) -> Option<Arc<dyn Backend>> {
    match name {
        "native" => Some(Arc::new(NativeBackend)),
        "reference" => Some(Arc::new(ReferenceBackend::new(seed))),
        _ => None,
    }
}

/// Resolves the priority list, skipping unknown names with a warning.
pub fn backends_from_names(names: &[String], seed: Option<u64>) -> Vec<Arc<dyn Backend>> {
    names
        .iter()
        .filter_map(|name| {
            let backend = backend_by_name(name, seed);
            if backend.is_none() {
                log::warn!("Ignoring unknown backend '{name}'");
            }
            backend
        })
        .collect()
}
