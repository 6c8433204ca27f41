//! Reference CPU backend.
//!
//! Velocity-Verlet integration over the harmonic terms of the system. Nonbonded
//! parameters are stored and reported back but contribute no force. Massless
//! particles never move.
//!
//! Stepping does not inspect the result: a system that blows up keeps stepping
//! with non-finite positions and the caller decides what to do with them.
//! Minimization fails with [`Error::NonFinitePosition`] instead.

use glam::DVec3;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

use super::{BOLTZMANN, Backend, Context, Error, HarmonicBond, Integrator, NonbondedParameters, SystemDescription};

/// Largest force component (kJ/mol/nm) below which minimization stops.
const MINIMIZE_TOLERANCE: f64 = 10.0;
/// First displacement tried by the minimizer, nm.
const MINIMIZE_INITIAL_STEP: f64 = 0.01;

#[derive(Debug, Clone, Default)]
pub struct ReferenceBackend {
    seed: Option<u64>,
}

impl ReferenceBackend {
    pub fn new(seed: Option<u64>) -> Self {
        Self { seed }
    }
}

impl Backend for ReferenceBackend {
    fn name(&self) -> &str {
        "reference"
    }

    fn create(&self, system: &SystemDescription) -> Result<Box<dyn Context>, Error> {
        system.validate()?;
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let count = system.particle_count();
        let mut context = ReferenceContext {
            masses: system.masses.clone(),
            nonbonded: system.nonbonded.clone(),
            bonds: system.bonds.clone(),
            periodic_box: system.periodic_box.map(DVec3::from_array),
            integrator: system.integrator,
            step_size: system.step_size_ps,
            thermostat: None,
            positions: vec![DVec3::ZERO; count],
            velocities: vec![DVec3::ZERO; count],
            forces: vec![DVec3::ZERO; count],
            steps: 0,
            rng,
        };
        context.compute_forces();
        Ok(Box::new(context))
    }
}

pub struct ReferenceContext {
    masses: Vec<f64>,
    nonbonded: Vec<NonbondedParameters>,
    bonds: Vec<HarmonicBond>,
    periodic_box: Option<DVec3>,
    integrator: Integrator,
    step_size: f64,
    thermostat: Option<(f64, f64)>,
    positions: Vec<DVec3>,
    velocities: Vec<DVec3>,
    forces: Vec<DVec3>,
    steps: u64,
    rng: StdRng,
}

impl ReferenceContext {
    fn check_index(&self, particle: usize) -> Result<(), Error> {
        if particle < self.masses.len() {
            Ok(())
        } else {
            Err(Error::ParticleOutOfRange {
                index: particle,
                count: self.masses.len(),
            })
        }
    }

    fn check_len(&self, actual: usize) -> Result<(), Error> {
        if actual == self.masses.len() {
            Ok(())
        } else {
            Err(Error::LengthMismatch {
                expected: self.masses.len(),
                actual,
            })
        }
    }

    fn separation(&self, from: DVec3, to: DVec3) -> DVec3 {
        let delta = to - from;
        match self.periodic_box {
            Some(edges) => delta - edges * (delta / edges).round(),
            None => delta,
        }
    }

    /// Recomputes forces and returns the potential energy.
    fn compute_forces(&mut self) -> f64 {
        self.forces.iter_mut().for_each(|force| *force = DVec3::ZERO);
        let mut energy = 0.0;
        for bond in &self.bonds {
            let delta = self.separation(self.positions[bond.particle1], self.positions[bond.particle2]);
            let distance = delta.length();
            let stretch = distance - bond.length;
            energy += 0.5 * bond.k * stretch * stretch;
            if distance > 0.0 {
                let force = delta * (-bond.k * stretch / distance);
                self.forces[bond.particle2] += force;
                self.forces[bond.particle1] -= force;
            }
        }
        energy
    }

    fn thermal_velocity(&mut self, temperature: f64, mass: f64) -> DVec3 {
        let sigma = (BOLTZMANN * temperature / mass).sqrt();
        DVec3::new(
            self.rng.sample::<f64, _>(StandardNormal),
            self.rng.sample::<f64, _>(StandardNormal),
            self.rng.sample::<f64, _>(StandardNormal),
        ) * sigma
    }

    fn check_finite(&self) -> Result<(), Error> {
        match self.positions.iter().position(|position| !position.is_finite()) {
            Some(particle) => Err(Error::NonFinitePosition { particle, step: self.steps }),
            None => Ok(()),
        }
    }
}

impl Context for ReferenceContext {
    fn backend_name(&self) -> &str {
        "reference"
    }

    fn particle_count(&self) -> usize {
        self.masses.len()
    }

    fn positions(&self) -> Vec<DVec3> {
        self.positions.clone()
    }

    fn set_positions(&mut self, positions: &[DVec3]) -> Result<(), Error> {
        self.check_len(positions.len())?;
        self.positions.copy_from_slice(positions);
        self.compute_forces();
        Ok(())
    }

    fn velocities(&self) -> Vec<DVec3> {
        self.velocities.clone()
    }

    fn set_velocities(&mut self, velocities: &[DVec3]) -> Result<(), Error> {
        self.check_len(velocities.len())?;
        self.velocities.copy_from_slice(velocities);
        Ok(())
    }

    fn set_velocities_to_temperature(&mut self, temperature: f64) -> Result<(), Error> {
        for particle in 0..self.masses.len() {
            let mass = self.masses[particle];
            self.velocities[particle] = if mass > 0.0 {
                self.thermal_velocity(temperature, mass)
            } else {
                DVec3::ZERO
            };
        }
        Ok(())
    }

    fn mass(&self, particle: usize) -> Result<f64, Error> {
        self.check_index(particle)?;
        Ok(self.masses[particle])
    }

    fn set_mass(&mut self, particle: usize, mass: f64) -> Result<(), Error> {
        self.check_index(particle)?;
        self.masses[particle] = mass;
        Ok(())
    }

    fn nonbonded(&self, particle: usize) -> Result<NonbondedParameters, Error> {
        self.check_index(particle)?;
        Ok(self.nonbonded[particle])
    }

    fn set_nonbonded(&mut self, particle: usize, parameters: NonbondedParameters) -> Result<(), Error> {
        self.check_index(particle)?;
        self.nonbonded[particle] = parameters;
        Ok(())
    }

    fn add_thermostat(&mut self, temperature: f64, collision_frequency: f64) {
        self.thermostat = Some((temperature, collision_frequency));
    }

    fn step(&mut self) -> Result<(), Error> {
        let dt = self.step_size;
        for particle in 0..self.masses.len() {
            let mass = self.masses[particle];
            if mass <= 0.0 {
                continue;
            }
            self.velocities[particle] += self.forces[particle] * (0.5 * dt / mass);
            self.positions[particle] += self.velocities[particle] * dt;
        }
        self.compute_forces();
        for particle in 0..self.masses.len() {
            let mass = self.masses[particle];
            if mass <= 0.0 {
                continue;
            }
            self.velocities[particle] += self.forces[particle] * (0.5 * dt / mass);
        }

        if let Integrator::Langevin { temperature, friction } = self.integrator {
            let damping = (-friction * dt).exp();
            for particle in 0..self.masses.len() {
                let mass = self.masses[particle];
                if mass <= 0.0 {
                    continue;
                }
                let noise = self.thermal_velocity(temperature, mass) * (1.0 - damping * damping).sqrt();
                self.velocities[particle] = self.velocities[particle] * damping + noise;
            }
        }

        if let Some((temperature, frequency)) = self.thermostat {
            let probability = (frequency * dt).min(1.0);
            for particle in 0..self.masses.len() {
                let mass = self.masses[particle];
                if mass > 0.0 && self.rng.gen_bool(probability) {
                    self.velocities[particle] = self.thermal_velocity(temperature, mass);
                }
            }
        }

        self.steps += 1;
        Ok(())
    }

    fn minimize(&mut self, max_iterations: u32) -> Result<(), Error> {
        let mut energy = self.compute_forces();
        let mut step = MINIMIZE_INITIAL_STEP;
        for _ in 0..max_iterations {
            let largest = self
                .forces
                .iter()
                .zip(&self.masses)
                .filter(|(_, mass)| **mass > 0.0)
                .map(|(force, _)| force.abs().max_element())
                .fold(0.0, f64::max);
            if largest < MINIMIZE_TOLERANCE {
                break;
            }

            let previous = self.positions.clone();
            for particle in 0..self.masses.len() {
                if self.masses[particle] > 0.0 {
                    self.positions[particle] += self.forces[particle] * (step / largest);
                }
            }
            let candidate = self.compute_forces();
            if candidate < energy {
                energy = candidate;
                step *= 1.2;
            } else {
                self.positions = previous;
                self.compute_forces();
                step *= 0.5;
            }
        }
        self.check_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diatomic(length: f64) -> SystemDescription {
        let mut system = SystemDescription {
            step_size_ps: 0.001,
            ..Default::default()
        };
        system.add_particle(12.0, NonbondedParameters::NONE);
        system.add_particle(12.0, NonbondedParameters::NONE);
        system.add_bond(HarmonicBond {
            particle1: 0,
            particle2: 1,
            length,
            k: 1000.0,
        });
        system
    }

    #[test]
    fn massless_particles_stay_put() {
        let mut system = diatomic(0.1);
        system.masses[0] = 0.0;
        let mut context = ReferenceBackend::new(Some(1)).create(&system).unwrap();
        context.set_positions(&[DVec3::ZERO, DVec3::new(0.2, 0.0, 0.0)]).unwrap();
        for _ in 0..10 {
            context.step().unwrap();
        }
        let positions = context.positions();
        assert_eq!(positions[0], DVec3::ZERO);
        assert!(positions[1].x < 0.2);
    }

    #[test]
    fn stretched_bond_pulls_inward() {
        let mut context = ReferenceBackend::new(Some(1)).create(&diatomic(0.1)).unwrap();
        context.set_positions(&[DVec3::ZERO, DVec3::new(0.2, 0.0, 0.0)]).unwrap();
        context.step().unwrap();
        let velocities = context.velocities();
        assert!(velocities[0].x > 0.0);
        assert!(velocities[1].x < 0.0);
        assert!((velocities[0].x + velocities[1].x).abs() < 1e-12);
    }

    #[test]
    fn minimize_relaxes_toward_rest_length() {
        let mut context = ReferenceBackend::new(Some(1)).create(&diatomic(0.1)).unwrap();
        context.set_positions(&[DVec3::ZERO, DVec3::new(0.3, 0.0, 0.0)]).unwrap();
        context.minimize(500).unwrap();
        let positions = context.positions();
        let length = (positions[1] - positions[0]).length();
        assert!((length - 0.1).abs() < 0.01, "length after minimize: {length}");
    }

    #[test]
    fn wrong_length_is_rejected() {
        let mut context = ReferenceBackend::new(Some(1)).create(&diatomic(0.1)).unwrap();
        assert!(matches!(
            context.set_positions(&[DVec3::ZERO]),
            Err(Error::LengthMismatch { expected: 2, actual: 1 })
        ));
        assert!(matches!(context.mass(5), Err(Error::ParticleOutOfRange { index: 5, count: 2 })));
    }

    #[test]
    fn blown_up_step_leaves_nan_positions() {
        let mut context = ReferenceBackend::new(Some(1)).create(&diatomic(0.1)).unwrap();
        context.set_positions(&[DVec3::ZERO, DVec3::new(1e307, 0.0, 0.0)]).unwrap();
        context.step().unwrap();
        assert!(context.positions().iter().any(|position| position.is_nan()));
    }

    #[test]
    fn temperature_velocities_skip_massless() {
        let mut system = diatomic(0.1);
        system.masses[1] = 0.0;
        let mut context = ReferenceBackend::new(Some(3)).create(&system).unwrap();
        context.set_velocities_to_temperature(300.0).unwrap();
        let velocities = context.velocities();
        assert_ne!(velocities[0], DVec3::ZERO);
        assert_eq!(velocities[1], DVec3::ZERO);
    }
}
