//! Motors: virtual actuators that override the velocity of their particles.
//!
//! A motor owns the explicit atoms of the molecules it is connected to. Every
//! step it advances its speed profile and overwrites the velocity of each
//! owned particle: rotary motors spin them about an axis through the motor
//! origin, linear motors replace the velocity component along the axis.
//! Speeds are kept in nm/ns (or rad/ns) and converted to the engine's nm/ps
//! only when written.
//!
//! ## Module Organization
//!
//! - `kinematics`: pure speed profile and cycle state machine
//! - this module: construction from a motor document, rotary and linear
//!   velocity output, and the per-step application to an engine context

pub mod kinematics;

use std::f64::consts::TAU;

use glam::DVec3;
use thiserror::Error;

use crate::engine::{self, Context};
use crate::topology::Topology;
use crate::virtual_objects::MotorDocument;

pub use kinematics::{CycleLimit, CyclePolicy, KinematicState, Phase, Profile};

/// Femtoseconds in one nanosecond.
const FEMTOSECONDS_PER_NANOSECOND: f64 = 1e6;
/// Converts nm/ns into the engine's nm/ps.
const PICOSECONDS_PER_NANOSECOND: f64 = 1000.0;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("unknown motor type {0}")]
    UnknownMotorType(u8),

    #[error("unknown cycle type {0}")]
    UnknownCycleType(u8),

    #[error("motor axis direction must not be zero")]
    ZeroAxis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorKind {
    Rotary,
    Linear,
}

impl TryFrom<u8> for MotorKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MotorKind::Rotary),
            2 => Ok(MotorKind::Linear),
            other => Err(Error::UnknownMotorType(other)),
        }
    }
}

/// Velocity (nm/ns) of a particle turning about the line through `origin` along `axis`.
///
/// `speed` is angular, rad/ns. A particle lying on the axis gets no velocity.
pub fn rotary_velocity(origin: DVec3, axis: DVec3, position: DVec3, speed: f64, polarity: f64) -> DVec3 {
    let on_axis = origin + axis * (position - origin).dot(axis);
    let radial = position - on_axis;
    let distance = radial.length();
    radial.normalize_or_zero().cross(axis) * speed * distance * polarity
}

/// Replaces the component of `current` along `axis` with `speed × polarity`.
pub fn linear_velocity(axis: DVec3, current: DVec3, speed: f64, polarity: f64) -> DVec3 {
    current - axis * current.dot(axis) + axis * speed * polarity
}

#[derive(Debug, Clone)]
pub struct Motor {
    kind: MotorKind,
    profile: Profile,
    state: KinematicState,
    origin: DVec3,
    /// Unit length.
    axis: DVec3,
    particles: Vec<usize>,
}

impl Motor {
    /// Builds a motor owning every explicit atom of its connected molecules.
    pub fn from_document(document: &MotorDocument, topology: &Topology) -> Result<Self, Error> {
        let parameters = &document.parameters;
        let kind = MotorKind::try_from(parameters.motor_type)?;
        let axis = DVec3::from_array(document.axis_direction).try_normalize().ok_or(Error::ZeroAxis)?;
        let polarity = if parameters.polarity == 0 { 1.0 } else { -1.0 };
        let top_speed = match kind {
            MotorKind::Rotary => parameters.top_revolutions_per_nanosecond * TAU,
            MotorKind::Linear => parameters.top_speed_in_nanometers_by_nanoseconds,
        };

        let stop_after = parameters.cycle_eventually_stops.then_some(parameters.cycle_stop_after_n_cycles);
        let policy = |limit| CyclePolicy {
            limit,
            pause: parameters.cycle_pause_time_in_femtoseconds / FEMTOSECONDS_PER_NANOSECOND,
            stop_after,
            swap_polarity: parameters.cycle_swap_polarity,
        };
        let ramp_in = parameters.ramp_in_time_in_nanoseconds;
        let ramp_out = parameters.ramp_out_time_in_nanoseconds;
        let profile = match parameters.cycle_type {
            0 => Profile::continuous(top_speed, ramp_in),
            1 => Profile::cycling(
                top_speed,
                ramp_in,
                ramp_out,
                policy(CycleLimit::Time(parameters.cycle_time_limit_in_femtoseconds / FEMTOSECONDS_PER_NANOSECOND)),
            ),
            2 => {
                let limit = match kind {
                    MotorKind::Rotary => parameters.cycle_distance_limit * TAU,
                    MotorKind::Linear => parameters.cycle_distance_limit,
                };
                Profile::cycling(top_speed, ramp_in, ramp_out, policy(CycleLimit::Distance(limit)))
            }
            other => return Err(Error::UnknownCycleType(other)),
        };

        let particles = topology.explicit_particles_of(&document.connected_molecules);
        let kind_name = match kind {
            MotorKind::Rotary => "rotary",
            MotorKind::Linear => "linear",
        };
        log::info!("Added {} particles to {kind_name} force", particles.len());

        Ok(Self {
            kind,
            profile,
            state: KinematicState::new(polarity),
            origin: DVec3::from_array(document.position),
            axis,
            particles,
        })
    }

    pub fn kind(&self) -> MotorKind {
        self.kind
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn state(&self) -> &KinematicState {
        &self.state
    }

    pub fn particles(&self) -> &[usize] {
        &self.particles
    }

    /// Distance covered so far: revolutions for rotary motors, nm for linear ones.
    pub fn distance(&self) -> f64 {
        match self.kind {
            MotorKind::Rotary => self.state.distance / TAU,
            MotorKind::Linear => self.state.distance,
        }
    }

    /// Advances the profile by `dt` ns and writes the velocity of every owned particle.
    ///
    /// Stopped motors and motors without particles leave the context untouched.
    ///
    /// # Arguments
    ///
    /// * `context` - Engine context whose velocities are overwritten
    /// * `dt` - Step size in ns
    ///
    /// # Returns
    ///
    /// The engine error when reading positions or writing velocities fails.
    pub fn advance(&mut self, context: &mut dyn Context, dt: f64) -> Result<(), engine::Error> {
        if self.state.stopped || self.particles.is_empty() {
            return Ok(());
        }
        let (state, speed) = self.profile.advance(self.state, dt);
        self.state = state;

        let mut velocities = context.velocities();
        match self.kind {
            MotorKind::Rotary => {
                let positions = context.positions();
                for &particle in &self.particles {
                    let velocity = rotary_velocity(self.origin, self.axis, positions[particle], speed, self.state.polarity);
                    velocities[particle] = velocity / PICOSECONDS_PER_NANOSECOND;
                }
            }
            MotorKind::Linear => {
                let speed = speed / PICOSECONDS_PER_NANOSECOND;
                for &particle in &self.particles {
                    velocities[particle] = linear_velocity(self.axis, velocities[particle], speed, self.state.polarity);
                }
            }
        }
        context.set_velocities(&velocities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Backend, NonbondedParameters, ReferenceBackend, SystemDescription};
    use crate::payload::records::tests::{water_header, water_topology};
    use crate::virtual_objects::VirtualObjects;
    use crate::virtual_objects::tests::linear_motor_json;

    fn close(a: DVec3, b: DVec3) -> bool {
        (a - b).length() < 1e-12
    }

    #[test]
    fn rotary_velocity_is_tangential() {
        let velocity = rotary_velocity(DVec3::ZERO, DVec3::Z, DVec3::new(2.0, 0.0, 5.0), 3.0, 1.0);
        assert!(close(velocity, DVec3::new(0.0, -6.0, 0.0)));
        let reversed = rotary_velocity(DVec3::ZERO, DVec3::Z, DVec3::new(2.0, 0.0, 5.0), 3.0, -1.0);
        assert!(close(reversed, -velocity));
    }

    #[test]
    fn rotary_velocity_on_axis_is_zero() {
        let velocity = rotary_velocity(DVec3::new(1.0, 1.0, 0.0), DVec3::Z, DVec3::new(1.0, 1.0, 4.0), 3.0, 1.0);
        assert_eq!(velocity, DVec3::ZERO);
    }

    #[test]
    fn linear_velocity_keeps_perpendicular_components() {
        let velocity = linear_velocity(DVec3::X, DVec3::new(5.0, 2.0, -1.0), 3.0, -1.0);
        assert!(close(velocity, DVec3::new(-3.0, 2.0, -1.0)));
    }

    fn water() -> Topology {
        Topology::from_records(&water_header(), &water_topology()).unwrap()
    }

    fn motor_document(json: &str) -> MotorDocument {
        let mut objects = VirtualObjects::default();
        objects.add_document(json).unwrap();
        objects.motors.remove(0)
    }

    #[test]
    fn owns_atoms_of_connected_molecules() {
        let topology = water();
        let motor = Motor::from_document(&motor_document(&linear_motor_json(7)), &topology).unwrap();
        assert_eq!(motor.particles(), &[0, 1, 2]);
        assert_eq!(motor.kind(), MotorKind::Linear);

        let unconnected = Motor::from_document(&motor_document(&linear_motor_json(99)), &topology).unwrap();
        assert!(unconnected.particles().is_empty());
    }

    #[test]
    fn rejects_unknown_types_and_zero_axis() {
        let topology = water();
        let mut document = motor_document(&linear_motor_json(7));
        document.parameters.motor_type = 3;
        assert_eq!(Motor::from_document(&document, &topology).unwrap_err(), Error::UnknownMotorType(3));

        let mut document = motor_document(&linear_motor_json(7));
        document.parameters.cycle_type = 9;
        assert_eq!(Motor::from_document(&document, &topology).unwrap_err(), Error::UnknownCycleType(9));

        let mut document = motor_document(&linear_motor_json(7));
        document.axis_direction = [0.0, 0.0, 0.0];
        assert_eq!(Motor::from_document(&document, &topology).unwrap_err(), Error::ZeroAxis);
    }

    #[test]
    fn rotary_cycle_units_are_converted() {
        let topology = water();
        let mut document = motor_document(&linear_motor_json(7));
        document.parameters.motor_type = 1;
        document.parameters.top_revolutions_per_nanosecond = 1.0;
        document.parameters.cycle_type = 1;
        document.parameters.cycle_time_limit_in_femtoseconds = 2e6;
        let motor = Motor::from_document(&document, &topology).unwrap();
        assert!((motor.profile().top_speed() - TAU).abs() < 1e-12);
        assert!((motor.profile().stop_at() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn linear_motor_sets_axial_velocity_in_engine_units() {
        let topology = water();
        let mut motor = Motor::from_document(&motor_document(&linear_motor_json(7)), &topology).unwrap();

        let mut system = SystemDescription::default();
        for _ in 0..3 {
            system.add_particle(1.0, NonbondedParameters::NONE);
        }
        let mut context = ReferenceBackend::new(Some(1)).create(&system).unwrap();
        context.set_velocities(&[DVec3::new(0.5, 0.25, 0.0); 3]).unwrap();

        motor.advance(context.as_mut(), 0.001).unwrap();
        for velocity in context.velocities() {
            // 10 nm/ns top speed, no ramp: 0.01 nm/ps along x, y untouched
            assert!(close(velocity, DVec3::new(0.01, 0.25, 0.0)));
        }
        assert!((motor.distance() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn motor_without_particles_is_a_no_op() {
        let topology = water();
        let mut motor = Motor::from_document(&motor_document(&linear_motor_json(99)), &topology).unwrap();
        let mut system = SystemDescription::default();
        system.add_particle(1.0, NonbondedParameters::NONE);
        let mut context = ReferenceBackend::new(Some(1)).create(&system).unwrap();
        context.set_velocities(&[DVec3::ONE]).unwrap();
        motor.advance(context.as_mut(), 0.001).unwrap();
        assert_eq!(context.velocities(), vec![DVec3::ONE]);
        assert_eq!(motor.state().elapsed, 0.0);
    }
}
