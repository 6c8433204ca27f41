//! Assembly of the engine system for a decoded topology.
//!
//! The force-field collaborator provides particles and chemical bonds in
//! engine order. Passivation atoms then lose their nonbonded interaction,
//! the periodic box and integrator are applied, and restraint helpers
//! (locks and anchors) are appended as massless particles after the atoms.
//!
//! ## Assembly Order
//!
//! 1. `parameterize`: partial charges, then the force-field collaborator
//! 2. `configure`: passivation zeroing, box, integrator and step size
//! 3. `engine_positions`: state positions reordered to engine order
//! 4. `add_restraints`: anchor helpers first, then lock helpers
//! 5. `select_backend`: first backend that accepts the system
//!
//! Simulate runs all five with cancellation checks in between. Relax runs
//! the same sequence straight through and minimizes instead of stepping.

use std::sync::Arc;

use glam::DVec3;

use super::StartupError;
use crate::engine::{Backend, Context, ForceFieldList, ForceFieldProvider, HarmonicBond, Integrator, NonbondedParameters, SystemDescription};
use crate::payload::{Header, StateRecord};
use crate::topology::{ChargeModel, Topology};
use crate::virtual_objects::VirtualObjects;

/// Charges the topology and lets the force field turn it into a system.
pub fn parameterize(
    topology: &Topology,
    charges: &dyn ChargeModel,
    force_field: &dyn ForceFieldProvider,
    force_fields: &ForceFieldList,
) -> Result<SystemDescription, StartupError> {
    let partial_charges = topology.assign_partial_charges(charges)?;
    Ok(force_field.parameterize(topology, &partial_charges, force_fields)?)
}

/// Applies passivation zeroing, the periodic box, the integrator and the step size.
pub fn configure(system: &mut SystemDescription, topology: &Topology, header: &Header, temperature: f64, step_size_ps: f64) {
    let map = topology.index_map();
    for (wire, atom) in topology.atoms().iter().enumerate() {
        if !atom.passivation {
            continue;
        }
        if let Some(engine) = map.engine(wire as u32) {
            system.nonbonded[engine] = NonbondedParameters::NONE;
        }
    }
    system.periodic_box = header.periodic_box();
    system.integrator = Integrator::from_name(&header.integrator, temperature);
    system.step_size_ps = step_size_ps;
}

/// State positions reordered into engine order.
pub fn engine_positions(topology: &Topology, state: &StateRecord) -> Result<Vec<DVec3>, StartupError> {
    let order = topology.index_map().engine_order();
    if state.positions.len() != order.len() {
        return Err(crate::engine::Error::LengthMismatch {
            expected: order.len(),
            actual: state.positions.len(),
        }
        .into());
    }
    Ok(order.iter().map(|&wire| DVec3::from_array(state.positions[wire as usize])).collect())
}

/// Appends anchor and lock helpers.
///
/// # Arguments
///
/// * `system` - Engine system in engine order; gains one massless particle
///   per active anchor and per locked atom, plus their harmonic bonds
/// * `positions` - Engine-order positions, extended in step with `system`
/// * `topology` - Source of the wire→engine map used to resolve atom ids
/// * `objects` - Anchor documents; inactive anchors are skipped
/// * `lock_stiffness` - Spring constant of lock restraints, kJ/mol/nm²
///
/// # Returns
///
/// [`StartupError::UnknownSpringTarget`] when a spring names an atom the
/// topology does not have. Locked atoms without an engine index are skipped.
pub fn add_restraints(
    system: &mut SystemDescription,
    positions: &mut Vec<DVec3>,
    topology: &Topology,
    objects: &VirtualObjects,
    lock_stiffness: f64,
) -> Result<(), StartupError> {
    let map = topology.index_map();
    for anchor in objects.active_anchors() {
        let helper = system.add_particle(0.0, NonbondedParameters::INERT);
        positions.push(DVec3::from_array(anchor.position));
        for spring in &anchor.springs {
            let particle = map.engine(spring.particle_id).ok_or(StartupError::UnknownSpringTarget {
                anchor: anchor.id,
                atom: spring.particle_id,
            })?;
            system.add_bond(HarmonicBond {
                particle1: helper,
                particle2: particle,
                length: spring.equilibrium_length,
                k: spring.k_constant,
            });
            system.add_exception(helper, particle);
        }
    }

    let mut locked = 0;
    for (wire, atom) in topology.atoms().iter().enumerate() {
        if !atom.locked {
            continue;
        }
        let Some(particle) = map.engine(wire as u32) else {
            continue;
        };
        let helper = system.add_particle(0.0, NonbondedParameters::INERT);
        positions.push(positions[particle]);
        system.add_bond(HarmonicBond {
            particle1: particle,
            particle2: helper,
            length: 0.0,
            k: lock_stiffness,
        });
        system.add_exception(particle, helper);
        locked += 1;
    }
    if locked > 0 {
        log::info!("Locked {locked} atoms in place");
    }
    Ok(())
}

/// Tries each backend in order and keeps the first whose positions come back without NaN.
///
/// # Returns
///
/// The context of the chosen backend with `positions` already set, or
/// [`StartupError::NoUsableBackend`] when every backend refused.
pub fn select_backend(backends: &[Arc<dyn Backend>], system: &SystemDescription, positions: &[DVec3]) -> Result<Box<dyn Context>, StartupError> {
    for backend in backends {
        let mut context = match backend.create(system) {
            Ok(context) => context,
            Err(err) => {
                log::warn!("Backend '{}' rejected the system: {err}", backend.name());
                continue;
            }
        };
        context.set_positions(positions)?;
        if context.positions().iter().any(|position| position.is_nan()) {
            log::warn!("Backend '{}' produced NaN positions, trying the next one", backend.name());
            continue;
        }
        log::info!("Platform is '{}'", context.backend_name());
        return Ok(context);
    }
    let tried: Vec<&str> = backends.iter().map(|backend| backend.name()).collect();
    Err(StartupError::NoUsableBackend(tried.join(", ")))
}

/// Positions of the explicit atoms in wire order, or `None` when the engine
/// snapshot is missing one of them.
pub fn explicit_positions(topology: &Topology, positions: &[DVec3]) -> Option<Vec<[f64; 3]>> {
    let map = topology.index_map();
    (0..topology.explicit_atom_count())
        .map(|wire| {
            map.engine(wire as u32)
                .and_then(|engine| positions.get(engine))
                .map(|position| position.to_array())
        })
        .collect()
}
