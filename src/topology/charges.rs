//! Partial-charge assignment with a single fallback method.

use std::fmt;

use super::{Atom, Error, Topology, element};

/// Marker the charge collaborator uses in front of a fragment-local atom index.
const ATOM_MARKER: &str = "atom # ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeMethod {
    Mmff94,
    Gasteiger,
}

impl fmt::Display for ChargeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChargeMethod::Mmff94 => write!(f, "mmff94"),
            ChargeMethod::Gasteiger => write!(f, "gasteiger"),
        }
    }
}

/// Chemistry collaborator that assigns partial charges to one fragment.
///
/// `atoms` and `bonds` are fragment-local: bond endpoints index into `atoms`.
/// Errors are free text; a failing atom is reported as `atom # N ` with `N`
/// its fragment-local index.
pub trait ChargeModel: Send + Sync {
    fn assign(&self, atoms: &[Atom], bonds: &[(usize, usize)], method: ChargeMethod) -> Result<Vec<f64>, String>;
}

/// Charges taken straight from the formal charges.
///
/// MMFF94 refuses elements outside its parameter set; Gasteiger only refuses
/// unknown elements.
#[derive(Debug, Default, Clone, Copy)]
pub struct FormalChargeModel;

impl ChargeModel for FormalChargeModel {
    fn assign(&self, atoms: &[Atom], _bonds: &[(usize, usize)], method: ChargeMethod) -> Result<Vec<f64>, String> {
        let mut charges = Vec::with_capacity(atoms.len());
        for (index, atom) in atoms.iter().enumerate() {
            let supported = match method {
                ChargeMethod::Mmff94 => element::has_mmff94_parameters(atom.element),
                ChargeMethod::Gasteiger => element::is_known(atom.element),
            };
            if !supported {
                return Err(format!(
                    "{method} has no parameters for {ATOM_MARKER}{index} (element {})",
                    atom.element
                ));
            }
            charges.push(atom.formal_charge as f64);
        }
        Ok(charges)
    }
}

impl Topology {
    /// Assigns partial charges to every topology atom, returned in engine order.
    ///
    /// MMFF94 is tried on all fragments first. If any fragment fails, all
    /// fragments are redone with Gasteiger. A Gasteiger failure is reported
    /// with the fragment-local atom index rewritten to the wire id.
    pub fn assign_partial_charges(&self, model: &dyn ChargeModel) -> Result<Vec<f64>, Error> {
        match self.charges_with(model, ChargeMethod::Mmff94) {
            Ok(charges) => Ok(charges),
            Err((_, message)) => {
                log::warn!("Failed to assign partial charges with method 'mmff94' ({message}). Fallback to 'gasteiger'");
                self.charges_with(model, ChargeMethod::Gasteiger).map_err(|(fragment_index, message)| {
                    let fragment = &self.fragments()[fragment_index];
                    Error::ChargeAssignment(rewrite_atom_index(&message, &fragment.atoms))
                })
            }
        }
    }

    fn charges_with(&self, model: &dyn ChargeModel, method: ChargeMethod) -> Result<Vec<f64>, (usize, String)> {
        let mut charges = Vec::with_capacity(self.atoms().len());
        for (fragment_index, fragment) in self.fragments().iter().enumerate() {
            let (atoms, bonds) = self.fragment_graph(fragment);
            let fragment_charges = model.assign(&atoms, &bonds, method).map_err(|message| (fragment_index, message))?;
            if fragment_charges.len() != atoms.len() {
                return Err((
                    fragment_index,
                    format!("{method} returned {} charges for {} atoms", fragment_charges.len(), atoms.len()),
                ));
            }
            charges.extend(fragment_charges);
        }
        Ok(charges)
    }
}

/// Replaces the fragment-local index after `atom # ` with the matching wire id.
///
/// Messages without a parseable index are returned unchanged.
pub fn rewrite_atom_index(message: &str, fragment_atoms: &[u32]) -> String {
    let Some(marker) = message.find(ATOM_MARKER) else {
        return message.to_string();
    };
    let start = marker + ATOM_MARKER.len();
    let end = message[start..].find(' ').map(|offset| start + offset).unwrap_or(message.len());
    let wire = message[start..end]
        .parse::<usize>()
        .ok()
        .and_then(|local| fragment_atoms.get(local));
    match wire {
        Some(wire) => format!("{}{}{}", &message[..start], wire, &message[end..]),
        None => message.to_string(),
    }
}
