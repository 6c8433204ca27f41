//! Force-field parameterization collaborator.

use std::path::{Path, PathBuf};

use super::{Error, HarmonicBond, NonbondedParameters, SystemDescription};
use crate::topology::{BondOrder, Topology, element};

/// Separator between entries of a force-field list frame.
const LIST_SEPARATOR: char = ';';

/// Base force field followed by extension files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForceFieldList {
    pub base: String,
    pub extensions: Vec<String>,
}

impl ForceFieldList {
    /// Parses a `;`-separated list. Empty entries are dropped.
    pub fn parse(list: &str) -> Result<Self, Error> {
        let mut entries = list.split(LIST_SEPARATOR).map(str::trim).filter(|entry| !entry.is_empty());
        let base = entries
            .next()
            .ok_or_else(|| Error::ForceField("force-field list is empty".to_string()))?
            .to_string();
        Ok(Self {
            base,
            extensions: entries.map(str::to_string).collect(),
        })
    }

    /// Resolves the base file under `base_dir` and the extensions under `extension_dir`.
    pub fn paths(&self, base_dir: &Path, extension_dir: &Path) -> Vec<PathBuf> {
        std::iter::once(base_dir.join(&self.base))
            .chain(self.extensions.iter().map(|extension| extension_dir.join(extension)))
            .collect()
    }
}

/// Turns a topology into engine particles and bonded terms.
///
/// Particles are emitted in engine order; `charges` is indexed the same way.
pub trait ForceFieldProvider: Send + Sync {
    fn parameterize(&self, topology: &Topology, charges: &[f64], force_fields: &ForceFieldList) -> Result<SystemDescription, Error>;
}

/// Per-element parameters with harmonic chemical bonds.
///
/// Masses come from the element table, bond rest lengths from covalent radii
/// shortened by bond order. All bonds share one stiffness.
#[derive(Debug, Clone)]
pub struct ElementForceField {
    pub base_dir: PathBuf,
    pub extension_dir: PathBuf,
    /// kJ/mol/nm²
    pub bond_stiffness: f64,
    /// kJ/mol
    pub epsilon: f64,
}

impl ElementForceField {
    pub fn new(base_dir: impl Into<PathBuf>, extension_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            extension_dir: extension_dir.into(),
            bond_stiffness: 250_000.0,
            epsilon: 0.4,
        }
    }
}

fn order_factor(order: BondOrder) -> f64 {
    match order {
        BondOrder::Single => 1.0,
        BondOrder::Double => 0.87,
        BondOrder::Triple => 0.78,
    }
}

impl ForceFieldProvider for ElementForceField {
    fn parameterize(&self, topology: &Topology, charges: &[f64], force_fields: &ForceFieldList) -> Result<SystemDescription, Error> {
        for path in force_fields.paths(&self.base_dir, &self.extension_dir) {
            log::debug!("Force field source: {}", path.display());
        }

        let map = topology.index_map();
        if charges.len() != map.len() {
            return Err(Error::LengthMismatch {
                expected: map.len(),
                actual: charges.len(),
            });
        }

        let mut system = SystemDescription::default();
        for (engine, &wire) in map.engine_order().iter().enumerate() {
            let atom = &topology.atoms()[wire as usize];
            system.add_particle(
                element::mass(atom.element),
                NonbondedParameters {
                    charge: charges[engine],
                    sigma: 2.0 * element::covalent_radius(atom.element),
                    epsilon: self.epsilon,
                },
            );
        }

        for bond in topology.bonds() {
            let (Some(particle1), Some(particle2)) = (map.engine(bond.atom1), map.engine(bond.atom2)) else {
                return Err(Error::invalid_system(format!("bond {}-{} is outside the index map", bond.atom1, bond.atom2)));
            };
            let elements = (topology.atoms()[bond.atom1 as usize].element, topology.atoms()[bond.atom2 as usize].element);
            system.add_bond(HarmonicBond {
                particle1,
                particle2,
                length: (element::covalent_radius(elements.0) + element::covalent_radius(elements.1)) * order_factor(bond.order),
                k: self.bond_stiffness,
            });
            system.add_exception(particle1, particle2);
        }
        Ok(system)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::records::tests::{water_header, water_topology};

    #[test]
    fn list_splits_base_and_extensions() {
        let list = ForceFieldList::parse("openff-2.1.0.offxml;extra.offxml; ;more.offxml").unwrap();
        assert_eq!(list.base, "openff-2.1.0.offxml");
        assert_eq!(list.extensions, vec!["extra.offxml", "more.offxml"]);
        let paths = list.paths(Path::new("offxml"), Path::new("offxml_extensions"));
        assert_eq!(paths[0], Path::new("offxml/openff-2.1.0.offxml"));
        assert_eq!(paths[2], Path::new("offxml_extensions/more.offxml"));
    }

    #[test]
    fn empty_list_is_rejected() {
        assert!(ForceFieldList::parse(" ; ").is_err());
    }

    #[test]
    fn water_gets_two_bonds_and_oxygen_mass() {
        let topology = Topology::from_records(&water_header(), &water_topology()).unwrap();
        let list = ForceFieldList::parse("base.offxml").unwrap();
        let system = ElementForceField::new("offxml", "offxml_extensions")
            .parameterize(&topology, &[-0.8, 0.4, 0.4], &list)
            .unwrap();
        assert_eq!(system.particle_count(), 3);
        assert!((system.masses[0] - 15.999).abs() < 1e-9);
        assert_eq!(system.nonbonded[0].charge, -0.8);
        assert_eq!(system.bonds.len(), 2);
        assert!((system.bonds[0].length - 0.097).abs() < 1e-9);
        assert_eq!(system.exceptions, vec![(0, 1), (0, 2)]);
    }
}
