//! Atom/bond graph decoded from the topology record.
//!
//! Passivation atoms are synthesized after the explicit atoms, the graph is
//! split into connected fragments, and the fragment order fixes the engine
//! particle index of every atom.
//!
//! ## Module Organization
//!
//! - `fragments`: breadth-first fragment partition and the wire↔engine [`IndexMap`]
//! - `charges`: partial-charge collaborator with the MMFF94 → Gasteiger fallback
//! - `element`: symbols, masses and covalent radii

pub mod charges;
pub mod element;
pub mod fragments;

use std::collections::HashSet;

use thiserror::Error;

use crate::payload::{Header, TopologyRecord};

pub use charges::{ChargeMethod, ChargeModel, FormalChargeModel};
pub use fragments::{Fragment, IndexMap};

/// Element number used for passivation atoms.
pub const PASSIVATION_ELEMENT: u8 = 1;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("bond #{index} references atom {atom} but the topology has {atom_count} atoms")]
    InvalidBond { index: usize, atom: u32, atom_count: usize },

    #[error("bond #{index} has unsupported order {order}")]
    InvalidBondOrder { index: usize, order: u8 },

    #[error("passivation #{index} references atom {parent} but only {explicit_count} explicit atoms exist")]
    InvalidPassivationParent { index: usize, parent: u32, explicit_count: usize },

    #[error("molecule records declare {declared} passivation atoms but the header declares {header}")]
    PassivationCountMismatch { declared: usize, header: usize },

    #[error("{0}")]
    ChargeAssignment(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondOrder {
    Single = 1,
    Double = 2,
    Triple = 3,
}

impl TryFrom<u8> for BondOrder {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(BondOrder::Single),
            2 => Ok(BondOrder::Double),
            3 => Ok(BondOrder::Triple),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    pub element: u8,
    pub hybridization: u8,
    pub formal_charge: i8,
    pub molecule_id: u32,
    pub locked: bool,
    pub passivation: bool,
}

/// Undirected bond between two wire ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bond {
    pub atom1: u32,
    pub atom2: u32,
    pub order: BondOrder,
}

/// Immutable topology: atoms in wire order, bonds, fragments and the index map.
#[derive(Debug, Clone)]
pub struct Topology {
    atoms: Vec<Atom>,
    bonds: Vec<Bond>,
    explicit_count: usize,
    fragments: Vec<Fragment>,
    fragment_of: Vec<usize>,
    index_map: IndexMap,
}

impl Topology {
    /// Builds the topology from a decoded record.
    ///
    /// Molecule records are scanned first so every explicit and passivation
    /// atom knows its owning molecule, then explicit atoms and bonds are taken
    /// in wire order, then one hydrogen plus one single bond per passivation
    /// record is appended.
    pub fn from_records(header: &Header, record: &TopologyRecord) -> Result<Self, Error> {
        let mut explicit_owners = Vec::with_capacity(record.atoms.len());
        let mut passivation_owners = Vec::with_capacity(record.passivations.len());
        for molecule in &record.molecules {
            explicit_owners.extend(std::iter::repeat_n(molecule.id, molecule.atom_count as usize));
            passivation_owners.extend(std::iter::repeat_n(molecule.id, molecule.passivation_count as usize));
        }
        if passivation_owners.len() != header.passivated_atoms_count as usize {
            return Err(Error::PassivationCountMismatch {
                declared: passivation_owners.len(),
                header: header.passivated_atoms_count as usize,
            });
        }

        let explicit_count = record.atoms.len();
        let total_count = explicit_count + record.passivations.len();

        let mut atoms = Vec::with_capacity(total_count);
        for (atom, &molecule_id) in record.atoms.iter().zip(&explicit_owners) {
            atoms.push(Atom {
                element: atom.element,
                hybridization: atom.hybridization,
                formal_charge: atom.charge,
                molecule_id,
                locked: atom.locked,
                passivation: false,
            });
        }

        let mut bonds = Vec::with_capacity(record.bonds.len() + record.passivations.len());
        for (index, bond) in record.bonds.iter().enumerate() {
            for atom in [bond.atom1, bond.atom2] {
                if atom as usize >= total_count {
                    return Err(Error::InvalidBond {
                        index,
                        atom,
                        atom_count: total_count,
                    });
                }
            }
            let order = BondOrder::try_from(bond.order).map_err(|order| Error::InvalidBondOrder { index, order })?;
            bonds.push(Bond {
                atom1: bond.atom1,
                atom2: bond.atom2,
                order,
            });
        }

        for (index, (&parent, &molecule_id)) in record.passivations.iter().zip(&passivation_owners).enumerate() {
            if parent as usize >= explicit_count {
                return Err(Error::InvalidPassivationParent {
                    index,
                    parent,
                    explicit_count,
                });
            }
            atoms.push(Atom {
                element: PASSIVATION_ELEMENT,
                hybridization: 0,
                formal_charge: 0,
                molecule_id,
                locked: false,
                passivation: true,
            });
            bonds.push(Bond {
                atom1: parent,
                atom2: (atoms.len() - 1) as u32,
                order: BondOrder::Single,
            });
        }

        let fragments = fragments::partition(atoms.len(), &bonds);
        let mut fragment_of = vec![0; atoms.len()];
        for (fragment_index, fragment) in fragments.iter().enumerate() {
            for &atom in &fragment.atoms {
                fragment_of[atom as usize] = fragment_index;
            }
        }
        let index_map = IndexMap::from_fragments(&fragments);
        log::info!("Created {} molecules", fragments.len());

        Ok(Self {
            atoms,
            bonds,
            explicit_count,
            fragments,
            fragment_of,
            index_map,
        })
    }

    /// All atoms in wire order, passivation atoms last.
    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    pub fn bonds(&self) -> &[Bond] {
        &self.bonds
    }

    pub fn explicit_atom_count(&self) -> usize {
        self.explicit_count
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn index_map(&self) -> &IndexMap {
        &self.index_map
    }

    /// Engine indices of the explicit atoms owned by any of `molecule_ids`, in wire order.
    pub fn explicit_particles_of(&self, molecule_ids: &[u32]) -> Vec<usize> {
        let wanted: HashSet<u32> = molecule_ids.iter().copied().collect();
        self.atoms[..self.explicit_count]
            .iter()
            .enumerate()
            .filter(|(_, atom)| wanted.contains(&atom.molecule_id))
            .filter_map(|(wire, _)| self.index_map.engine(wire as u32))
            .collect()
    }

    /// Copies of a fragment's atoms plus its bonds in fragment-local indices.
    pub fn fragment_graph(&self, fragment: &Fragment) -> (Vec<Atom>, Vec<(usize, usize)>) {
        let atoms = fragment.atoms.iter().map(|&wire| self.atoms[wire as usize].clone()).collect();
        let Some(&first) = fragment.atoms.first() else {
            return (atoms, Vec::new());
        };
        let fragment_index = self.fragment_of[first as usize];
        let offset = self.index_map.engine(first).unwrap_or(0);
        let local = |wire: u32| self.index_map.engine(wire).unwrap_or(offset) - offset;
        let bonds = self
            .bonds
            .iter()
            .filter(|bond| self.fragment_of[bond.atom1 as usize] == fragment_index)
            .map(|bond| (local(bond.atom1), local(bond.atom2)))
            .collect();
        (atoms, bonds)
    }
}
