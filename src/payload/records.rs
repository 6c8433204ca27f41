//! Fixed-layout records exchanged with the host.
//!
//! Layouts (all little-endian):
//!
//! ```text
//! Header               molecules u32 | atoms u32 | bonds u32 | passivated u32 |
//!                      virtual objects u32 | box 3×f64 | integrator string
//! SimulationParameters temperature f64 | time step fs f64 | steps per report u32 | total steps u32
//! Topology             per molecule {id u32, atoms u32, passivations u32}
//!                      per atom {element u8, hybridization u8, charge i8 (sign-magnitude), locked u8}
//!                      per bond {atom1 u32, atom2 u32, order u8}
//!                      per passivation {parent atom u32}
//! State                3×f64 per atom, explicit atoms then passivation atoms
//! ```

use super::{Error, PayloadReader, PayloadWriter};

/// Femtoseconds in one nanosecond.
const FEMTOSECONDS_PER_NANOSECOND: f64 = 1e6;

const MOLECULE_WIDTH: usize = 12;
const ATOM_WIDTH: usize = 4;
const BOND_WIDTH: usize = 9;
const POSITION_WIDTH: usize = 24;

/// Capacity for `count` records of `width` bytes, bounded by what the frame can still hold.
fn capacity_for(reader: &PayloadReader<'_>, count: usize, width: usize) -> usize {
    count.min(reader.remaining() / width)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub molecules_count: u32,
    pub atoms_count: u32,
    pub bonds_count: u32,
    pub passivated_atoms_count: u32,
    pub virtual_objects_count: u32,
    /// Box edge lengths in nm. Any negative component means non-periodic.
    pub periodic_box_size: [f64; 3],
    pub integrator: String,
}

impl Header {
    pub fn decode(chunk: &[u8]) -> Result<Self, Error> {
        let mut reader = PayloadReader::new(chunk);
        let header = Self {
            molecules_count: reader.read_u32()?,
            atoms_count: reader.read_u32()?,
            bonds_count: reader.read_u32()?,
            passivated_atoms_count: reader.read_u32()?,
            virtual_objects_count: reader.read_u32()?,
            periodic_box_size: reader.read_vec3()?,
            integrator: reader.read_utf8_string()?,
        };
        reader.finish()?;
        if header.passivated_atoms_count > header.atoms_count {
            return Err(Error::malformed(format!(
                "header declares {} passivated atoms but only {} atoms",
                header.passivated_atoms_count, header.atoms_count
            )));
        }
        Ok(header)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::new();
        writer.write_u32(self.molecules_count);
        writer.write_u32(self.atoms_count);
        writer.write_u32(self.bonds_count);
        writer.write_u32(self.passivated_atoms_count);
        writer.write_u32(self.virtual_objects_count);
        writer.write_vec3(self.periodic_box_size);
        writer.write_utf8_string(&self.integrator);
        writer.into_bytes()
    }

    /// Returns the box edges when every component is non-negative.
    pub fn periodic_box(&self) -> Option<[f64; 3]> {
        if self.periodic_box_size.iter().any(|&edge| edge < 0.0) {
            None
        } else {
            Some(self.periodic_box_size)
        }
    }

    /// Number of positions a matching State frame carries.
    pub fn state_len(&self) -> usize {
        self.atoms_count as usize + self.passivated_atoms_count as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationParameters {
    pub temperature_in_kelvins: f64,
    pub time_step_in_femtoseconds: f64,
    pub steps_per_report: u32,
    pub total_step_count: u32,
}

impl SimulationParameters {
    pub fn decode(chunk: &[u8]) -> Result<Self, Error> {
        let mut reader = PayloadReader::new(chunk);
        let parameters = Self {
            temperature_in_kelvins: reader.read_f64()?,
            time_step_in_femtoseconds: reader.read_f64()?,
            steps_per_report: reader.read_u32()?,
            total_step_count: reader.read_u32()?,
        };
        reader.finish()?;
        if !(parameters.time_step_in_femtoseconds > 0.0) {
            return Err(Error::malformed(format!("time step must be positive, got {} fs", parameters.time_step_in_femtoseconds)));
        }
        if parameters.steps_per_report == 0 {
            return Err(Error::malformed("steps per report must be at least 1"));
        }
        Ok(parameters)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::with_capacity(24);
        writer.write_f64(self.temperature_in_kelvins);
        writer.write_f64(self.time_step_in_femtoseconds);
        writer.write_u32(self.steps_per_report);
        writer.write_u32(self.total_step_count);
        writer.into_bytes()
    }

    pub fn time_step_in_nanoseconds(&self) -> f64 {
        self.time_step_in_femtoseconds / FEMTOSECONDS_PER_NANOSECOND
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoleculeRecord {
    pub id: u32,
    pub atom_count: u32,
    pub passivation_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomRecord {
    pub element: u8,
    pub hybridization: u8,
    pub charge: i8,
    pub locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BondRecord {
    pub atom1: u32,
    pub atom2: u32,
    pub order: u8,
}

/// Raw topology body, in wire order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TopologyRecord {
    pub molecules: Vec<MoleculeRecord>,
    pub atoms: Vec<AtomRecord>,
    pub bonds: Vec<BondRecord>,
    /// Parent atom of each passivation atom, in the order they are appended.
    pub passivations: Vec<u32>,
}

impl TopologyRecord {
    pub fn decode(chunk: &[u8], header: &Header) -> Result<Self, Error> {
        let mut reader = PayloadReader::new(chunk);

        let mut molecules = Vec::with_capacity(capacity_for(&reader, header.molecules_count as usize, MOLECULE_WIDTH));
        for _ in 0..header.molecules_count {
            molecules.push(MoleculeRecord {
                id: reader.read_u32()?,
                atom_count: reader.read_u32()?,
                passivation_count: reader.read_u32()?,
            });
        }

        let declared_atoms: u64 = molecules.iter().map(|m| m.atom_count as u64).sum();
        if declared_atoms != header.atoms_count as u64 {
            return Err(Error::malformed(format!(
                "molecules declare {declared_atoms} atoms but header declares {}",
                header.atoms_count
            )));
        }

        let mut atoms = Vec::with_capacity(capacity_for(&reader, header.atoms_count as usize, ATOM_WIDTH));
        for _ in 0..header.atoms_count {
            atoms.push(AtomRecord {
                element: reader.read_u8()?,
                hybridization: reader.read_u8()?,
                charge: reader.read_sign_magnitude_i8()?,
                locked: reader.read_u8()? != 0,
            });
        }

        let mut bonds = Vec::with_capacity(capacity_for(&reader, header.bonds_count as usize, BOND_WIDTH));
        for _ in 0..header.bonds_count {
            bonds.push(BondRecord {
                atom1: reader.read_u32()?,
                atom2: reader.read_u32()?,
                order: reader.read_u8()?,
            });
        }

        let passivation_total: u64 = molecules.iter().map(|m| m.passivation_count as u64).sum();
        let mut passivations = Vec::new();
        for _ in 0..passivation_total {
            passivations.push(reader.read_u32()?);
        }

        reader.finish()?;
        Ok(Self {
            molecules,
            atoms,
            bonds,
            passivations,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::new();
        for molecule in &self.molecules {
            writer.write_u32(molecule.id);
            writer.write_u32(molecule.atom_count);
            writer.write_u32(molecule.passivation_count);
        }
        for atom in &self.atoms {
            writer.write_u8(atom.element);
            writer.write_u8(atom.hybridization);
            writer.write_sign_magnitude_i8(atom.charge);
            writer.write_u8(atom.locked as u8);
        }
        for bond in &self.bonds {
            writer.write_u32(bond.atom1);
            writer.write_u32(bond.atom2);
            writer.write_u8(bond.order);
        }
        for &parent in &self.passivations {
            writer.write_u32(parent);
        }
        writer.into_bytes()
    }
}

/// Initial positions in nm, aligned to wire order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateRecord {
    pub positions: Vec<[f64; 3]>,
}

impl StateRecord {
    pub fn decode(chunk: &[u8], position_count: usize) -> Result<Self, Error> {
        let mut reader = PayloadReader::new(chunk);
        let mut positions = Vec::with_capacity(capacity_for(&reader, position_count, POSITION_WIDTH));
        for _ in 0..position_count {
            positions.push(reader.read_vec3()?);
        }
        reader.finish()?;
        Ok(Self { positions })
    }

    pub fn encode(&self) -> Vec<u8> {
        super::encode_positions(&self.positions)
    }
}
