//! Structure file import and export.
//!
//! The built-in [`PdbStructureIo`] reads and writes PDB files: `ATOM`/`HETATM`
//! records for atoms (coordinates in Å on disk, nm in memory) and `CONECT`
//! records for bonds, a partner listed twice meaning a double bond.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::payload::{PayloadWriter, StateRecord};
use crate::topology::{Topology, element};

const ANGSTROM_PER_NANOMETER: f64 = 10.0;
/// Tolerance applied to the sum of covalent radii when guessing bonds.
const BOND_TOLERANCE: f64 = 1.15;
const WATER_RESIDUES: [&str; 3] = ["HOH", "WAT", "SOL"];

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported structure format '{0}'")]
    UnsupportedFormat(String),

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}

impl Error {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }
}

/// An Import File request: the path plus its `--name=yes|no` options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub path: PathBuf,
    pub generate_bonds: bool,
    pub add_hydrogens: bool,
    pub remove_waters: bool,
}

impl ImportRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            generate_bonds: false,
            add_hydrogens: false,
            remove_waters: false,
        }
    }

    /// Applies one option frame. Malformed and unknown options are logged and ignored.
    pub fn apply_option(&mut self, option: &str) {
        let Some((name, value)) = option.split_once('=') else {
            log::error!("Invalid argument '{option}' for process 'Import File'");
            return;
        };
        let enabled = match value {
            "yes" => true,
            "no" => false,
            _ => {
                log::error!("Invalid argument value '{value}' for argument '{name}' in process 'Import File'");
                return;
            }
        };
        match name {
            "--generate_bonds" => self.generate_bonds = enabled,
            "--add_hydrogens" => self.add_hydrogens = enabled,
            "--remove_waters" => self.remove_waters = enabled,
            _ => log::error!("Unknown argument '{option}' for process 'Import File' will be ignored"),
        }
    }
}

/// Atoms and bonds read from a structure file, indices in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportedStructure {
    pub atomic_numbers: Vec<u8>,
    /// nm
    pub positions: Vec<[f64; 3]>,
    pub bonds: Vec<(u32, u32, u8)>,
}

impl ImportedStructure {
    /// Reply frames: atomic numbers, positions, bonds.
    pub fn to_frames(&self) -> Vec<Vec<u8>> {
        let mut positions = PayloadWriter::with_capacity(self.positions.len() * 24);
        for position in &self.positions {
            positions.write_vec3(*position);
        }
        let mut bonds = PayloadWriter::with_capacity(self.bonds.len() * 9);
        for &(atom1, atom2, order) in &self.bonds {
            bonds.write_u32(atom1);
            bonds.write_u32(atom2);
            bonds.write_u8(order);
        }
        vec![self.atomic_numbers.clone(), positions.into_bytes(), bonds.into_bytes()]
    }
}

pub trait StructureIo: Send + Sync {
    fn import(&self, request: &ImportRequest) -> Result<ImportedStructure, Error>;

    /// Writes `topology` with `state` positions (wire order) to `path`.
    fn export(&self, path: &Path, topology: &Topology, state: &StateRecord) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PdbStructureIo;

fn require_pdb(path: &Path) -> Result<(), Error> {
    let extension = path.extension().and_then(|extension| extension.to_str()).unwrap_or_default();
    if extension.eq_ignore_ascii_case("pdb") {
        Ok(())
    } else {
        Err(Error::UnsupportedFormat(extension.to_string()))
    }
}

/// Columns are 1-based and inclusive, as in the PDB format description.
fn columns(line: &str, first: usize, last: usize) -> &str {
    let end = last.min(line.len());
    let start = (first - 1).min(end);
    line.get(start..end).unwrap_or("").trim()
}

struct PdbAtom {
    serial: u32,
    residue: String,
    element: u8,
    position: [f64; 3],
}

fn parse_atom(line: &str, number: usize) -> Result<PdbAtom, Error> {
    let coordinate = |first, last, axis| {
        columns(line, first, last)
            .parse::<f64>()
            .map_err(|_| Error::parse(number, format!("invalid {axis} coordinate")))
    };
    let serial = columns(line, 7, 11)
        .parse::<u32>()
        .map_err(|_| Error::parse(number, "invalid atom serial number"))?;
    let symbol = match columns(line, 77, 78) {
        "" => columns(line, 13, 16).trim_start_matches(|c: char| c.is_ascii_digit()),
        symbol => symbol,
    };
    let element = element::from_symbol(symbol)
        .or_else(|| symbol.get(..1).and_then(element::from_symbol))
        .ok_or_else(|| Error::parse(number, format!("unknown element '{symbol}'")))?;
    Ok(PdbAtom {
        serial,
        residue: columns(line, 18, 20).to_string(),
        element,
        position: [
            coordinate(31, 38, "x")? / ANGSTROM_PER_NANOMETER,
            coordinate(39, 46, "y")? / ANGSTROM_PER_NANOMETER,
            coordinate(47, 54, "z")? / ANGSTROM_PER_NANOMETER,
        ],
    })
}

fn parse_conect(line: &str, number: usize) -> Result<(u32, Vec<u32>), Error> {
    let serial = |first, last| {
        let field = columns(line, first, last);
        if field.is_empty() {
            Ok(None)
        } else {
            field
                .parse::<u32>()
                .map(Some)
                .map_err(|_| Error::parse(number, format!("invalid CONECT serial '{field}'")))
        }
    };
    let origin = serial(7, 11)?.ok_or_else(|| Error::parse(number, "CONECT record without an atom"))?;
    let mut partners = Vec::new();
    for first in [12, 17, 22, 27] {
        if let Some(partner) = serial(first, first + 4)? {
            partners.push(partner);
        }
    }
    Ok((origin, partners))
}

fn guess_bonds(structure: &mut ImportedStructure) {
    let bonded: std::collections::HashSet<(u32, u32)> = structure.bonds.iter().map(|&(a, b, _)| (a.min(b), a.max(b))).collect();
    let count = structure.atomic_numbers.len();
    let mut added = 0;
    for first in 0..count {
        for second in first + 1..count {
            if bonded.contains(&(first as u32, second as u32)) {
                continue;
            }
            let [x1, y1, z1] = structure.positions[first];
            let [x2, y2, z2] = structure.positions[second];
            let distance = ((x2 - x1).powi(2) + (y2 - y1).powi(2) + (z2 - z1).powi(2)).sqrt();
            let limit = (element::covalent_radius(structure.atomic_numbers[first]) + element::covalent_radius(structure.atomic_numbers[second])) * BOND_TOLERANCE;
            if distance > 0.0 && distance <= limit {
                structure.bonds.push((first as u32, second as u32, 1));
                added += 1;
            }
        }
    }
    log::info!("Generated {added} bonds from atom distances");
}

impl StructureIo for PdbStructureIo {
    fn import(&self, request: &ImportRequest) -> Result<ImportedStructure, Error> {
        require_pdb(&request.path)?;
        let content = std::fs::read_to_string(&request.path).map_err(|err| Error::io(&request.path, err))?;

        let mut index_of_serial = BTreeMap::new();
        let mut structure = ImportedStructure::default();
        let mut bond_orders: BTreeMap<(u32, u32), u8> = BTreeMap::new();
        let mut skipped_waters = 0;
        for (index, line) in content.lines().enumerate() {
            let number = index + 1;
            if line.starts_with("ATOM") || line.starts_with("HETATM") {
                let atom = parse_atom(line, number)?;
                if request.remove_waters && WATER_RESIDUES.contains(&atom.residue.as_str()) {
                    skipped_waters += 1;
                    continue;
                }
                index_of_serial.insert(atom.serial, structure.atomic_numbers.len() as u32);
                structure.atomic_numbers.push(atom.element);
                structure.positions.push(atom.position);
            } else if line.starts_with("CONECT") {
                let (origin, partners) = parse_conect(line, number)?;
                let Some(&from) = index_of_serial.get(&origin) else {
                    continue;
                };
                let mut counts: BTreeMap<u32, u8> = BTreeMap::new();
                for partner in partners {
                    if let Some(&to) = index_of_serial.get(&partner) {
                        *counts.entry(to).or_default() += 1;
                    }
                }
                for (to, count) in counts {
                    let key = (from.min(to), from.max(to));
                    let order = bond_orders.entry(key).or_default();
                    *order = (*order).max(count.min(3));
                }
            }
        }
        structure.bonds = bond_orders.into_iter().map(|((a, b), order)| (a, b, order)).collect();

        if skipped_waters > 0 {
            log::info!("Removed {skipped_waters} water atoms");
        }
        if request.generate_bonds {
            guess_bonds(&mut structure);
        }
        if request.add_hydrogens {
            log::warn!("Adding hydrogens is not supported by the PDB reader; importing as is");
        }
        log::info!(
            "Imported {} atoms and {} bonds from {}",
            structure.atomic_numbers.len(),
            structure.bonds.len(),
            request.path.display()
        );
        Ok(structure)
    }

    fn export(&self, path: &Path, topology: &Topology, state: &StateRecord) -> Result<(), Error> {
        require_pdb(path)?;
        let map = topology.index_map();
        let mut fragment_of = vec![0usize; topology.atoms().len()];
        for (index, fragment) in topology.fragments().iter().enumerate() {
            for &wire in &fragment.atoms {
                fragment_of[wire as usize] = index;
            }
        }

        let mut pdb = String::new();
        for (engine, &wire) in map.engine_order().iter().enumerate() {
            let atom = &topology.atoms()[wire as usize];
            let [x, y, z] = state.positions.get(wire as usize).copied().unwrap_or_default().map(|value| value * ANGSTROM_PER_NANOMETER);
            let symbol = element::symbol(atom.element);
            let _ = writeln!(
                pdb,
                "HETATM{:>5} {:<4} MOL A{:>4}    {:>8.3}{:>8.3}{:>8.3}  1.00  0.00          {:>2}",
                engine + 1,
                symbol,
                (fragment_of[wire as usize] + 1) % 10_000,
                x,
                y,
                z,
                symbol.to_uppercase()
            );
        }

        let mut partners: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for bond in topology.bonds() {
            let (Some(first), Some(second)) = (map.engine(bond.atom1), map.engine(bond.atom2)) else {
                continue;
            };
            for _ in 0..bond.order as usize {
                partners.entry(first + 1).or_default().push(second + 1);
                partners.entry(second + 1).or_default().push(first + 1);
            }
        }
        for (serial, bonded) in partners {
            for chunk in bonded.chunks(4) {
                let _ = write!(pdb, "CONECT{serial:>5}");
                for partner in chunk {
                    let _ = write!(pdb, "{partner:>5}");
                }
                pdb.push('\n');
            }
        }
        pdb.push_str("END\n");

        std::fs::write(path, pdb).map_err(|err| Error::io(path, err))?;
        log::info!("Exported {} atoms to {}", map.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::records::tests::{water_header, water_topology};

    const WATER_PDB: &str = "\
HETATM    1  O   HOH A   1       0.000   0.000   0.000  1.00  0.00           O
HETATM    2  H1  HOH A   1       0.957   0.000   0.000  1.00  0.00           H
HETATM    3  H2  HOH A   1      -0.240   0.927   0.000  1.00  0.00           H
ATOM      4  C   LIG B   2       5.000   5.000   5.000  1.00  0.00           C
ATOM      5  O   LIG B   2       6.200   5.000   5.000  1.00  0.00           O
CONECT    1    2    3
CONECT    4    5    5
END
";

    fn write_pdb(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("input.pdb");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn options_are_parsed_and_bad_ones_ignored() {
        let mut request = ImportRequest::new("a.pdb");
        request.apply_option("--generate_bonds=yes");
        request.apply_option("--remove_waters=maybe");
        request.apply_option("--color=yes");
        request.apply_option("--add_hydrogens");
        assert!(request.generate_bonds);
        assert!(!request.remove_waters);
        assert!(!request.add_hydrogens);
    }

    #[test]
    fn import_reads_atoms_and_bond_orders() {
        let dir = tempfile::tempdir().unwrap();
        let request = ImportRequest::new(write_pdb(&dir, WATER_PDB));
        let structure = PdbStructureIo.import(&request).unwrap();
        assert_eq!(structure.atomic_numbers, vec![8, 1, 1, 6, 8]);
        assert!((structure.positions[1][0] - 0.0957).abs() < 1e-12);
        assert_eq!(structure.bonds, vec![(0, 1, 1), (0, 2, 1), (3, 4, 2)]);

        let frames = structure.to_frames();
        assert_eq!(frames[0].len(), 5);
        assert_eq!(frames[1].len(), 5 * 24);
        assert_eq!(frames[2].len(), 3 * 9);
    }

    #[test]
    fn waters_can_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = ImportRequest::new(write_pdb(&dir, WATER_PDB));
        request.remove_waters = true;
        let structure = PdbStructureIo.import(&request).unwrap();
        assert_eq!(structure.atomic_numbers, vec![6, 8]);
        assert_eq!(structure.bonds, vec![(0, 1, 2)]);
    }

    #[test]
    fn bonds_can_be_generated_from_distances() {
        let dir = tempfile::tempdir().unwrap();
        let without_conect: String = WATER_PDB.lines().filter(|line| !line.starts_with("CONECT")).map(|line| format!("{line}\n")).collect();
        let mut request = ImportRequest::new(write_pdb(&dir, &without_conect));
        request.generate_bonds = true;
        let structure = PdbStructureIo.import(&request).unwrap();
        // the H-H pair is too far apart to count
        assert_eq!(structure.bonds, vec![(0, 1, 1), (0, 2, 1), (3, 4, 1)]);
    }

    #[test]
    fn other_formats_are_rejected() {
        let request = ImportRequest::new("model.mol2");
        assert!(matches!(PdbStructureIo.import(&request), Err(Error::UnsupportedFormat(extension)) if extension == "mol2"));
    }

    #[test]
    fn export_then_import_keeps_the_molecule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("water.pdb");
        let topology = Topology::from_records(&water_header(), &water_topology()).unwrap();
        let state = StateRecord {
            positions: vec![[0.0, 0.0, 0.0], [0.0957, 0.0, 0.0], [-0.024, 0.0927, 0.0]],
        };
        PdbStructureIo.export(&path, &topology, &state).unwrap();

        let structure = PdbStructureIo.import(&ImportRequest::new(&path)).unwrap();
        assert_eq!(structure.atomic_numbers, vec![8, 1, 1]);
        assert_eq!(structure.bonds, vec![(0, 1, 1), (0, 2, 1)]);
        assert!((structure.positions[2][1] - 0.0927).abs() < 1e-6);
    }
}
