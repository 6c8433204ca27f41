//! Per-element lookup data.

/// Element symbols indexed by atomic number (index 0 is the unknown element).
const SYMBOLS: [&str; 119] = [
    "X", "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S", "Cl", "Ar", "K", "Ca", "Sc", "Ti", "V",
    "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge", "As", "Se", "Br", "Kr", "Rb", "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh",
    "Pd", "Ag", "Cd", "In", "Sn", "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm", "Sm", "Eu", "Gd", "Tb", "Dy", "Ho",
    "Er", "Tm", "Yb", "Lu", "Hf", "Ta", "W", "Re", "Os", "Ir", "Pt", "Au", "Hg", "Tl", "Pb", "Bi", "Po", "At", "Rn", "Fr", "Ra", "Ac",
    "Th", "Pa", "U", "Np", "Pu", "Am", "Cm", "Bk", "Cf", "Es", "Fm", "Md", "No", "Lr", "Rf", "Db", "Sg", "Bh", "Hs", "Mt", "Ds", "Rg",
    "Cn", "Nh", "Fl", "Mc", "Lv", "Ts", "Og",
];

/// Standard atomic weights (g/mol) for the first four periods plus iodine.
const MASSES: [(u8, f64); 37] = [
    (1, 1.008),
    (2, 4.0026),
    (3, 6.94),
    (4, 9.0122),
    (5, 10.81),
    (6, 12.011),
    (7, 14.007),
    (8, 15.999),
    (9, 18.998),
    (10, 20.180),
    (11, 22.990),
    (12, 24.305),
    (13, 26.982),
    (14, 28.085),
    (15, 30.974),
    (16, 32.06),
    (17, 35.45),
    (18, 39.948),
    (19, 39.098),
    (20, 40.078),
    (21, 44.956),
    (22, 47.867),
    (23, 50.942),
    (24, 51.996),
    (25, 54.938),
    (26, 55.845),
    (27, 58.933),
    (28, 58.693),
    (29, 63.546),
    (30, 65.38),
    (31, 69.723),
    (32, 72.630),
    (33, 74.922),
    (34, 78.971),
    (35, 79.904),
    (36, 83.798),
    (53, 126.90),
];

/// Single-bond covalent radii in nm for the elements most structures use.
const COVALENT_RADII: [(u8, f64); 12] = [
    (1, 0.031),
    (5, 0.084),
    (6, 0.076),
    (7, 0.071),
    (8, 0.066),
    (9, 0.057),
    (14, 0.111),
    (15, 0.107),
    (16, 0.105),
    (17, 0.102),
    (35, 0.120),
    (53, 0.139),
];

const DEFAULT_COVALENT_RADIUS: f64 = 0.150;

/// Elements the MMFF94 parameter set covers.
const MMFF94_ELEMENTS: [u8; 11] = [1, 6, 7, 8, 9, 14, 15, 16, 17, 35, 53];

pub fn is_known(atomic_number: u8) -> bool {
    (1..SYMBOLS.len()).contains(&(atomic_number as usize))
}

pub fn symbol(atomic_number: u8) -> &'static str {
    SYMBOLS.get(atomic_number as usize).copied().unwrap_or(SYMBOLS[0])
}

/// Looks up an element by symbol, ignoring case.
pub fn from_symbol(symbol: &str) -> Option<u8> {
    let symbol = symbol.trim();
    SYMBOLS
        .iter()
        .skip(1)
        .position(|candidate| candidate.eq_ignore_ascii_case(symbol))
        .map(|index| (index + 1) as u8)
}

/// Atomic mass in g/mol. Heavier elements outside the table are approximated.
pub fn mass(atomic_number: u8) -> f64 {
    MASSES
        .iter()
        .find(|(number, _)| *number == atomic_number)
        .map(|(_, mass)| *mass)
        .unwrap_or(atomic_number as f64 * 2.5)
}

pub fn covalent_radius(atomic_number: u8) -> f64 {
    COVALENT_RADII
        .iter()
        .find(|(number, _)| *number == atomic_number)
        .map(|(_, radius)| *radius)
        .unwrap_or(DEFAULT_COVALENT_RADIUS)
}

pub fn has_mmff94_parameters(atomic_number: u8) -> bool {
    MMFF94_ELEMENTS.contains(&atomic_number)
}
