//! Connected-fragment partition and the wire↔engine index map.

use std::collections::VecDeque;

use super::Bond;

/// A connected group of atoms, as wire ids in BFS discovery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub atoms: Vec<u32>,
}

impl Fragment {
    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }
}

/// Splits `atom_count` atoms into connected fragments over `bonds`.
///
/// Fragments come out in order of their smallest atom id; atoms inside a
/// fragment are in breadth-first discovery order from that atom.
pub fn partition(atom_count: usize, bonds: &[Bond]) -> Vec<Fragment> {
    let mut neighbours: Vec<Vec<u32>> = vec![Vec::new(); atom_count];
    for bond in bonds {
        neighbours[bond.atom1 as usize].push(bond.atom2);
        neighbours[bond.atom2 as usize].push(bond.atom1);
    }

    let mut visited = vec![false; atom_count];
    let mut fragments = Vec::new();
    let mut queue = VecDeque::new();
    for start in 0..atom_count {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        queue.push_back(start as u32);
        let mut atoms = Vec::new();
        while let Some(atom) = queue.pop_front() {
            atoms.push(atom);
            for &neighbour in &neighbours[atom as usize] {
                if !visited[neighbour as usize] {
                    visited[neighbour as usize] = true;
                    queue.push_back(neighbour);
                }
            }
        }
        fragments.push(Fragment { atoms });
    }
    fragments
}

/// Bidirectional map between wire ids and engine particle indices.
///
/// Engine indices are assigned by concatenating fragments in order. The map
/// only covers topology atoms; particles added later (anchors, lock
/// restraints) sit above [`IndexMap::len`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexMap {
    wire_to_engine: Vec<usize>,
    engine_to_wire: Vec<u32>,
}

impl IndexMap {
    pub fn from_fragments(fragments: &[Fragment]) -> Self {
        let engine_to_wire: Vec<u32> = fragments.iter().flat_map(|fragment| fragment.atoms.iter().copied()).collect();
        let mut wire_to_engine = vec![0; engine_to_wire.len()];
        for (engine, &wire) in engine_to_wire.iter().enumerate() {
            wire_to_engine[wire as usize] = engine;
        }
        Self {
            wire_to_engine,
            engine_to_wire,
        }
    }

    pub fn len(&self) -> usize {
        self.engine_to_wire.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engine_to_wire.is_empty()
    }

    pub fn engine(&self, wire: u32) -> Option<usize> {
        self.wire_to_engine.get(wire as usize).copied()
    }

    pub fn wire(&self, engine: usize) -> Option<u32> {
        self.engine_to_wire.get(engine).copied()
    }

    /// Wire ids in engine order.
    pub fn engine_order(&self) -> &[u32] {
        &self.engine_to_wire
    }

    /// Packs `(engine u32, wire u32)` little-endian pairs in engine order.
    pub fn remap_buffer(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.engine_to_wire.len() * 8);
        for (engine, &wire) in self.engine_to_wire.iter().enumerate() {
            buffer.extend_from_slice(&(engine as u32).to_le_bytes());
            buffer.extend_from_slice(&wire.to_le_bytes());
        }
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::BondOrder;

    fn bond(atom1: u32, atom2: u32) -> Bond {
        Bond {
            atom1,
            atom2,
            order: BondOrder::Single,
        }
    }

    #[test]
    fn fragments_follow_smallest_atom_order() {
        let fragments = partition(6, &[bond(0, 1), bond(1, 2), bond(3, 4)]);
        let atoms: Vec<Vec<u32>> = fragments.into_iter().map(|f| f.atoms).collect();
        assert_eq!(atoms, vec![vec![0, 1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn atoms_within_fragment_are_bfs_ordered() {
        // 0 - 3 - 1, 0 - 2
        let fragments = partition(4, &[bond(3, 1), bond(0, 3), bond(0, 2)]);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].atoms, vec![0, 3, 2, 1]);
    }

    #[test]
    fn index_map_is_inverse() {
        let fragments = partition(5, &[bond(0, 4), bond(1, 2)]);
        let map = IndexMap::from_fragments(&fragments);
        assert_eq!(map.engine_order(), &[0, 4, 1, 2, 3]);
        for wire in 0..5u32 {
            let engine = map.engine(wire).unwrap();
            assert_eq!(map.wire(engine), Some(wire));
        }
        assert_eq!(map.engine(5), None);
    }

    #[test]
    fn remap_buffer_pairs_engine_then_wire() {
        let map = IndexMap::from_fragments(&partition(2, &[]));
        let buffer = map.remap_buffer();
        assert_eq!(buffer, vec![0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0]);
    }
}
