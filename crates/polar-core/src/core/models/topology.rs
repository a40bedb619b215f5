use serde::{Deserialize, Serialize};

/// Bonded topology of the system, reduced to what the electrostatics engine
/// needs: the covalent neighbor shells (1-2 through 1-5) used for exclusion
/// scaling, and the polarization groups used for group-based scaling of the
/// direct polarization field.
///
/// The shells are stored per particle and are expected to be symmetric
/// (`j in covalent12[i]` iff `i in covalent12[j]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    num_particles: usize,
    pub covalent12: Vec<Vec<usize>>,
    pub covalent13: Vec<Vec<usize>>,
    pub covalent14: Vec<Vec<usize>>,
    pub covalent15: Vec<Vec<usize>>,
    /// Members of the same polarization group as each particle (the group
    /// analogue of the 1-1 covalent map).
    pub polarization_group: Vec<Vec<usize>>,
}

impl Topology {
    /// A topology with no bonds and every particle in its own polarization
    /// group.
    pub fn isolated(num_particles: usize) -> Self {
        Self {
            num_particles,
            covalent12: vec![Vec::new(); num_particles],
            covalent13: vec![Vec::new(); num_particles],
            covalent14: vec![Vec::new(); num_particles],
            covalent15: vec![Vec::new(); num_particles],
            polarization_group: vec![Vec::new(); num_particles],
        }
    }

    pub fn num_particles(&self) -> usize {
        self.num_particles
    }

    /// Builds a topology from a bond list, deriving the 1-3/1-4/1-5 shells by
    /// breadth-first expansion. Polarization groups are left empty (every
    /// particle its own group) unless assigned afterwards.
    pub fn from_bonds(num_particles: usize, bonds: &[(usize, usize)]) -> Self {
        let mut t = Self::isolated(num_particles);
        for &(a, b) in bonds {
            t.covalent12[a].push(b);
            t.covalent12[b].push(a);
        }
        for i in 0..num_particles {
            let one_two: Vec<usize> = t.covalent12[i].clone();
            let mut seen: Vec<usize> = vec![i];
            seen.extend(&one_two);

            let mut shell = one_two;
            for depth in 0..3 {
                let mut next = Vec::new();
                for &j in &shell {
                    for &k in &t.covalent12[j] {
                        if !seen.contains(&k) && !next.contains(&k) {
                            next.push(k);
                        }
                    }
                }
                seen.extend(&next);
                match depth {
                    0 => t.covalent13[i] = next.clone(),
                    1 => t.covalent14[i] = next.clone(),
                    _ => t.covalent15[i] = next.clone(),
                }
                shell = next;
            }
        }
        t
    }

    /// Checks that all neighbor indices are in range.
    pub fn is_consistent(&self) -> bool {
        let in_range = |shells: &[Vec<usize>]| {
            shells
                .iter()
                .all(|s| s.iter().all(|&j| j < self.num_particles))
        };
        self.covalent12.len() == self.num_particles
            && self.covalent13.len() == self.num_particles
            && self.covalent14.len() == self.num_particles
            && self.covalent15.len() == self.num_particles
            && self.polarization_group.len() == self.num_particles
            && in_range(&self.covalent12)
            && in_range(&self.covalent13)
            && in_range(&self.covalent14)
            && in_range(&self.covalent15)
            && in_range(&self.polarization_group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_chain_shells_are_derived_from_bonds() {
        // 0-1-2-3-4 chain
        let t = Topology::from_bonds(5, &[(0, 1), (1, 2), (2, 3), (3, 4)]);
        assert_eq!(t.covalent12[0], vec![1]);
        assert_eq!(t.covalent13[0], vec![2]);
        assert_eq!(t.covalent14[0], vec![3]);
        assert_eq!(t.covalent15[0], vec![4]);
        assert!(t.covalent15[1].is_empty());
        assert!(t.is_consistent());
    }

    #[test]
    fn branched_topology_keeps_shells_disjoint() {
        // methane-like: particle 0 bonded to 1..4
        let t = Topology::from_bonds(5, &[(0, 1), (0, 2), (0, 3), (0, 4)]);
        assert_eq!(t.covalent12[1], vec![0]);
        let mut thirteens = t.covalent13[1].clone();
        thirteens.sort_unstable();
        assert_eq!(thirteens, vec![2, 3, 4]);
        assert!(t.covalent14[1].is_empty());
    }

    #[test]
    fn isolated_topology_has_no_neighbors() {
        let t = Topology::isolated(3);
        assert_eq!(t.num_particles(), 3);
        assert!(t.covalent12.iter().all(|v| v.is_empty()));
        assert!(t.is_consistent());
    }
}
