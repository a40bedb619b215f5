use super::models::Topology;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Scale factors applied to one particle pair, one per interaction channel.
///
/// - `m`: permanent multipole energy/force ("mpole" channel),
/// - `d`: permanent field driving the direct induced-dipole set,
/// - `p`: permanent field driving the polar induced-dipole set,
/// - `u`: mutual field between induced dipoles.
///
/// A pair absent from the tables interacts at full strength in every channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairScale {
    pub m: f64,
    pub d: f64,
    pub p: f64,
    pub u: f64,
}

impl PairScale {
    pub const FULL: PairScale = PairScale {
        m: 1.0,
        d: 1.0,
        p: 1.0,
        u: 1.0,
    };
}

/// The per-shell scale factors from which the pair tables are built.
///
/// Defaults are the AMOEBA values: permanent interactions vanish for 1-2 and
/// 1-3 neighbors and are reduced for 1-4 and 1-5; the direct polarization
/// field vanishes within a polarization group; the polar field is halved for
/// 1-4 pairs that share a group; mutual induced interactions are unscaled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleFactors {
    pub m12: f64,
    pub m13: f64,
    pub m14: f64,
    pub m15: f64,
    pub p12: f64,
    pub p13: f64,
    pub p14: f64,
    pub p15: f64,
    /// Extra factor on `p14` when the pair shares a polarization group.
    pub p14_intra: f64,
    /// Direct-field factor within a polarization group.
    pub d_intra: f64,
    /// Mutual-field factor within a polarization group.
    pub u_intra: f64,
}

impl Default for ScaleFactors {
    fn default() -> Self {
        Self {
            m12: 0.0,
            m13: 0.0,
            m14: 0.4,
            m15: 0.8,
            p12: 0.0,
            p13: 0.0,
            p14: 1.0,
            p15: 1.0,
            p14_intra: 0.5,
            d_intra: 0.0,
            u_intra: 1.0,
        }
    }
}

/// Sparse per-pair scale tables, computed once at initialization from the
/// bonded topology and immutable thereafter. Only pairs that deviate from
/// full strength are stored.
#[derive(Debug, Clone, Default)]
pub struct ScaleTables {
    entries: Vec<HashMap<usize, PairScale>>,
}

impl ScaleTables {
    pub fn build(topology: &Topology, factors: &ScaleFactors) -> Self {
        let n = topology.num_particles();
        let mut entries: Vec<HashMap<usize, PairScale>> = vec![HashMap::new(); n];

        let set = |entries: &mut Vec<HashMap<usize, PairScale>>,
                   i: usize,
                   j: usize,
                   f: &dyn Fn(&mut PairScale)| {
            let e = entries[i].entry(j).or_insert(PairScale::FULL);
            f(e);
        };

        for i in 0..n {
            for &j in &topology.covalent12[i] {
                set(&mut entries, i, j, &|s| {
                    s.m = factors.m12;
                    s.p = factors.p12;
                });
            }
            for &j in &topology.covalent13[i] {
                set(&mut entries, i, j, &|s| {
                    s.m = factors.m13;
                    s.p = factors.p13;
                });
            }
            for &j in &topology.covalent14[i] {
                set(&mut entries, i, j, &|s| {
                    s.m = factors.m14;
                    s.p = factors.p14;
                });
            }
            for &j in &topology.covalent15[i] {
                set(&mut entries, i, j, &|s| {
                    s.m = factors.m15;
                    s.p = factors.p15;
                });
            }
        }

        // Group-based factors overlay the covalent ones.
        for i in 0..n {
            for &j in &topology.polarization_group[i] {
                if i == j {
                    continue;
                }
                let in_14 = topology.covalent14[i].contains(&j);
                set(&mut entries, i, j, &|s| {
                    s.d = factors.d_intra;
                    s.u = factors.u_intra;
                    if in_14 {
                        s.p *= factors.p14_intra;
                    }
                });
            }
        }

        Self { entries }
    }

    /// An empty table for a system with no exclusions.
    pub fn full_strength(num_particles: usize) -> Self {
        Self {
            entries: vec![HashMap::new(); num_particles],
        }
    }

    #[inline]
    pub fn pair(&self, i: usize, j: usize) -> PairScale {
        self.entries[i]
            .get(&j)
            .copied()
            .unwrap_or(PairScale::FULL)
    }

    pub fn num_particles(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_tables() -> ScaleTables {
        let t = Topology::from_bonds(5, &[(0, 1), (1, 2), (2, 3), (3, 4)]);
        ScaleTables::build(&t, &ScaleFactors::default())
    }

    #[test]
    fn bonded_neighbors_have_vanishing_permanent_scale() {
        let s = chain_tables();
        assert_eq!(s.pair(0, 1).m, 0.0);
        assert_eq!(s.pair(0, 2).m, 0.0);
        assert_eq!(s.pair(0, 3).m, 0.4);
        assert_eq!(s.pair(0, 4).m, 0.8);
    }

    #[test]
    fn unlisted_pairs_interact_at_full_strength() {
        let t = Topology::from_bonds(6, &[(0, 1)]);
        let s = ScaleTables::build(&t, &ScaleFactors::default());
        assert_eq!(s.pair(0, 5), PairScale::FULL);
        assert_eq!(s.pair(2, 3), PairScale::FULL);
    }

    #[test]
    fn tables_are_symmetric_for_symmetric_topology() {
        let s = chain_tables();
        for i in 0..5 {
            for j in 0..5 {
                if i == j {
                    continue;
                }
                assert_eq!(s.pair(i, j), s.pair(j, i));
            }
        }
    }

    #[test]
    fn polarization_group_zeroes_direct_field_scale() {
        let mut t = Topology::from_bonds(2, &[(0, 1)]);
        t.polarization_group[0] = vec![1];
        t.polarization_group[1] = vec![0];
        let s = ScaleTables::build(&t, &ScaleFactors::default());
        assert_eq!(s.pair(0, 1).d, 0.0);
        assert_eq!(s.pair(0, 1).u, 1.0);
        // covalent factors still apply
        assert_eq!(s.pair(0, 1).m, 0.0);
    }

    #[test]
    fn intragroup_one_four_pairs_halve_polar_scale() {
        let mut t = Topology::from_bonds(4, &[(0, 1), (1, 2), (2, 3)]);
        t.polarization_group[0] = vec![3];
        t.polarization_group[3] = vec![0];
        let s = ScaleTables::build(&t, &ScaleFactors::default());
        assert!((s.pair(0, 3).p - 0.5).abs() < 1e-15);
    }
}
