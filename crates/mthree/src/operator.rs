// This code is part of Qiskit.
//
// (C) Copyright IBM 2023
//
// This code is licensed under the Apache License, Version 2.0. You may
// obtain a copy of this license in the LICENSE.txt file in the root directory
// of this source tree or at http://www.apache.org/licenses/LICENSE-2.0.
//
// Any modifications or derivative works of this code must retain this
// copyright notice, and modified files need to carry a notice indicating
// that they have been altered from the originals.

use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use smallvec::SmallVec;

use crate::bitstring::BitstringIndex;
use crate::calibration::CalibrationGroup;
use crate::errors::MitigationError;

type FactorSubs = SmallVec<[usize; 8]>;

/// One tensor factor of the reduced operator: a calibration group plus the
/// bit slots its qubits occupy inside the subset index.
#[derive(Clone, Debug)]
struct Factor {
    group: CalibrationGroup,
    slots: SmallVec<[usize; 4]>,
}

impl Factor {
    /// Gather this factor's bits out of a full subset index.
    #[inline]
    fn sub_index(&self, key: u64) -> usize {
        let mut sub = 0usize;
        for (bit, slot) in self.slots.iter().enumerate() {
            sub |= (((key >> slot) & 1) as usize) << bit;
        }
        sub
    }

    /// Scatter a factor sub-index back into a full subset index.
    #[inline]
    fn with_sub_index(&self, key: u64, sub: usize) -> u64 {
        let mut out = key;
        for (bit, slot) in self.slots.iter().enumerate() {
            out &= !(1u64 << slot);
            out |= (((sub >> bit) & 1) as u64) << slot;
        }
        out
    }
}

/// The forward assignment-noise map over a measured qubit subset,
/// represented as an ordered list of tensor factors and applied without
/// ever materializing the `2^k x 2^k` matrix.
///
/// Matrix elements exist only transiently as products of per-factor
/// entries; both the sparse `apply`/`apply_transpose` pair and the solver's
/// element accessor go through [probability].
///
/// [probability]: ReducedNoiseOperator::probability
#[derive(Clone, Debug)]
pub struct ReducedNoiseOperator {
    index: BitstringIndex,
    factors: Vec<Factor>,
}

impl ReducedNoiseOperator {
    pub(crate) fn new(
        qubits: &[u32],
        groups: Vec<CalibrationGroup>,
    ) -> Result<Self, MitigationError> {
        let index = BitstringIndex::new(qubits);
        let mut factors = Vec::with_capacity(groups.len());
        let mut covered = 0usize;
        for group in groups {
            let slots = group
                .qubits()
                .iter()
                .map(|qubit| index.position(*qubit))
                .collect::<Result<SmallVec<[usize; 4]>, _>>()?;
            covered += slots.len();
            factors.push(Factor { group, slots });
        }
        if covered != qubits.len() {
            return Err(MitigationError::UncalibratedSubset {
                qubits: qubits.to_vec(),
                missing: Vec::new(),
            });
        }
        Ok(ReducedNoiseOperator { index, factors })
    }

    #[inline]
    pub fn num_qubits(&self) -> usize {
        self.index.num_qubits()
    }

    pub fn qubits(&self) -> &[u32] {
        self.index.qubits()
    }

    pub(crate) fn bit_index(&self) -> &BitstringIndex {
        &self.index
    }

    /// `DimensionMismatch` unless the caller's declared subset is exactly
    /// the operator's.
    pub fn ensure_matches(&self, declared: &[u32]) -> Result<(), MitigationError> {
        if self.index.qubits() != declared {
            return Err(MitigationError::DimensionMismatch {
                operator: self.num_qubits(),
                declared: declared.len(),
            });
        }
        Ok(())
    }

    /// The matrix element `P(measured | prepared)`, computed on the fly as
    /// the product of the per-factor entries.
    #[inline]
    pub fn probability(&self, measured: u64, prepared: u64) -> f64 {
        self.factors.iter().fold(1.0, |acc, factor| {
            acc * factor
                .group
                .entry(factor.sub_index(measured), factor.sub_index(prepared))
        })
    }

    /// Apply the forward noise map to a sparse vector, factor by factor.
    /// The support of the result is the forward-reachable set of the input
    /// support; an input summing to 1 maps to an output summing to 1.
    pub fn apply(&self, vector: &HashMap<u64, f64>) -> HashMap<u64, f64> {
        self.apply_inner(vector, false)
    }

    /// Apply the transpose of the noise map to a sparse vector.
    pub fn apply_transpose(&self, vector: &HashMap<u64, f64>) -> HashMap<u64, f64> {
        self.apply_inner(vector, true)
    }

    fn apply_inner(&self, vector: &HashMap<u64, f64>, transpose: bool) -> HashMap<u64, f64> {
        let mut current = vector.clone();
        for factor in &self.factors {
            let dim = factor.group.dimension();
            let mut next: HashMap<u64, f64> = HashMap::with_capacity(current.len());
            for (key, value) in &current {
                let sub = factor.sub_index(*key);
                for out_sub in 0..dim {
                    let weight = if transpose {
                        factor.group.entry(sub, out_sub)
                    } else {
                        factor.group.entry(out_sub, sub)
                    };
                    if weight == 0.0 {
                        continue;
                    }
                    let out_key = factor.with_sub_index(*key, out_sub);
                    *next.entry(out_key).or_insert(0.0) += value * weight;
                }
            }
            current = next;
        }
        current
    }

    /// Expand an observed support to every index reachable by re-assigning
    /// at most `distance` tensor factors through nonzero calibration
    /// entries, sorted ascending.  Distance 0 is the observed support
    /// itself.
    pub fn reachable_support(
        &self,
        keys: impl IntoIterator<Item = u64>,
        distance: usize,
    ) -> Vec<u64> {
        let mut support: HashSet<u64> = keys.into_iter().collect();
        let mut frontier: Vec<u64> = support.iter().copied().collect();
        for _ in 0..distance {
            let mut grown = Vec::new();
            for key in frontier {
                for factor in &self.factors {
                    let dim = factor.group.dimension();
                    let sub = factor.sub_index(key);
                    for out_sub in 0..dim {
                        if out_sub == sub {
                            continue;
                        }
                        if factor.group.entry(out_sub, sub) == 0.0
                            && factor.group.entry(sub, out_sub) == 0.0
                        {
                            continue;
                        }
                        let out_key = factor.with_sub_index(key, out_sub);
                        if support.insert(out_key) {
                            grown.push(out_key);
                        }
                    }
                }
            }
            if grown.is_empty() {
                break;
            }
            frontier = grown;
        }
        support.into_iter().sorted_unstable().collect()
    }

    /// Per-factor sub-indices of a key, precomputed once per working-set
    /// element so the solver's element products avoid re-gathering bits.
    pub(crate) fn factor_subs(&self, key: u64) -> FactorSubs {
        self.factors
            .iter()
            .map(|factor| factor.sub_index(key))
            .collect()
    }

    /// Matrix element from precomputed factor sub-indices.
    #[inline]
    pub(crate) fn element(&self, measured: &[usize], prepared: &[usize]) -> f64 {
        self.factors
            .iter()
            .zip(measured.iter().zip(prepared.iter()))
            .fold(1.0, |acc, (factor, (m, p))| acc * factor.group.entry(*m, *p))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::calibration::CalibrationModel;
    use crate::Counts;
    use approx::abs_diff_eq;

    fn counts(entries: &[(&str, u64)]) -> Counts {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn two_qubit_operator() -> ReducedNoiseOperator {
        let mut model = CalibrationModel::new();
        let p0 = counts(&[("0", 90), ("1", 10)]);
        let p1 = counts(&[("0", 10), ("1", 90)]);
        model.calibrate_independent(0, &p0, &p1).unwrap();
        model.calibrate_independent(1, &p0, &p1).unwrap();
        model.operator_for_subset(&[0, 1]).unwrap()
    }

    #[test]
    fn test_probability_is_tensor_product() {
        let op = two_qubit_operator();
        // P(00 | 00) = 0.9 * 0.9, P(11 | 00) = 0.1 * 0.1.
        assert!(abs_diff_eq!(op.probability(0, 0), 0.81, epsilon = 1e-12));
        assert!(abs_diff_eq!(op.probability(3, 0), 0.01, epsilon = 1e-12));
        assert!(abs_diff_eq!(op.probability(1, 0), 0.09, epsilon = 1e-12));
    }

    #[test]
    fn test_apply_conserves_total_mass() {
        let op = two_qubit_operator();
        let mut vector = HashMap::new();
        vector.insert(0u64, 0.7);
        vector.insert(3u64, 0.5);
        vector.insert(1u64, -0.2);
        let image = op.apply(&vector);
        let total: f64 = image.values().sum();
        assert!(abs_diff_eq!(total, 1.0, epsilon = 1e-12));
    }

    #[test]
    fn test_transpose_adjoint_identity() {
        // <A x, y> == <x, A^T y> on a small support.
        let op = two_qubit_operator();
        let x: HashMap<u64, f64> = [(0u64, 0.3), (2u64, 0.7)].into_iter().collect();
        let y: HashMap<u64, f64> = [(1u64, 0.4), (3u64, 0.6)].into_iter().collect();
        let ax = op.apply(&x);
        let aty = op.apply_transpose(&y);
        let lhs: f64 = ax.iter().map(|(k, v)| v * y.get(k).copied().unwrap_or(0.0)).sum();
        let rhs: f64 = x.iter().map(|(k, v)| v * aty.get(k).copied().unwrap_or(0.0)).sum();
        assert!(abs_diff_eq!(lhs, rhs, epsilon = 1e-12));
    }

    #[test]
    fn test_reachable_support_grows_by_factor_distance() {
        let op = two_qubit_operator();
        assert_eq!(op.reachable_support([0u64], 0), vec![0]);
        assert_eq!(op.reachable_support([0u64], 1), vec![0, 1, 2]);
        assert_eq!(op.reachable_support([0u64], 2), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let op = two_qubit_operator();
        assert!(op.ensure_matches(&[0, 1]).is_ok());
        assert!(matches!(
            op.ensure_matches(&[0]),
            Err(MitigationError::DimensionMismatch { operator: 2, declared: 1 })
        ));
    }
}
