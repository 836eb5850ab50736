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
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::bitstring::BitstringIndex;
use crate::errors::MitigationError;
use crate::operator::ReducedNoiseOperator;
use crate::Counts;

/// Version tag of the serialized calibration cache format.  Bump on any
/// incompatible change so stale caches are rejected instead of misread.
pub const CALIBRATION_FORMAT_VERSION: u32 = 1;

/// Largest correlated group the model will calibrate.  The correlated path
/// needs `2^m` calibration circuits and a `2^m x 2^m` matrix, so it is only
/// meant for small crosstalk clusters.
pub const DEFAULT_MAX_CORRELATED: usize = 10;

/// One calibrated unit of the noise model: either a single qubit measured
/// independently of its neighbours, or a small group of qubits whose
/// readout errors are correlated and must be captured jointly.
///
/// Both variants expose the same interface to the operator layer; an entry
/// `(measured, prepared)` is `P(measured | prepared)` over the unit's own
/// bit index space.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CalibrationGroup {
    /// A 2x2 assignment matrix for one qubit; row is the measured outcome,
    /// column the prepared state.
    Independent { qubit: u32, matrix: [[f64; 2]; 2] },
    /// A dense `2^m x 2^m` assignment matrix for an m-qubit group.
    Correlated {
        qubits: Vec<u32>,
        matrix: Array2<f64>,
    },
}

impl CalibrationGroup {
    pub fn qubits(&self) -> &[u32] {
        match self {
            CalibrationGroup::Independent { qubit, .. } => std::slice::from_ref(qubit),
            CalibrationGroup::Correlated { qubits, .. } => qubits,
        }
    }

    #[inline]
    pub fn num_qubits(&self) -> usize {
        self.qubits().len()
    }

    /// Size of the group's own index space, `2^m`.
    #[inline]
    pub fn dimension(&self) -> usize {
        1usize << self.num_qubits()
    }

    /// `P(measured | prepared)` within the group's index space.
    #[inline]
    pub fn entry(&self, measured: usize, prepared: usize) -> f64 {
        match self {
            CalibrationGroup::Independent { matrix, .. } => matrix[measured][prepared],
            CalibrationGroup::Correlated { matrix, .. } => matrix[[measured, prepared]],
        }
    }
}

/// The assignment-noise model for a backend's measured qubits, assembled
/// from calibration counts and queried for matrix-free operators over
/// arbitrary calibrated subsets.
///
/// The model is built once per backend/qubit-set and then shared read-only
/// across any number of correction calls; recalibration takes `&mut self`,
/// so exclusive access during a rebuild is enforced by the borrow checker
/// (wrap the model in an `RwLock` when corrections and recalibrations race).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalibrationModel {
    format_version: u32,
    groups: Vec<CalibrationGroup>,
    max_correlated: usize,
    #[serde(skip)]
    by_qubit: HashMap<u32, usize>,
}

impl Default for CalibrationModel {
    fn default() -> Self {
        Self::new()
    }
}

impl CalibrationModel {
    pub fn new() -> Self {
        Self::with_max_correlated(DEFAULT_MAX_CORRELATED)
    }

    /// A model with a non-default bound on correlated-group size.
    pub fn with_max_correlated(max_correlated: usize) -> Self {
        CalibrationModel {
            format_version: CALIBRATION_FORMAT_VERSION,
            groups: Vec::new(),
            max_correlated,
            by_qubit: HashMap::new(),
        }
    }

    /// Calibrate one qubit from its two basis-state preparations.  Column
    /// `j` of the 2x2 matrix is the shot-normalized count vector observed
    /// after preparing `|j>`.  Any previous calibration covering the qubit
    /// is replaced.
    pub fn calibrate_independent(
        &mut self,
        qubit: u32,
        prep0: &Counts,
        prep1: &Counts,
    ) -> Result<(), MitigationError> {
        let index = BitstringIndex::new(&[qubit]);
        let col0 = normalized_column(prep0, &index, 0)?;
        let col1 = normalized_column(prep1, &index, 1)?;
        let matrix = [[col0[0], col1[0]], [col0[1], col1[1]]];
        self.evict(&[qubit]);
        self.groups.push(CalibrationGroup::Independent { qubit, matrix });
        self.rebuild_lookup();
        Ok(())
    }

    /// Bulk form of [calibrate_independent] over `(qubit, prep0, prep1)`
    /// triples.
    ///
    /// [calibrate_independent]: CalibrationModel::calibrate_independent
    pub fn calibrate_independent_set<'a>(
        &mut self,
        calibrations: impl IntoIterator<Item = (u32, &'a Counts, &'a Counts)>,
    ) -> Result<(), MitigationError> {
        for (qubit, prep0, prep1) in calibrations {
            self.calibrate_independent(qubit, prep0, prep1)?;
        }
        Ok(())
    }

    /// Calibrate a correlated group of `m` qubits from its `2^m` basis-state
    /// preparations, supplied in basis order (`|0...0>` first).  Each column
    /// is normalized independently.  Refuses groups beyond the configured
    /// size bound, since this path is exponential in `m`.
    pub fn calibrate_correlated(
        &mut self,
        qubits: &[u32],
        preparations: &[Counts],
    ) -> Result<(), MitigationError> {
        let m = qubits.len();
        if m > self.max_correlated {
            return Err(MitigationError::SubsetTooLarge {
                size: m,
                max: self.max_correlated,
            });
        }
        let index = BitstringIndex::new(qubits);
        let dim = index.dimension() as usize;
        if preparations.len() != dim {
            return Err(MitigationError::WrongPreparationCount {
                expected: dim,
                found: preparations.len(),
            });
        }
        let mut matrix = Array2::<f64>::zeros((dim, dim));
        for (prepared, counts) in preparations.iter().enumerate() {
            let column = normalized_column(counts, &index, prepared as u64)?;
            for (measured, value) in column.iter().enumerate() {
                matrix[[measured, prepared]] = *value;
            }
        }
        self.evict(qubits);
        self.groups.push(CalibrationGroup::Correlated {
            qubits: qubits.to_vec(),
            matrix,
        });
        self.rebuild_lookup();
        Ok(())
    }

    /// Partition `qubits` into the calibrated groups that cover it and
    /// build the matrix-free noise operator for the subset.
    ///
    /// Every requested qubit must be calibrated, and any correlated group
    /// touched by the subset must be contained in it entirely; an exact
    /// reduced operator does not exist for half of a correlated group.
    pub fn operator_for_subset(
        &self,
        qubits: &[u32],
    ) -> Result<ReducedNoiseOperator, MitigationError> {
        let requested: HashSet<u32> = qubits.iter().copied().collect();
        let mut seen = vec![false; self.groups.len()];
        let mut groups = Vec::new();
        for qubit in qubits {
            let position = *self
                .by_qubit
                .get(qubit)
                .ok_or(MitigationError::UncalibratedQubit(*qubit))?;
            if seen[position] {
                continue;
            }
            seen[position] = true;
            let group = &self.groups[position];
            let missing: Vec<u32> = group
                .qubits()
                .iter()
                .filter(|q| !requested.contains(*q))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(MitigationError::UncalibratedSubset {
                    qubits: qubits.to_vec(),
                    missing,
                });
            }
            groups.push(group.clone());
        }
        ReducedNoiseOperator::new(qubits, groups)
    }

    pub fn is_calibrated(&self, qubit: u32) -> bool {
        self.by_qubit.contains_key(&qubit)
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// Serialize the model into the versioned cache format.
    pub fn to_json(&self) -> Result<String, MitigationError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize a model previously written by [to_json], rejecting
    /// incompatible format versions.
    ///
    /// [to_json]: CalibrationModel::to_json
    pub fn from_json(data: &str) -> Result<Self, MitigationError> {
        let mut model: CalibrationModel = serde_json::from_str(data)?;
        if model.format_version != CALIBRATION_FORMAT_VERSION {
            return Err(MitigationError::IncompatibleFormat {
                found: model.format_version,
                expected: CALIBRATION_FORMAT_VERSION,
            });
        }
        model.rebuild_lookup();
        Ok(model)
    }

    /// Drop every group that overlaps `qubits`.  Recalibration replaces
    /// rather than merges.
    fn evict(&mut self, qubits: &[u32]) {
        self.groups
            .retain(|group| !group.qubits().iter().any(|q| qubits.contains(q)));
    }

    fn rebuild_lookup(&mut self) {
        self.by_qubit.clear();
        for (position, group) in self.groups.iter().enumerate() {
            for qubit in group.qubits() {
                self.by_qubit.insert(*qubit, position);
            }
        }
    }
}

/// Normalize one preparation's counts into a probability column over the
/// group's index space.
fn normalized_column(
    counts: &Counts,
    index: &BitstringIndex,
    prepared: u64,
) -> Result<Vec<f64>, MitigationError> {
    let mut column = vec![0.0; index.dimension() as usize];
    let mut total = 0u64;
    for (key, count) in counts {
        column[index.encode(key)? as usize] += *count as f64;
        total += *count;
    }
    if total == 0 {
        return Err(MitigationError::EmptyCounts(index.decode(prepared)));
    }
    let shots = total as f64;
    for value in column.iter_mut() {
        *value /= shots;
    }
    Ok(column)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::abs_diff_eq;
    use rand::Rng;
    use rand_pcg::Pcg64Mcg;

    fn counts(entries: &[(&str, u64)]) -> Counts {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_independent_columns_normalized() {
        let mut model = CalibrationModel::new();
        model
            .calibrate_independent(0, &counts(&[("0", 90), ("1", 10)]), &counts(&[("0", 20), ("1", 80)]))
            .unwrap();
        let op = model.operator_for_subset(&[0]).unwrap();
        assert!(abs_diff_eq!(op.probability(0, 0), 0.9, epsilon = 1e-12));
        assert!(abs_diff_eq!(op.probability(1, 1), 0.8, epsilon = 1e-12));
    }

    #[test]
    fn test_random_counts_are_column_stochastic() {
        // Property over random calibration counts: every column of every
        // built matrix sums to 1.
        let mut rng = Pcg64Mcg::new(0xcafe_f00d_d15e_a5e5);
        for _ in 0..25 {
            let prep0 = counts(&[("0", rng.gen_range(1..10_000)), ("1", rng.gen_range(0..1_000))]);
            let prep1 = counts(&[("0", rng.gen_range(0..1_000)), ("1", rng.gen_range(1..10_000))]);
            let mut model = CalibrationModel::new();
            model.calibrate_independent(3, &prep0, &prep1).unwrap();
            let op = model.operator_for_subset(&[3]).unwrap();
            for prepared in 0..2u64 {
                let total: f64 = (0..2u64).map(|m| op.probability(m, prepared)).sum();
                assert!(abs_diff_eq!(total, 1.0, epsilon = 1e-12));
            }
        }
    }

    #[test]
    fn test_correlated_group_built_and_bounded() {
        let mut model = CalibrationModel::with_max_correlated(2);
        let preps = vec![
            counts(&[("00", 98), ("01", 1), ("10", 1)]),
            counts(&[("01", 97), ("00", 2), ("11", 1)]),
            counts(&[("10", 96), ("11", 2), ("00", 2)]),
            counts(&[("11", 95), ("10", 3), ("01", 2)]),
        ];
        model.calibrate_correlated(&[1, 2], &preps).unwrap();
        let op = model.operator_for_subset(&[1, 2]).unwrap();
        for prepared in 0..4u64 {
            let total: f64 = (0..4u64).map(|m| op.probability(m, prepared)).sum();
            assert!(abs_diff_eq!(total, 1.0, epsilon = 1e-12));
        }
        assert!(matches!(
            model.calibrate_correlated(&[4, 5, 6], &[]),
            Err(MitigationError::SubsetTooLarge { size: 3, max: 2 })
        ));
    }

    #[test]
    fn test_partial_correlated_subset_refused() {
        let mut model = CalibrationModel::new();
        let preps = vec![
            counts(&[("00", 100)]),
            counts(&[("01", 100)]),
            counts(&[("10", 100)]),
            counts(&[("11", 100)]),
        ];
        model.calibrate_correlated(&[1, 2], &preps).unwrap();
        assert!(matches!(
            model.operator_for_subset(&[1]),
            Err(MitigationError::UncalibratedSubset { .. })
        ));
    }

    #[test]
    fn test_uncalibrated_qubit() {
        let model = CalibrationModel::new();
        assert!(matches!(
            model.operator_for_subset(&[7]),
            Err(MitigationError::UncalibratedQubit(7))
        ));
    }

    #[test]
    fn test_recalibration_replaces() {
        let mut model = CalibrationModel::new();
        let p0 = counts(&[("0", 100)]);
        let p1 = counts(&[("1", 100)]);
        model.calibrate_independent(0, &p0, &p1).unwrap();
        model.calibrate_independent(0, &p0, &p1).unwrap();
        assert_eq!(model.num_groups(), 1);
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut model = CalibrationModel::new();
        model
            .calibrate_independent(2, &counts(&[("0", 95), ("1", 5)]), &counts(&[("0", 8), ("1", 92)]))
            .unwrap();
        let blob = model.to_json().unwrap();
        let restored = CalibrationModel::from_json(&blob).unwrap();
        assert!(restored.is_calibrated(2));
        let op = restored.operator_for_subset(&[2]).unwrap();
        assert!(abs_diff_eq!(op.probability(0, 0), 0.95, epsilon = 1e-12));
    }

    #[test]
    fn test_incompatible_format_rejected() {
        let mut model = CalibrationModel::new();
        model.format_version = CALIBRATION_FORMAT_VERSION + 1;
        let blob = model.to_json().unwrap();
        assert!(matches!(
            CalibrationModel::from_json(&blob),
            Err(MitigationError::IncompatibleFormat { .. })
        ));
    }

    #[test]
    fn test_empty_counts_rejected() {
        let mut model = CalibrationModel::new();
        assert!(matches!(
            model.calibrate_independent(0, &Counts::default(), &counts(&[("1", 10)])),
            Err(MitigationError::EmptyCounts(_))
        ));
    }
}
