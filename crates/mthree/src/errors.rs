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

use thiserror::Error;

/// A collection of the errors possible while building a [CalibrationModel]
/// or correcting a counts distribution against one.
///
/// Numerical degeneracy during a solve is deliberately absent from this
/// enum: a degenerate solve falls back to the raw distribution and is
/// reported through [SolveDiagnostics], not as an error.
///
/// [CalibrationModel]: crate::calibration::CalibrationModel
/// [SolveDiagnostics]: crate::correction::SolveDiagnostics
#[derive(Debug, Error)]
pub enum MitigationError {
    /// A bitstring key whose length does not match the qubit subset.
    #[error["Bitstring '{bits}' has length {found}, expected {expected}."]]
    InvalidLength {
        bits: String,
        found: usize,
        expected: usize,
    },
    /// A bitstring key containing a character other than '0' or '1'.
    #[error["Bitstring '{bits}' has a non-binary character at position {position}."]]
    InvalidBit { bits: String, position: usize },
    /// An observable label containing a character outside the diagonal
    /// alphabet 'I', 'Z', '0', '1'.
    #[error["Observable label '{0}' contains a character outside the 'IZ01' alphabet."]]
    InvalidLabel(String),
    /// A qubit that is not part of the subset being indexed.
    #[error["Qubit {0} is not part of this measurement subset."]]
    UnknownQubit(u32),
    /// A qubit with no calibration data in the model.
    #[error["Qubit {0} has no calibration data."]]
    UncalibratedQubit(u32),
    /// A requested subset that cuts through a correlated calibration group,
    /// so the model cannot produce an exact operator for it.
    #[error["Subset {qubits:?} covers only part of a correlated calibration group; missing {missing:?}."]]
    UncalibratedSubset {
        qubits: Vec<u32>,
        missing: Vec<u32>,
    },
    /// An attempt to calibrate a correlated group beyond the exponential
    /// cost bound.
    #[error["Correlated subset of {size} qubits exceeds the maximum of {max}."]]
    SubsetTooLarge { size: usize, max: usize },
    /// An operator applied to a distribution over a different number of
    /// qubits than it was built for.
    #[error["Operator acts on {operator} qubits but the distribution declares {declared}."]]
    DimensionMismatch { operator: usize, declared: usize },
    /// A correlated calibration supplied with the wrong number of
    /// basis-state preparations.
    #[error["Correlated calibration needs {expected} preparations, got {found}."]]
    WrongPreparationCount { expected: usize, found: usize },
    /// A calibration preparation whose counts sum to zero shots.
    #[error["Calibration counts for preparation '{0}' contain no shots."]]
    EmptyCounts(String),
    /// A serialized calibration model written by an incompatible version of
    /// the cache format.
    #[error["Serialized calibration has format version {found}, expected {expected}."]]
    IncompatibleFormat { found: u32, expected: u32 },
    /// A failure encoding or decoding the calibration cache format.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}
