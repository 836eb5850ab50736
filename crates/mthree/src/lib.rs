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

//! Matrix-free mitigation of measurement (readout) error in sampled
//! bitstring distributions.
//!
//! A [CalibrationModel] is assembled from per-qubit or per-subset
//! calibration counts and reused across many corrections; [correct] and
//! [correct_batch] invert its noise map on observed counts by a
//! preconditioned Krylov solve restricted to the observed support,
//! producing [QuasiDistribution]s that expectation values of diagonal
//! [Observable]s are evaluated against.  The full `2^n x 2^n` assignment
//! matrix is never materialized; all linear algebra runs through the
//! tensor-factor structure of [ReducedNoiseOperator].
//!
//! [CalibrationModel]: calibration::CalibrationModel
//! [correct]: correction::correct
//! [correct_batch]: correction::correct_batch
//! [QuasiDistribution]: distribution::QuasiDistribution
//! [Observable]: expval::Observable
//! [ReducedNoiseOperator]: operator::ReducedNoiseOperator

use std::env;

pub mod bitstring;
pub mod calibration;
pub mod correction;
pub mod distribution;
pub mod errors;
pub mod expval;
pub mod operator;

pub use bitstring::BitstringIndex;
pub use calibration::{CalibrationGroup, CalibrationModel};
pub use correction::{correct, correct_batch, CorrectionOptions, SolveDiagnostics};
pub use distribution::QuasiDistribution;
pub use errors::MitigationError;
pub use expval::Observable;
pub use operator::ReducedNoiseOperator;

/// Raw measurement counts: bitstring key to non-negative shot count.
pub type Counts = hashbrown::HashMap<String, u64>;

#[inline]
pub fn getenv_use_multiple_threads() -> bool {
    let parallel_context = env::var("MTHREE_IN_PARALLEL")
        .unwrap_or_else(|_| "FALSE".to_string())
        .to_uppercase()
        == "TRUE";
    let force_threads = env::var("MTHREE_FORCE_THREADS")
        .unwrap_or_else(|_| "FALSE".to_string())
        .to_uppercase()
        == "TRUE";
    !parallel_context || force_threads
}
