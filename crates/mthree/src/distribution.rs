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

use hashbrown::HashMap;

use crate::correction::SolveDiagnostics;
use crate::errors::MitigationError;
use crate::expval::{self, Observable};

/// A corrected quasi-probability distribution over bitstring keys.
///
/// Individual values may be negative or exceed 1; the total is 1 up to
/// floating error.  The container keeps the shot count of the raw
/// distribution it was corrected from (when known) for shot-noise
/// estimates, and the diagnostics of the solve that produced it.
#[derive(Clone, Debug)]
pub struct QuasiDistribution {
    values: HashMap<String, f64>,
    shots: Option<u64>,
    diagnostics: SolveDiagnostics,
}

impl QuasiDistribution {
    pub(crate) fn new(
        values: HashMap<String, f64>,
        shots: Option<u64>,
        diagnostics: SolveDiagnostics,
    ) -> Self {
        QuasiDistribution {
            values,
            shots,
            diagnostics,
        }
    }

    /// Total quasi-probability, exposed for diagnostics; 1 within floating
    /// tolerance after a solve.
    pub fn sum(&self) -> f64 {
        self.values.values().sum()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.values.iter()
    }

    pub fn values(&self) -> &HashMap<String, f64> {
        &self.values
    }

    pub fn into_values(self) -> HashMap<String, f64> {
        self.values
    }

    pub fn shots(&self) -> Option<u64> {
        self.shots
    }

    pub fn diagnostics(&self) -> SolveDiagnostics {
        self.diagnostics
    }

    /// The error-amplification factor gamma = sum(|q_i|).  Equals 1 for a
    /// valid probability distribution and grows with the negativity the
    /// correction introduced; it drives the stddev upper bound.
    pub fn mitigation_overhead(&self) -> f64 {
        self.values.values().map(|value| value.abs()).sum()
    }

    /// Project onto the probability simplex: the nearest (in Euclidean
    /// distance) valid probability distribution.
    ///
    /// Single deterministic pass over the value-sorted entries: entries too
    /// negative to absorb an equal share of the accumulated deficit are
    /// clipped to zero, and the deficit is spread equally over the
    /// survivors.  Identity on inputs that are already valid; idempotent.
    pub fn nearest_probability_distribution(&self) -> HashMap<String, f64> {
        let mut entries: Vec<(&String, f64)> =
            self.values.iter().map(|(k, v)| (k, *v)).collect();
        entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut deficit = 1.0 - self.sum();
        let mut remaining = entries.len();
        let mut out = HashMap::with_capacity(entries.len());
        for (position, (_, value)) in entries.iter().enumerate() {
            let share = deficit / remaining as f64;
            if value + share < 0.0 {
                deficit += value;
                remaining -= 1;
                continue;
            }
            // Everything from here up is at least as large, so the clip
            // condition cannot trigger again.
            for (key, value) in &entries[position..] {
                out.insert((*key).clone(), value + share);
            }
            break;
        }
        out
    }

    /// Expectation value of a diagonal observable against this
    /// quasi-distribution.
    pub fn expval(&self, observable: &Observable) -> Result<f64, MitigationError> {
        expval::expval(&self.values, observable)
    }

    /// Expectation value plus the shot-noise stddev upper bound
    /// gamma / sqrt(shots).  The bound is an approximation propagated
    /// through the correction, not an exact variance; without a recorded
    /// shot count the stddev is returned as NaN.
    pub fn expval_and_stddev(
        &self,
        observable: &Observable,
    ) -> Result<(f64, f64), MitigationError> {
        let value = self.expval(observable)?;
        let stddev = match self.shots {
            Some(shots) if shots > 0 => self.mitigation_overhead() / (shots as f64).sqrt(),
            _ => f64::NAN,
        };
        Ok((value, stddev))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::abs_diff_eq;

    fn quasi(entries: &[(&str, f64)]) -> QuasiDistribution {
        QuasiDistribution::new(
            entries.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            Some(1000),
            SolveDiagnostics::default(),
        )
    }

    #[test]
    fn test_nearest_is_identity_on_valid() {
        let dist = quasi(&[("00", 0.25), ("01", 0.25), ("10", 0.5)]);
        let nearest = dist.nearest_probability_distribution();
        assert_eq!(nearest.len(), 3);
        for (key, value) in dist.iter() {
            assert!(abs_diff_eq!(nearest[key], *value, epsilon = 1e-12));
        }
    }

    #[test]
    fn test_nearest_clips_and_renormalizes() {
        let dist = quasi(&[("00", 1.05), ("01", -0.1), ("10", 0.05)]);
        let nearest = dist.nearest_probability_distribution();
        let total: f64 = nearest.values().sum();
        assert!(abs_diff_eq!(total, 1.0, epsilon = 1e-12));
        assert!(nearest.values().all(|v| *v >= 0.0));
        assert!(!nearest.contains_key("01"));
    }

    #[test]
    fn test_nearest_idempotent() {
        let dist = quasi(&[("00", 1.2), ("01", -0.15), ("10", -0.05)]);
        let once = dist.nearest_probability_distribution();
        let again = QuasiDistribution::new(once.clone(), None, SolveDiagnostics::default())
            .nearest_probability_distribution();
        for (key, value) in &once {
            assert!(abs_diff_eq!(again[key], *value, epsilon = 1e-12));
        }
    }

    #[test]
    fn test_mitigation_overhead() {
        let dist = quasi(&[("0", 1.1), ("1", -0.1)]);
        assert!(abs_diff_eq!(dist.mitigation_overhead(), 1.2, epsilon = 1e-12));
        assert!(abs_diff_eq!(dist.sum(), 1.0, epsilon = 1e-12));
    }
}
