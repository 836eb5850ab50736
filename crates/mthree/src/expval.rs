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
use rayon::prelude::*;

use crate::bitstring::normalize_key;
use crate::errors::MitigationError;
use crate::{getenv_use_multiple_threads, Counts};

/// Distributions per batch below which batch evaluation stays serial.
const PARALLEL_THRESHOLD: usize = 8;

const OPER_TABLE_SIZE: usize = (b'Z' as usize) + 1;
const fn generate_oper_table() -> [[f64; 2]; OPER_TABLE_SIZE] {
    let mut table = [[0.; 2]; OPER_TABLE_SIZE];
    table[b'Z' as usize] = [1., -1.];
    table[b'0' as usize] = [1., 0.];
    table[b'1' as usize] = [0., 1.];
    table
}

static OPERS: [[f64; 2]; OPER_TABLE_SIZE] = generate_oper_table();

/// A diagonal observable over bitstrings, immutable once constructed.
///
/// Two constructions: an explicit signed weight per matching bitstring
/// (heavy-output projectors and friends), or a label over the diagonal
/// alphabet `I`/`Z`/`0`/`1` evaluated as a per-character product, one
/// character per bit with the usual rightmost-is-first-qubit convention.
#[derive(Clone, Debug)]
pub struct Observable {
    terms: ObservableTerms,
}

#[derive(Clone, Debug)]
enum ObservableTerms {
    Weights(HashMap<String, f64>),
    Label(String),
}

impl Observable {
    /// An observable carrying an explicit weight for every bitstring in its
    /// support; absent keys weigh zero.
    pub fn from_weights(weights: HashMap<String, f64>) -> Self {
        let weights = weights
            .into_iter()
            .map(|(key, weight)| (normalize_key(&key), weight))
            .collect();
        Observable {
            terms: ObservableTerms::Weights(weights),
        }
    }

    /// An observable from a diagonal label such as `"ZZ"`, `"IZ"` or
    /// `"0Z1"`.
    pub fn from_label(label: &str) -> Result<Self, MitigationError> {
        let label = normalize_key(label);
        if !label
            .bytes()
            .all(|byte| matches!(byte, b'I' | b'Z' | b'0' | b'1'))
        {
            return Err(MitigationError::InvalidLabel(label));
        }
        Ok(Observable {
            terms: ObservableTerms::Label(label),
        })
    }

    /// The weight this observable assigns to `bits`.
    pub fn weight(&self, bits: &str) -> Result<f64, MitigationError> {
        let bits = normalize_key(bits);
        match &self.terms {
            ObservableTerms::Weights(weights) => {
                Ok(weights.get(&bits).copied().unwrap_or(0.0))
            }
            ObservableTerms::Label(label) => {
                if bits.len() != label.len() {
                    let found = bits.len();
                    return Err(MitigationError::InvalidLength {
                        bits,
                        found,
                        expected: label.len(),
                    });
                }
                let mut weight = 1.0;
                for (position, (oper, bit)) in label.bytes().zip(bits.bytes()).enumerate() {
                    if oper == b'I' {
                        continue;
                    }
                    let index = match bit {
                        b'0' => 0,
                        b'1' => 1,
                        _ => {
                            return Err(MitigationError::InvalidBit {
                                bits: bits.clone(),
                                position,
                            });
                        }
                    };
                    weight *= OPERS[oper as usize][index];
                }
                Ok(weight)
            }
        }
    }
}

/// Expectation value of `observable` against a real-valued distribution.
///
/// The sum runs over the distribution's support only; the result is divided
/// by the distribution total, so both probability and quasi-probability
/// inputs (total 1) and unnormalized inputs are handled uniformly.
pub fn expval(
    dist: &HashMap<String, f64>,
    observable: &Observable,
) -> Result<f64, MitigationError> {
    let mut total = 0.0;
    let mut weighted = 0.0;
    for (bits, value) in dist {
        total += value;
        weighted += value * observable.weight(bits)?;
    }
    if total == 0.0 {
        return Ok(0.0);
    }
    Ok(weighted / total)
}

/// Expectation value of `observable` against raw shot counts.
pub fn counts_expval(counts: &Counts, observable: &Observable) -> Result<f64, MitigationError> {
    let dist: HashMap<String, f64> = counts
        .iter()
        .map(|(bits, count)| (bits.clone(), *count as f64))
        .collect();
    expval(&dist, observable)
}

/// Expectation value of `observable` against raw shot counts, plus the
/// shot-noise standard error `sqrt((<O^2> - <O>^2) / shots)`.  Diagonal
/// observables square entrywise, so `<O^2>` is evaluated through squared
/// weights.
pub fn counts_expval_and_stddev(
    counts: &Counts,
    observable: &Observable,
) -> Result<(f64, f64), MitigationError> {
    let shots: u64 = counts.values().sum();
    if shots == 0 {
        return Ok((0.0, f64::NAN));
    }
    let mut mean = 0.0;
    let mut second_moment = 0.0;
    for (bits, count) in counts {
        let probability = *count as f64 / shots as f64;
        let weight = observable.weight(bits)?;
        mean += probability * weight;
        second_moment += probability * weight * weight;
    }
    let variance = (second_moment - mean * mean).max(0.0);
    Ok((mean, (variance / shots as f64).sqrt()))
}

/// Evaluate a batch of (distribution, observable) pairs independently,
/// order-matched to the input.  The batch form exists for throughput only;
/// items run in parallel above a size threshold when the thread policy
/// allows it.
pub fn expval_batch(
    pairs: &[(&HashMap<String, f64>, &Observable)],
) -> Vec<Result<f64, MitigationError>> {
    if pairs.len() >= PARALLEL_THRESHOLD && getenv_use_multiple_threads() {
        pairs
            .par_iter()
            .map(|(dist, observable)| expval(dist, observable))
            .collect()
    } else {
        pairs
            .iter()
            .map(|(dist, observable)| expval(dist, observable))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::abs_diff_eq;

    fn dist(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_single_key_projector_is_exact() {
        let mut counts = Counts::default();
        counts.insert("000".to_string(), 100);
        let observable = Observable::from_weights(dist(&[("000", 1.0)]));
        assert_eq!(counts_expval(&counts, &observable).unwrap(), 1.0);
    }

    #[test]
    fn test_z_label_expval() {
        // <ZZ> on a perfect Bell distribution is +1; on "01"/"10" it is -1.
        let observable = Observable::from_label("ZZ").unwrap();
        let bell = dist(&[("00", 0.5), ("11", 0.5)]);
        let anti = dist(&[("01", 0.5), ("10", 0.5)]);
        assert!(abs_diff_eq!(expval(&bell, &observable).unwrap(), 1.0, epsilon = 1e-12));
        assert!(abs_diff_eq!(expval(&anti, &observable).unwrap(), -1.0, epsilon = 1e-12));
    }

    #[test]
    fn test_identity_positions_ignored() {
        let observable = Observable::from_label("IZ").unwrap();
        // Weight depends only on the rightmost bit.
        assert_eq!(observable.weight("00").unwrap(), 1.0);
        assert_eq!(observable.weight("01").unwrap(), -1.0);
        assert_eq!(observable.weight("10").unwrap(), 1.0);
    }

    #[test]
    fn test_bad_label_rejected() {
        assert!(matches!(
            Observable::from_label("ZX"),
            Err(MitigationError::InvalidLabel(_))
        ));
    }

    #[test]
    fn test_quasi_weights_can_be_negative() {
        let observable = Observable::from_weights(dist(&[("0", 1.0), ("1", 1.0)]));
        let quasi = dist(&[("0", 1.1), ("1", -0.1)]);
        assert!(abs_diff_eq!(expval(&quasi, &observable).unwrap(), 1.0, epsilon = 1e-12));
    }

    #[test]
    fn test_counts_stddev_shrinks_with_shots() {
        let observable = Observable::from_label("Z").unwrap();
        let small = dist(&[("0", 75.0), ("1", 25.0)]);
        let mut small_counts = Counts::default();
        let mut big_counts = Counts::default();
        for (k, v) in &small {
            small_counts.insert(k.clone(), *v as u64);
            big_counts.insert(k.clone(), (*v as u64) * 100);
        }
        let (mean_small, err_small) =
            counts_expval_and_stddev(&small_counts, &observable).unwrap();
        let (mean_big, err_big) = counts_expval_and_stddev(&big_counts, &observable).unwrap();
        assert!(abs_diff_eq!(mean_small, mean_big, epsilon = 1e-12));
        assert!(err_big < err_small);
        assert!(abs_diff_eq!(err_small * 0.1, err_big, epsilon = 1e-12));
    }

    #[test]
    fn test_batch_order_matched() {
        let observable = Observable::from_label("Z").unwrap();
        let dists: Vec<HashMap<String, f64>> = (0..16)
            .map(|i| dist(&[("0", i as f64 / 16.0), ("1", 1.0 - i as f64 / 16.0)]))
            .collect();
        let pairs: Vec<(&HashMap<String, f64>, &Observable)> =
            dists.iter().map(|d| (d, &observable)).collect();
        let results = expval_batch(&pairs);
        for (i, result) in results.iter().enumerate() {
            let expected = 2.0 * (i as f64 / 16.0) - 1.0;
            assert!(abs_diff_eq!(
                *result.as_ref().unwrap(),
                expected,
                epsilon = 1e-12
            ));
        }
    }
}
