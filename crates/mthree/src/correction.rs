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
use ndarray::Array2;
use rayon::prelude::*;
use smallvec::SmallVec;

use crate::calibration::CalibrationModel;
use crate::distribution::QuasiDistribution;
use crate::errors::MitigationError;
use crate::operator::ReducedNoiseOperator;
use crate::{getenv_use_multiple_threads, Counts};

/// Jobs per batch below which batch correction stays serial.  Each item is
/// a full iterative solve, so the crossover is low.
const BATCH_PARALLEL_THRESHOLD: usize = 2;

/// Diagonal-preconditioner entries below this are treated as a singular
/// operator on the working set.
const BREAKDOWN_EPS: f64 = 1e-12;

/// Tunables of the iterative correction.
#[derive(Clone, Copy, Debug)]
pub struct CorrectionOptions {
    /// Relative-residual convergence tolerance of the GMRES solve.
    pub tol: f64,
    /// Hard cap on GMRES iterations; hitting it returns the best iterate
    /// rather than an error.
    pub max_iterations: usize,
    /// How many tensor factors away from the observed support the working
    /// set is expanded.  0 solves on the observed support only; larger
    /// values reduce truncation bias at exponential-in-distance cost.
    pub support_distance: usize,
}

impl Default for CorrectionOptions {
    fn default() -> Self {
        CorrectionOptions {
            tol: 1e-5,
            max_iterations: 25,
            support_distance: 2,
        }
    }
}

/// Numerical outcome of one correction solve, attached to the returned
/// distribution.
#[derive(Clone, Copy, Debug, Default)]
pub struct SolveDiagnostics {
    /// GMRES iterations actually run (0 for the trivial single-key path).
    pub iterations: usize,
    /// Final relative residual of the solve; NaN when the solve broke down
    /// before any residual could be formed.
    pub residual: f64,
    /// Whether the residual met the tolerance before the iteration cap.
    pub converged: bool,
    /// The operator was singular to working precision on the working set
    /// and the raw distribution was returned unmodified.
    pub degenerate: bool,
}

/// Correct an observed counts distribution against the calibration model,
/// returning the quasi-probability distribution that the noise model maps
/// to the observation.
///
/// `qubits` maps classical bit positions to physical qubit indices (bit 0
/// first); structural errors (unknown keys, missing calibration) abort the
/// call, while numerical degeneracy falls back to the raw distribution with
/// [SolveDiagnostics::degenerate] set.
pub fn correct(
    counts: &Counts,
    qubits: &[u32],
    model: &CalibrationModel,
    options: &CorrectionOptions,
) -> Result<QuasiDistribution, MitigationError> {
    let operator = model.operator_for_subset(qubits)?;
    correct_with_operator(counts, qubits, &operator, options)
}

/// [correct], but reusing an already-built operator (callers that cache
/// operators per subset).
///
/// [correct]: crate::correction::correct
pub fn correct_with_operator(
    counts: &Counts,
    qubits: &[u32],
    operator: &ReducedNoiseOperator,
    options: &CorrectionOptions,
) -> Result<QuasiDistribution, MitigationError> {
    operator.ensure_matches(qubits)?;
    let index = operator.bit_index();
    let shots: u64 = counts.values().sum();
    if shots == 0 {
        return Err(MitigationError::EmptyCounts("observed".to_string()));
    }
    let mut observed: HashMap<u64, f64> = HashMap::with_capacity(counts.len());
    for (key, count) in counts {
        if *count == 0 {
            continue;
        }
        *observed.entry(index.encode(key)?).or_insert(0.0) += *count as f64 / shots as f64;
    }

    // A single observed bitstring is a fixed point of the correction.
    if observed.len() == 1 {
        let key = *observed.keys().next().unwrap();
        let mut values = HashMap::with_capacity(1);
        values.insert(index.decode(key), 1.0);
        let diagnostics = SolveDiagnostics {
            converged: true,
            ..SolveDiagnostics::default()
        };
        return Ok(QuasiDistribution::new(values, Some(shots), diagnostics));
    }

    let (solution, diagnostics) = solve(operator, &observed, options);
    let values = solution
        .into_iter()
        .filter(|(_, value)| *value != 0.0)
        .map(|(key, value)| (index.decode(key), value))
        .collect();
    Ok(QuasiDistribution::new(values, Some(shots), diagnostics))
}

/// Correct a batch of independent (counts, qubit-mapping) jobs.  Results
/// are order-matched to the input; one job's error never aborts the rest.
/// Jobs run in parallel above a size threshold when the thread policy
/// allows it.
pub fn correct_batch(
    jobs: &[(Counts, Vec<u32>)],
    model: &CalibrationModel,
    options: &CorrectionOptions,
) -> Vec<Result<QuasiDistribution, MitigationError>> {
    if jobs.len() >= BATCH_PARALLEL_THRESHOLD && getenv_use_multiple_threads() {
        jobs.par_iter()
            .map(|(counts, qubits)| correct(counts, qubits, model, options))
            .collect()
    } else {
        jobs.iter()
            .map(|(counts, qubits)| correct(counts, qubits, model, options))
            .collect()
    }
}

/// Solve `A x = b` on the expanded working set with Jacobi-preconditioned
/// GMRES, matrix elements computed on the fly from the tensor factors.
/// Never fails: numerical breakdown returns `b` itself with the degenerate
/// flag set, and hitting the iteration cap returns the best iterate.
fn solve(
    operator: &ReducedNoiseOperator,
    observed: &HashMap<u64, f64>,
    options: &CorrectionOptions,
) -> (HashMap<u64, f64>, SolveDiagnostics) {
    let keys = operator.reachable_support(observed.keys().copied(), options.support_distance);
    let n = keys.len();
    let subs: Vec<SmallVec<[usize; 8]>> =
        keys.iter().map(|key| operator.factor_subs(*key)).collect();

    let mut b = vec![0.0; n];
    for (row, key) in keys.iter().enumerate() {
        if let Some(value) = observed.get(key) {
            b[row] = *value;
        }
    }

    let fallback = |iterations: usize, residual: f64| {
        let raw: HashMap<u64, f64> = observed.clone();
        let diagnostics = SolveDiagnostics {
            iterations,
            residual,
            converged: false,
            degenerate: true,
        };
        (raw, diagnostics)
    };

    // Jacobi preconditioner from the operator diagonal.  A vanishing
    // diagonal entry does not make the operator singular (a perfect-flip
    // assignment matrix has a zero diagonal and is exactly invertible), so
    // those entries fall back to unit scaling instead of aborting.
    let mut diag = vec![0.0; n];
    for row in 0..n {
        let entry = operator.element(&subs[row], &subs[row]);
        diag[row] = if entry.abs() < BREAKDOWN_EPS { 1.0 } else { entry };
    }

    let matvec = |x: &[f64]| -> Vec<f64> {
        (0..n)
            .map(|row| {
                let mut acc = 0.0;
                for col in 0..n {
                    if x[col] != 0.0 {
                        acc += operator.element(&subs[row], &subs[col]) * x[col];
                    }
                }
                acc
            })
            .collect()
    };

    let precondition = |vector: &mut [f64]| {
        for (value, d) in vector.iter_mut().zip(diag.iter()) {
            *value /= d;
        }
    };

    let norm = |vector: &[f64]| -> f64 { vector.iter().map(|v| v * v).sum::<f64>().sqrt() };

    let mut b_scaled = b.clone();
    precondition(&mut b_scaled);
    let b_norm = norm(&b_scaled);
    if b_norm < BREAKDOWN_EPS {
        return fallback(0, f64::NAN);
    }

    // The observed vector is the natural initial guess; readout noise is a
    // perturbation of the identity.
    let x0 = b.clone();
    let mut residual0 = matvec(&x0);
    for (row, value) in residual0.iter_mut().enumerate() {
        *value = b[row] - *value;
    }
    precondition(&mut residual0);
    let beta = norm(&residual0);

    let max_iterations = options.max_iterations.min(n);
    let mut diagnostics = SolveDiagnostics {
        iterations: 0,
        residual: beta / b_norm,
        converged: beta / b_norm <= options.tol,
        degenerate: false,
    };

    let mut stalled = false;
    let solution = if diagnostics.converged {
        x0
    } else {
        // GMRES with modified Gram-Schmidt Arnoldi and Givens-rotation
        // least squares, no restarts.
        let mut basis: Vec<Vec<f64>> = Vec::with_capacity(max_iterations + 1);
        basis.push(residual0.iter().map(|v| v / beta).collect());
        let mut hessenberg = Array2::<f64>::zeros((max_iterations + 1, max_iterations));
        let mut cos = vec![0.0; max_iterations];
        let mut sin = vec![0.0; max_iterations];
        let mut g = vec![0.0; max_iterations + 1];
        g[0] = beta;
        let mut dims = 0;

        for j in 0..max_iterations {
            let mut w = matvec(&basis[j]);
            precondition(&mut w);
            for i in 0..=j {
                let h: f64 = w.iter().zip(basis[i].iter()).map(|(a, b)| a * b).sum();
                hessenberg[[i, j]] = h;
                for (value, base) in w.iter_mut().zip(basis[i].iter()) {
                    *value -= h * base;
                }
            }
            let h_next = norm(&w);
            hessenberg[[j + 1, j]] = h_next;

            // Apply the accumulated rotations, then form the new one.
            for i in 0..j {
                let upper = cos[i] * hessenberg[[i, j]] + sin[i] * hessenberg[[i + 1, j]];
                let lower = -sin[i] * hessenberg[[i, j]] + cos[i] * hessenberg[[i + 1, j]];
                hessenberg[[i, j]] = upper;
                hessenberg[[i + 1, j]] = lower;
            }
            let denom = hessenberg[[j, j]].hypot(hessenberg[[j + 1, j]]);
            if denom < BREAKDOWN_EPS {
                // No progress at all means the operator annihilates the
                // residual direction: singular to working precision.
                stalled = dims == 0;
                break;
            }
            cos[j] = hessenberg[[j, j]] / denom;
            sin[j] = hessenberg[[j + 1, j]] / denom;
            hessenberg[[j, j]] = denom;
            hessenberg[[j + 1, j]] = 0.0;
            g[j + 1] = -sin[j] * g[j];
            g[j] *= cos[j];

            dims = j + 1;
            diagnostics.iterations = dims;
            diagnostics.residual = g[j + 1].abs() / b_norm;
            if diagnostics.residual <= options.tol {
                diagnostics.converged = true;
                break;
            }
            if h_next < BREAKDOWN_EPS {
                // Happy breakdown: the Krylov space is exhausted and the
                // current least-squares solution is exact on it.
                break;
            }
            basis.push(w.into_iter().map(|value| value / h_next).collect());
        }

        // Back-substitute the triangular system and expand into the basis.
        let mut y = vec![0.0; dims];
        for i in (0..dims).rev() {
            let mut value = g[i];
            for k in (i + 1)..dims {
                value -= hessenberg[[i, k]] * y[k];
            }
            y[i] = value / hessenberg[[i, i]];
        }
        let mut x = x0;
        for (i, coeff) in y.iter().enumerate() {
            for (value, base) in x.iter_mut().zip(basis[i].iter()) {
                *value += coeff * base;
            }
        }
        x
    };

    if stalled {
        return fallback(0, beta / b_norm);
    }
    if solution.iter().any(|value| !value.is_finite()) {
        return fallback(diagnostics.iterations, diagnostics.residual);
    }
    let total: f64 = solution.iter().sum();
    if total.abs() < 1e-9 {
        return fallback(diagnostics.iterations, diagnostics.residual);
    }

    // Renormalize away the drift from truncating to the working set.
    let out = keys
        .iter()
        .zip(solution.iter())
        .filter(|(_, value)| **value != 0.0)
        .map(|(key, value)| (*key, value / total))
        .collect();
    (out, diagnostics)
}
