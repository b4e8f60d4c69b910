//! Solving the technology matrix for scaling factors
//!
//! Small or dense systems are factorized with a dense LU decomposition; large
//! sparse systems are solved iteratively with a Jacobi-preconditioned
//! BiCGSTAB that checks an abort flag between iterations. Singular systems
//! and non-convergence are reported as [`CalcError::Unsolvable`].

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CalcError, Result};
use crate::matrix::Matrix;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Systems up to this size are always solved densely.
    pub dense_threshold: usize,
    /// Systems with a larger share of non-zeros are solved densely.
    pub dense_density: f64,
    /// Relative residual at which the iterative solver stops.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Pivots below this share of the largest matrix entry count as zero.
    pub singularity_tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            dense_threshold: 1000,
            dense_density: 0.1,
            tolerance: 1e-12,
            max_iterations: 10_000,
            singularity_tolerance: 1e-14,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LinearSolver {
    options: SolverOptions,
}

impl LinearSolver {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn solve(&self, a: &Matrix, b: &[f64]) -> Result<Vec<f64>> {
        self.solve_with_abort(a, b, &|| false)
    }

    /// Solves `a * x = b`; `abort` is polled between iterations of the
    /// iterative solver.
    pub fn solve_with_abort(&self, a: &Matrix, b: &[f64], abort: &dyn Fn() -> bool) -> Result<Vec<f64>> {
        let n = a.rows();
        if a.cols() != n {
            return Err(CalcError::InvalidInput(format!(
                "the technology matrix must be square but is {}x{}",
                n,
                a.cols()
            )));
        }
        if b.len() != n {
            return Err(CalcError::DimensionMismatch { expected: n, actual: b.len() });
        }
        if n == 0 {
            return Ok(Vec::new());
        }

        let dense = n <= self.options.dense_threshold || a.density() > self.options.dense_density;
        debug!(size = n, dense, "solving linear system");
        let x = if dense {
            self.solve_dense(a, b)?
        } else {
            self.solve_iterative(a, b, abort)?
        };

        if x.iter().any(|v| !v.is_finite()) {
            return Err(unsolvable(n, "the solution contains non-finite values"));
        }
        Ok(x)
    }

    fn solve_dense(&self, a: &Matrix, b: &[f64]) -> Result<Vec<f64>> {
        let n = a.rows();
        let m = a.to_dense();
        let max = m.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
        if max == 0.0 {
            return Err(unsolvable(n, "the matrix is zero"));
        }

        let lu = m.lu();
        let threshold = self.options.singularity_tolerance * max;
        let u = lu.u();
        if let Some(i) = (0..n).find(|i| u[(*i, *i)].abs() <= threshold) {
            return Err(unsolvable(n, &format!("zero pivot in row {}", i)));
        }

        let rhs = DVector::from_column_slice(b);
        match lu.solve(&rhs) {
            Some(x) => Ok(x.iter().copied().collect()),
            None => Err(unsolvable(n, "the LU decomposition is singular")),
        }
    }

    fn solve_iterative(&self, a: &Matrix, b: &[f64], abort: &dyn Fn() -> bool) -> Result<Vec<f64>> {
        let n = a.rows();
        let diagonal = a.diagonal();
        if let Some(i) = diagonal.iter().position(|d| *d == 0.0) {
            return Err(unsolvable(n, &format!("zero diagonal entry in row {}", i)));
        }
        let precondition = |v: &[f64]| -> Vec<f64> {
            v.iter().zip(&diagonal).map(|(x, d)| x / d).collect()
        };

        let b_norm = norm(b);
        if b_norm == 0.0 {
            return Ok(vec![0.0; n]);
        }
        let limit = self.options.tolerance * b_norm;

        let mut x = vec![0.0; n];
        let mut r = b.to_vec();
        let r_hat = r.clone();
        let mut p = vec![0.0; n];
        let mut v = vec![0.0; n];
        let (mut rho_prev, mut alpha, mut omega) = (1.0, 1.0, 1.0);

        for iteration in 0..self.options.max_iterations {
            if abort() {
                return Err(CalcError::Aborted);
            }

            let rho = dot(&r_hat, &r);
            if rho == 0.0 || omega == 0.0 {
                return Err(unsolvable(n, "BiCGSTAB breakdown"));
            }
            let beta = (rho / rho_prev) * (alpha / omega);
            for i in 0..n {
                p[i] = r[i] + beta * (p[i] - omega * v[i]);
            }

            let y = precondition(&p);
            v = a.multiply(&y)?;
            let r_hat_v = dot(&r_hat, &v);
            if r_hat_v == 0.0 {
                return Err(unsolvable(n, "BiCGSTAB breakdown"));
            }
            alpha = rho / r_hat_v;

            let s: Vec<f64> = (0..n).map(|i| r[i] - alpha * v[i]).collect();
            if norm(&s) <= limit {
                for i in 0..n {
                    x[i] += alpha * y[i];
                }
                debug!(iterations = iteration + 1, "iterative solver converged");
                return Ok(x);
            }

            let z = precondition(&s);
            let t = a.multiply(&z)?;
            let t_t = dot(&t, &t);
            if t_t == 0.0 {
                return Err(unsolvable(n, "BiCGSTAB breakdown"));
            }
            omega = dot(&t, &s) / t_t;
            for i in 0..n {
                x[i] += alpha * y[i] + omega * z[i];
                r[i] = s[i] - omega * t[i];
            }
            if norm(&r) <= limit {
                debug!(iterations = iteration + 1, "iterative solver converged");
                return Ok(x);
            }
            rho_prev = rho;
        }

        Err(unsolvable(
            n,
            &format!("no convergence after {} iterations", self.options.max_iterations),
        ))
    }
}

fn unsolvable(size: usize, reason: &str) -> CalcError {
    CalcError::Unsolvable { size, reason: reason.to_string() }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(v: &[f64]) -> f64 {
    dot(v, v).sqrt()
}
