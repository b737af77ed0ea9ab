//! Sparse Levenberg-Marquardt.
//!
//! The Jacobian sparsity structure is fixed at construction; each iteration
//! the cost closure overwrites the residual vector and the CSR value array
//! in entry order. The damped normal equations are factored with LDL^T.
//!
//! On every accepted step a retraction callback runs so the caller can fold
//! tangent-space deltas back into manifold hosts (rotations, the gravity
//! chart) and zero the corresponding entries; the next evaluation then
//! linearizes about the freshly retracted point.

use nalgebra::{DMatrix, DVector};
use sprs::{CsMat, SymmetryCheck, TriMat};
use sprs_ldl::Ldl;

/// Why the iteration loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Relative cost change dropped below the tolerance.
    CostConverged,
    /// Relative parameter change dropped below the tolerance.
    StepConverged,
    /// Iteration cap reached without meeting a tolerance.
    MaxIterations,
    /// The `should_stop` callback asked for an early exit.
    Cancelled,
    /// Five consecutive factorization attempts failed even with escalating
    /// damping.
    NumericalFailure,
    /// The damping parameter blew past any useful range.
    Diverged,
}

/// Summary of a finished solve.
#[derive(Debug, Clone)]
pub struct SolveReport {
    pub stop: StopReason,
    /// Iterations executed (accepted or not).
    pub iterations: usize,
    pub accepted_steps: usize,
    /// Final cost, as the squared residual norm.
    pub final_cost: f64,
    /// Gradient norm of the very first linearization.
    pub initial_gradient_norm: f64,
}

impl SolveReport {
    pub fn converged(&self) -> bool {
        matches!(
            self.stop,
            StopReason::CostConverged | StopReason::StepConverged
        )
    }
}

/// Sparse Levenberg-Marquardt solver with a fixed Jacobian structure.
pub struct SparseLm {
    pub max_iterations: usize,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
    pub relative_cost_tol: f64,
    pub relative_step_tol: f64,

    jacobian: CsMat<f64>,
    residuals: DVector<f64>,
    trial_residuals: DVector<f64>,
    jtr: DVector<f64>,
}

/// Consecutive factorization failures tolerated before giving up.
const MAX_DAMPING_FAILURES: usize = 5;

/// Damping beyond this is treated as divergence.
const LAMBDA_CEILING: f64 = 1e12;

/// Squared-residual-norm floor below which iteration is pointless.
const COST_FLOOR: f64 = 1e-18;

impl SparseLm {
    /// Build a solver for a `n_rows x n_cols` Jacobian with the given
    /// sparsity `entries`, which must be sorted by `(row, col)` and free of
    /// duplicates; the cost closure writes values in exactly that order.
    pub fn new(n_rows: usize, n_cols: usize, entries: &[(usize, usize)]) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0] < w[1]));
        let mut tri = TriMat::new((n_rows, n_cols));
        for &(row, col) in entries {
            tri.add_triplet(row, col, 0.0);
        }
        Self {
            max_iterations: 100,
            initial_lambda: 1e-4,
            lambda_up: 10.0,
            lambda_down: 0.1,
            relative_cost_tol: 1e-6,
            relative_step_tol: 1e-7,
            jacobian: tri.to_csr(),
            residuals: DVector::zeros(n_rows),
            trial_residuals: DVector::zeros(n_rows),
            jtr: DVector::zeros(n_cols),
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_tolerances(mut self, relative_cost_tol: f64, relative_step_tol: f64) -> Self {
        self.relative_cost_tol = relative_cost_tol;
        self.relative_step_tol = relative_step_tol;
        self
    }

    pub fn nnz(&self) -> usize {
        self.jacobian.nnz()
    }

    /// Run the iteration loop.
    ///
    /// * `cost_fn(params, residuals, jacobian_values)` fills both output
    ///   slices at the given parameters.
    /// * `retract(params)` runs after every accepted step.
    /// * `should_stop()` is polled between iterations.
    pub fn solve<F, R, S>(
        &mut self,
        mut params: DVector<f64>,
        mut cost_fn: F,
        mut retract: R,
        mut should_stop: S,
    ) -> (DVector<f64>, SolveReport)
    where
        F: FnMut(&DVector<f64>, &mut [f64], &mut [f64]),
        R: FnMut(&mut DVector<f64>),
        S: FnMut() -> bool,
    {
        let mut lambda = self.initial_lambda;
        let mut report = SolveReport {
            stop: StopReason::MaxIterations,
            iterations: 0,
            accepted_steps: 0,
            final_cost: f64::INFINITY,
            initial_gradient_norm: 0.0,
        };
        let mut damping_failures = 0usize;

        for iteration in 0..self.max_iterations {
            if should_stop() {
                report.stop = StopReason::Cancelled;
                break;
            }
            report.iterations = iteration + 1;

            self.residuals.fill(0.0);
            cost_fn(&params, self.residuals.as_mut_slice(), self.jacobian.data_mut());
            let cost = self.residuals.norm_squared();
            report.final_cost = cost;

            // Normal equations: (J^T J + damping) step = J^T r
            let jt: CsMat<f64> = self.jacobian.clone().transpose_into();
            let jtj: CsMat<f64> = &jt * &self.jacobian;

            self.jtr.fill(0.0);
            for (res_idx, col) in jt.outer_iterator().enumerate() {
                let r = self.residuals[res_idx];
                for (param_idx, &val) in col.iter() {
                    self.jtr[param_idx] += val * r;
                }
            }
            let gradient_norm = self.jtr.norm();
            if iteration == 0 {
                report.initial_gradient_norm = gradient_norm;
            }
            if gradient_norm < 1e-12 || cost < COST_FLOOR {
                // Stationary point, or already at the floating-point noise
                // floor; a step cannot improve anything measurable.
                report.stop = StopReason::CostConverged;
                break;
            }

            let jtj_damped = add_damping(&jtj, lambda);
            let factor = Ldl::new()
                .check_symmetry(SymmetryCheck::DontCheckSymmetry)
                .numeric(jtj_damped.view());
            let factor = match factor {
                Ok(f) => f,
                Err(_) => {
                    damping_failures += 1;
                    if damping_failures >= MAX_DAMPING_FAILURES {
                        report.stop = StopReason::NumericalFailure;
                        break;
                    }
                    lambda *= self.lambda_up;
                    continue;
                }
            };
            damping_failures = 0;

            let rhs: Vec<f64> = self.jtr.iter().copied().collect();
            let step = DVector::from_vec(factor.solve(&rhs));

            let trial = &params - &step;
            self.trial_residuals.fill(0.0);
            cost_fn(&trial, self.trial_residuals.as_mut_slice(), self.jacobian.data_mut());
            let trial_cost = self.trial_residuals.norm_squared();

            if trial_cost <= cost {
                params = trial;
                retract(&mut params);
                lambda *= self.lambda_down;
                report.accepted_steps += 1;
                report.final_cost = trial_cost;

                let rel_cost = (cost - trial_cost) / cost.max(f64::MIN_POSITIVE);
                if rel_cost < self.relative_cost_tol {
                    report.stop = StopReason::CostConverged;
                    break;
                }
                let rel_step = step.norm() / params.norm().max(1.0);
                if rel_step < self.relative_step_tol {
                    report.stop = StopReason::StepConverged;
                    break;
                }
            } else {
                lambda *= self.lambda_up;
                if !lambda.is_finite() || lambda > LAMBDA_CEILING {
                    report.stop = StopReason::Diverged;
                    break;
                }
            }
        }

        (params, report)
    }

    /// Re-evaluate residuals and Jacobian at `params` (after a solve, for
    /// covariance extraction and residual statistics).
    pub fn refresh<F>(&mut self, params: &DVector<f64>, cost_fn: &mut F)
    where
        F: FnMut(&DVector<f64>, &mut [f64], &mut [f64]),
    {
        self.residuals.fill(0.0);
        cost_fn(params, self.residuals.as_mut_slice(), self.jacobian.data_mut());
    }

    /// Residual vector from the last `refresh`/iteration.
    pub fn residuals(&self) -> &DVector<f64> {
        &self.residuals
    }

    /// Undamped `J^T J` at the last evaluated point.
    pub fn normal_matrix(&self) -> CsMat<f64> {
        let jt: CsMat<f64> = self.jacobian.clone().transpose_into();
        &jt * &self.jacobian
    }
}

/// `JtJ[i,i] += lambda * max(JtJ[i,i], 1)`, rebuilt in CSC form for the
/// factorization.
fn add_damping(jtj: &CsMat<f64>, lambda: f64) -> CsMat<f64> {
    let n = jtj.cols();
    let mut tri = TriMat::new((n, n));
    for (value, (row, col)) in jtj.iter() {
        let mut v = *value;
        if row == col {
            v += lambda * v.max(1.0);
        }
        tri.add_triplet(row, col, v);
    }
    tri.to_csc()
}

/// Extract diagonal blocks of `(J^T J)^-1` by factoring once and solving
/// unit vectors. `blocks` are `(start, dim)` column ranges. Returns `None`
/// when the matrix cannot be factored.
pub fn inverse_blocks(jtj: &CsMat<f64>, blocks: &[(usize, usize)]) -> Option<Vec<DMatrix<f64>>> {
    let n = jtj.cols();
    let factor = Ldl::new()
        .check_symmetry(SymmetryCheck::DontCheckSymmetry)
        .numeric(jtj.view())
        .ok()?;

    let mut out = Vec::with_capacity(blocks.len());
    for &(start, dim) in blocks {
        let mut block = DMatrix::zeros(dim, dim);
        for j in 0..dim {
            let mut unit = vec![0.0; n];
            unit[start + j] = 1.0;
            let column = factor.solve(&unit);
            for i in 0..dim {
                block[(i, j)] = column[start + i];
            }
        }
        // Symmetrize away factorization round-off.
        let block = 0.5 * (&block + block.transpose());
        out.push(block);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fit y = a x + b on a dense-in-two-columns sparse structure.
    fn line_fit_entries(n: usize) -> Vec<(usize, usize)> {
        (0..n).flat_map(|i| [(i, 0), (i, 1)]).collect()
    }

    #[test]
    fn recovers_line_parameters() {
        let data = [(1.0f64, 3.0), (2.0, 5.0), (3.0, 7.0), (4.0, 9.0)];
        let entries = line_fit_entries(data.len());
        let mut solver = SparseLm::new(data.len(), 2, &entries);

        let cost = |params: &DVector<f64>, residuals: &mut [f64], jac: &mut [f64]| {
            for (i, &(x, y)) in data.iter().enumerate() {
                residuals[i] = params[0] * x + params[1] - y;
                jac[2 * i] = x;
                jac[2 * i + 1] = 1.0;
            }
        };

        let (params, report) =
            solver.solve(DVector::zeros(2), cost, |_| {}, || false);
        assert!(report.converged(), "stop = {:?}", report.stop);
        assert!((params[0] - 2.0).abs() < 1e-8);
        assert!((params[1] - 1.0).abs() < 1e-8);
    }

    #[test]
    fn zero_residual_start_converges_immediately() {
        let data = [(1.0f64, 2.0), (2.0, 4.0), (3.0, 6.0)];
        let entries = line_fit_entries(data.len());
        let mut solver = SparseLm::new(data.len(), 2, &entries);

        let cost = |params: &DVector<f64>, residuals: &mut [f64], jac: &mut [f64]| {
            for (i, &(x, y)) in data.iter().enumerate() {
                residuals[i] = params[0] * x + params[1] - y;
                jac[2 * i] = x;
                jac[2 * i + 1] = 1.0;
            }
        };

        let start = DVector::from_vec(vec![2.0, 0.0]);
        let (_, report) = solver.solve(start, cost, |_| {}, || false);
        assert_eq!(report.stop, StopReason::CostConverged);
        assert!(report.iterations <= 2);
        assert!(report.initial_gradient_norm < 1e-10);
    }

    #[test]
    fn cancellation_returns_current_best() {
        let data = [(1.0f64, 3.0), (2.0, 5.0), (3.0, 7.0)];
        let entries = line_fit_entries(data.len());
        let mut solver = SparseLm::new(data.len(), 2, &entries);

        let cost = |params: &DVector<f64>, residuals: &mut [f64], jac: &mut [f64]| {
            for (i, &(x, y)) in data.iter().enumerate() {
                residuals[i] = params[0] * x + params[1] - y;
                jac[2 * i] = x;
                jac[2 * i + 1] = 1.0;
            }
        };

        let (_, report) = solver.solve(DVector::zeros(2), cost, |_| {}, || true);
        assert_eq!(report.stop, StopReason::Cancelled);
        assert_eq!(report.iterations, 0);
    }

    #[test]
    fn retraction_runs_on_accepted_steps() {
        let data = [(1.0f64, 3.0), (2.0, 5.0), (3.0, 7.0)];
        let entries = line_fit_entries(data.len());
        let mut solver = SparseLm::new(data.len(), 2, &entries);

        let cost = |params: &DVector<f64>, residuals: &mut [f64], jac: &mut [f64]| {
            for (i, &(x, y)) in data.iter().enumerate() {
                residuals[i] = params[0] * x + params[1] - y;
                jac[2 * i] = x;
                jac[2 * i + 1] = 1.0;
            }
        };

        let mut retractions = 0usize;
        let (_, report) = solver.solve(
            DVector::zeros(2),
            cost,
            |_params| retractions += 1,
            || false,
        );
        assert_eq!(retractions, report.accepted_steps);
        assert!(retractions > 0);
    }

    #[test]
    fn inverse_blocks_match_dense_inverse() {
        // J = [[2, 0], [0, 3], [1, 1]] => JtJ = [[5, 1], [1, 10]]
        let entries = vec![(0usize, 0usize), (1, 1), (2, 0), (2, 1)];
        let mut solver = SparseLm::new(3, 2, &entries);

        let mut cost = |_p: &DVector<f64>, residuals: &mut [f64], jac: &mut [f64]| {
            residuals.fill(0.0);
            jac[0] = 2.0;
            jac[1] = 3.0;
            jac[2] = 1.0;
            jac[3] = 1.0;
        };
        solver.refresh(&DVector::zeros(2), &mut cost);
        let jtj = solver.normal_matrix();

        let blocks = inverse_blocks(&jtj, &[(0, 2)]).unwrap();
        let dense = nalgebra::Matrix2::new(5.0, 1.0, 1.0, 10.0)
            .try_inverse()
            .unwrap();
        assert!((blocks[0][(0, 0)] - dense[(0, 0)]).abs() < 1e-12);
        assert!((blocks[0][(0, 1)] - dense[(0, 1)]).abs() < 1e-12);
        assert!((blocks[0][(1, 1)] - dense[(1, 1)]).abs() < 1e-12);
    }
}
