use crate::make_error;
use eyre::Report;
use nalgebra::DMatrix;
use ndarray::prelude::*;
use num_traits::clamp_min;

/// Produces transition probability matrices for the branch above a node.
///
/// Matrices are written in padded row-major layout: `(n_states + 1)²` entries per rate
/// category, where the extra row and column belong to the reserved "unknown" state and are
/// all ones. The padding lets the engine's inner loops index an unknown child state like any
/// other, yielding a partial value of 1 without a branch.
pub trait SubstitutionModel: Send + Sync {
  fn n_states(&self) -> usize;

  /// Equilibrium state frequencies
  fn frequencies(&self) -> &Array1<f64>;

  /// Write the padded transition probability matrix for a branch spanning
  /// `parent_height - node_height` units of time, evolving at `rate`.
  fn transition_probabilities(
    &self,
    parent_height: f64,
    node_height: f64,
    rate: f64,
    out: &mut [f64],
  ) -> Result<(), Report>;

  fn padded_matrix_len(&self) -> usize {
    (self.n_states() + 1) * (self.n_states() + 1)
  }
}

/// General time-reversible substitution model, evaluated through the eigendecomposition of
/// the symmetrized rate matrix.
///
/// The rate matrix `Q_ij = W_ij·π_j` (symmetric exchangeabilities `W`, equilibrium
/// frequencies `π`) is normalized to unit average substitution rate, so branch durations are
/// measured in expected substitutions per site. `D^{1/2}·Q·D^{-1/2}` with `D = diag(π)` is
/// symmetric, which keeps the eigenproblem real and well-conditioned.
#[derive(Clone, Debug)]
pub struct EigenModel {
  freqs: Array1<f64>,
  eigvals: Array1<f64>,
  v: Array2<f64>,
  v_inv: Array2<f64>,
}

impl EigenModel {
  pub fn general(W: &Array2<f64>, pi: &Array1<f64>) -> Result<Self, Report> {
    let n = pi.len();
    if n < 2 {
      return make_error!("When building substitution model: at least 2 states are required");
    }
    if W.shape() != [n, n] {
      return make_error!(
        "When building substitution model: exchangeability matrix shape {:?} does not match {n} states",
        W.shape()
      );
    }
    if pi.iter().any(|&p| p <= 0.0) {
      return make_error!("When building substitution model: equilibrium frequencies must be positive, got {pi}");
    }

    let W = {
      let mut W = 0.5 * (&W.view() + &W.t());
      W.diag_mut().fill(0.0);
      W
    };

    let pi = {
      let pi_sum = pi.sum();
      pi / pi_sum
    };

    // Normalize to one expected substitution per unit time
    let average_rate = pi.dot(&W.dot(&pi));
    if average_rate <= 0.0 {
      return make_error!("When building substitution model: exchangeability matrix has zero average rate");
    }
    let W = W / average_rate;

    let sqrt_pi = pi.mapv(f64::sqrt);
    let mut sym_q = Array2::from_shape_fn((n, n), |(i, j)| W[[i, j]] * sqrt_pi[i] * sqrt_pi[j]);
    let diag = -(&W * &pi).sum_axis(Axis(1));
    sym_q.diag_mut().assign(&diag);

    let eig = DMatrix::from_fn(n, n, |i, j| sym_q[[i, j]]).symmetric_eigen();

    let mut v = Array2::<f64>::zeros((n, n));
    let mut v_inv = Array2::<f64>::zeros((n, n));
    for k in 0..n {
      for i in 0..n {
        v[[i, k]] = eig.eigenvectors[(i, k)] / sqrt_pi[i];
        v_inv[[k, i]] = eig.eigenvectors[(i, k)] * sqrt_pi[i];
      }
    }
    let eigvals = Array1::from_iter(eig.eigenvalues.iter().copied());

    Ok(Self {
      freqs: pi,
      eigvals,
      v,
      v_inv,
    })
  }

  /// Jukes-Cantor model: uniform frequencies, all exchangeabilities equal
  pub fn jc69(n_states: usize) -> Result<Self, Report> {
    let W = Array2::ones((n_states, n_states));
    let pi = Array1::from_elem(n_states, 1.0 / n_states as f64);
    Self::general(&W, &pi)
  }

  /// HKY85 model: transitions (A↔G, C↔T) evolve `kappa` times faster than transversions
  pub fn hky(kappa: f64, pi: &Array1<f64>) -> Result<Self, Report> {
    if pi.len() != 4 {
      return make_error!("When building HKY model: expected 4 nucleotide frequencies, got {}", pi.len());
    }
    if kappa <= 0.0 {
      return make_error!("When building HKY model: kappa must be positive, got {kappa}");
    }
    #[rustfmt::skip]
    let W = array![
      [0.0,   1.0,   kappa, 1.0  ],
      [1.0,   0.0,   1.0,   kappa],
      [kappa, 1.0,   0.0,   1.0  ],
      [1.0,   kappa, 1.0,   0.0  ],
    ];
    Self::general(&W, pi)
  }

  /// GTR model with exchangeabilities in the order (AC, AG, AT, CG, CT, GT)
  pub fn gtr(rates: &[f64; 6], pi: &Array1<f64>) -> Result<Self, Report> {
    if pi.len() != 4 {
      return make_error!("When building GTR model: expected 4 nucleotide frequencies, got {}", pi.len());
    }
    if rates.iter().any(|&r| r <= 0.0) {
      return make_error!("When building GTR model: exchangeabilities must be positive, got {rates:?}");
    }
    let [ac, ag, at, cg, ct, gt] = *rates;
    #[rustfmt::skip]
    let W = array![
      [0.0, ac,  ag,  at ],
      [ac,  0.0, cg,  ct ],
      [ag,  cg,  0.0, gt ],
      [at,  ct,  gt,  0.0],
    ];
    Self::general(&W, pi)
  }

  /// Unpadded transition probability matrix after time `t`
  pub fn probability_matrix(&self, t: f64) -> Array2<f64> {
    let n = self.freqs.len();
    let e = self.eigvals.mapv(|lambda| (lambda * t).exp());
    Array2::from_shape_fn((n, n), |(i, j)| {
      let p: f64 = (0..n).map(|k| self.v[[i, k]] * e[k] * self.v_inv[[k, j]]).sum();
      clamp_min(p, 0.0)
    })
  }
}

impl SubstitutionModel for EigenModel {
  fn n_states(&self) -> usize {
    self.freqs.len()
  }

  fn frequencies(&self) -> &Array1<f64> {
    &self.freqs
  }

  fn transition_probabilities(
    &self,
    parent_height: f64,
    node_height: f64,
    rate: f64,
    out: &mut [f64],
  ) -> Result<(), Report> {
    let n = self.freqs.len();
    let padded = n + 1;
    if out.len() != padded * padded {
      return make_error!(
        "When computing transition probabilities: output buffer holds {} entries, expected {}",
        out.len(),
        padded * padded
      );
    }

    let t = (parent_height - node_height) * rate;
    if !t.is_finite() || t < 0.0 {
      return make_error!(
        "When computing transition probabilities: invalid branch duration {t} (parent height {parent_height}, node height {node_height}, rate {rate})"
      );
    }

    let e = self.eigvals.mapv(|lambda| (lambda * t).exp());
    for i in 0..n {
      let row = &mut out[i * padded..(i + 1) * padded];
      for (j, entry) in row[..n].iter_mut().enumerate() {
        let p: f64 = (0..n).map(|k| self.v[[i, k]] * e[k] * self.v_inv[[k, j]]).sum();
        *entry = clamp_min(p, 0.0);
      }
      row[n] = 1.0;
    }
    out[n * padded..].fill(1.0);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::{assert_abs_diff_eq, assert_ulps_eq};
  use ndarray::array;
  use rstest::rstest;

  fn nuc_freqs() -> Array1<f64> {
    array![0.3, 0.25, 0.2, 0.25]
  }

  #[test]
  fn jc69_matches_closed_form() {
    let model = EigenModel::jc69(4).unwrap();
    let t = 0.3;
    let p = model.probability_matrix(t);
    let same = 0.25 + 0.75 * (-4.0 * t / 3.0).exp();
    let diff = 0.25 - 0.25 * (-4.0 * t / 3.0).exp();
    for i in 0..4 {
      for j in 0..4 {
        let expected = if i == j { same } else { diff };
        assert_abs_diff_eq!(p[[i, j]], expected, epsilon = 1e-12);
      }
    }
  }

  #[rstest]
  #[case::hky(EigenModel::hky(29.739445, &nuc_freqs()).unwrap())]
  #[case::gtr(EigenModel::gtr(&[0.5, 2.0, 0.3, 0.4, 2.5, 1.0], &nuc_freqs()).unwrap())]
  fn rows_sum_to_one_and_balance_in_detail(#[case] model: EigenModel) {
    let p = model.probability_matrix(0.7);
    let pi = model.frequencies();
    for i in 0..4 {
      assert_abs_diff_eq!(p.row(i).sum(), 1.0, epsilon = 1e-12);
      for j in 0..4 {
        // Reversibility: pi_i P_ij == pi_j P_ji
        assert_abs_diff_eq!(pi[i] * p[[i, j]], pi[j] * p[[j, i]], epsilon = 1e-12);
      }
    }
  }

  #[test]
  fn zero_time_is_identity_and_long_time_is_equilibrium() {
    let model = EigenModel::hky(2.0, &nuc_freqs()).unwrap();
    let identity = model.probability_matrix(0.0);
    assert_ulps_eq!(identity, Array2::eye(4), epsilon = 1e-12);

    let equilibrium = model.probability_matrix(1000.0);
    for i in 0..4 {
      for j in 0..4 {
        assert_abs_diff_eq!(equilibrium[[i, j]], model.frequencies()[j], epsilon = 1e-10);
      }
    }
  }

  #[test]
  fn average_rate_is_normalized_to_one() {
    let model = EigenModel::gtr(&[1.0, 4.0, 0.7, 0.2, 5.0, 1.3], &nuc_freqs()).unwrap();
    let dt = 1e-7;
    let p = model.probability_matrix(dt);
    let pi = model.frequencies();
    let rate: f64 = (0..4).map(|i| pi[i] * (1.0 - p[[i, i]]) / dt).sum();
    assert_abs_diff_eq!(rate, 1.0, epsilon = 1e-5);
  }

  #[test]
  fn padded_matrix_carries_unit_sentinel_row_and_column() {
    let model = EigenModel::jc69(4).unwrap();
    let mut out = vec![0.0; model.padded_matrix_len()];
    model.transition_probabilities(1.2, 0.3, 1.0, &mut out).unwrap();
    let p = model.probability_matrix(0.9);
    for i in 0..4 {
      for j in 0..4 {
        assert_ulps_eq!(out[i * 5 + j], p[[i, j]], max_ulps = 4);
      }
      assert_eq!(out[i * 5 + 4], 1.0);
    }
    assert_eq!(&out[20..25], &[1.0; 5]);
  }

  #[test]
  fn negative_branch_duration_is_an_error() {
    let model = EigenModel::jc69(4).unwrap();
    let mut out = vec![0.0; model.padded_matrix_len()];
    assert!(model.transition_probabilities(0.3, 1.2, 1.0, &mut out).is_err());
  }

  #[test]
  fn rejects_bad_configurations() {
    assert!(EigenModel::hky(2.0, &array![0.5, 0.5]).is_err());
    assert!(EigenModel::hky(-1.0, &nuc_freqs()).is_err());
    assert!(EigenModel::general(&Array2::ones((4, 4)), &array![0.5, 0.5, 0.0, 0.0]).is_err());
  }
}
