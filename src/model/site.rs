use crate::{make_error, make_report};
use eyre::Report;
use itertools::Itertools;
use smart_default::SmartDefault;
use statrs::distribution::{ContinuousCDF, Gamma};

#[derive(Clone, Debug, SmartDefault)]
pub struct SiteModelParams {
  /// Number of discrete gamma rate categories
  #[default = 1]
  pub gamma_category_count: usize,

  /// Shape of the gamma rate distribution; required when more than one category is used
  pub gamma_shape: Option<f64>,

  /// Fraction of sites that never change state
  #[default = 0.0]
  pub proportion_invariant: f64,
}

/// Among-site rate heterogeneity: a discrete gamma mixture plus an optional invariant
/// fraction.
///
/// Gamma categories are the distribution medians at equal-probability quantiles, normalized
/// so that `sum(proportion_i * rate_i) == 1`. The invariant fraction is folded in by scaling
/// category proportions by `1 - p_inv` and rates by `1 / (1 - p_inv)`; the invariant class
/// itself enters the likelihood at the root, as an additive term on the constant patterns.
#[derive(Clone, Debug)]
pub struct SiteModel {
  rates: Vec<f64>,
  proportions: Vec<f64>,
  proportion_invariant: f64,
}

impl SiteModel {
  pub fn new(params: &SiteModelParams) -> Result<Self, Report> {
    let k = params.gamma_category_count;
    let p_inv = params.proportion_invariant;

    if k < 1 {
      return make_error!("When building site model: at least one rate category is required");
    }
    if !(0.0..1.0).contains(&p_inv) {
      return make_error!("When building site model: proportion of invariant sites must be in [0, 1), got {p_inv}");
    }
    if let Some(shape) = params.gamma_shape {
      if shape <= 0.0 {
        return make_error!("When building site model: gamma shape must be positive, got {shape}");
      }
    }

    let mut rates = match params.gamma_shape {
      Some(shape) if k > 1 => {
        // Shape == rate parameterization has mean 1; category medians are then renormalized
        // to keep the discretized mean at exactly 1.
        let gamma = Gamma::new(shape, shape).map_err(|e| make_report!("When building site model: {e}"))?;
        let medians = (0..k)
          .map(|i| gamma.inverse_cdf((2 * i + 1) as f64 / (2 * k) as f64))
          .collect_vec();
        let mean = medians.iter().sum::<f64>() / k as f64;
        medians.into_iter().map(|q| q / mean).collect_vec()
      }
      None if k > 1 => {
        return make_error!("When building site model: {k} gamma categories require a gamma shape");
      }
      _ => vec![1.0; k],
    };

    for rate in &mut rates {
      *rate /= 1.0 - p_inv;
    }
    let proportions = vec![(1.0 - p_inv) / k as f64; k];

    Ok(Self {
      rates,
      proportions,
      proportion_invariant: p_inv,
    })
  }

  /// A single category of unit rate (no heterogeneity)
  pub fn single_category() -> Self {
    Self {
      rates: vec![1.0],
      proportions: vec![1.0],
      proportion_invariant: 0.0,
    }
  }

  #[inline]
  pub fn category_count(&self) -> usize {
    self.rates.len()
  }

  #[inline]
  pub fn category_rates(&self) -> &[f64] {
    &self.rates
  }

  #[inline]
  pub fn category_proportions(&self) -> &[f64] {
    &self.proportions
  }

  #[inline]
  pub const fn proportion_invariant(&self) -> f64 {
    self.proportion_invariant
  }
}

/// Strict molecular clock: every branch evolves at the same rate
#[derive(Clone, Copy, Debug)]
pub struct StrictClock {
  rate: f64,
}

impl StrictClock {
  pub fn new(rate: f64) -> Result<Self, Report> {
    if !(rate > 0.0 && rate.is_finite()) {
      return make_error!("When building clock model: rate must be positive and finite, got {rate}");
    }
    Ok(Self { rate })
  }

  #[inline]
  pub const fn rate_for_branch(&self, _node: usize) -> f64 {
    self.rate
  }
}

impl Default for StrictClock {
  fn default() -> Self {
    Self { rate: 1.0 }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;

  #[test]
  fn default_is_a_single_unit_category() {
    let model = SiteModel::new(&SiteModelParams::default()).unwrap();
    assert_eq!(model.category_count(), 1);
    assert_eq!(model.category_rates(), &[1.0]);
    assert_eq!(model.category_proportions(), &[1.0]);
  }

  #[test]
  fn gamma_categories_are_increasing_with_unit_mean() {
    let model = SiteModel::new(&SiteModelParams {
      gamma_category_count: 4,
      gamma_shape: Some(0.5),
      ..SiteModelParams::default()
    })
    .unwrap();

    let rates = model.category_rates();
    assert!(rates.windows(2).all(|w| w[0] < w[1]));

    let mean: f64 = rates
      .iter()
      .zip(model.category_proportions())
      .map(|(r, p)| r * p)
      .sum();
    assert_abs_diff_eq!(mean, 1.0, epsilon = 1e-12);
  }

  #[test]
  fn invariant_fraction_rescales_rates_and_proportions() {
    let model = SiteModel::new(&SiteModelParams {
      gamma_category_count: 4,
      gamma_shape: Some(0.5),
      proportion_invariant: 0.5,
    })
    .unwrap();

    let total: f64 = model.category_proportions().iter().sum();
    assert_abs_diff_eq!(total, 0.5, epsilon = 1e-12);

    // Overall mean rate including the zero-rate invariant class stays one.
    let mean: f64 = model
      .category_rates()
      .iter()
      .zip(model.category_proportions())
      .map(|(r, p)| r * p)
      .sum();
    assert_abs_diff_eq!(mean, 1.0, epsilon = 1e-12);
  }

  #[test]
  fn rejects_bad_parameters() {
    assert!(SiteModel::new(&SiteModelParams {
      gamma_category_count: 0,
      ..SiteModelParams::default()
    })
    .is_err());
    assert!(SiteModel::new(&SiteModelParams {
      gamma_category_count: 4,
      gamma_shape: None,
      ..SiteModelParams::default()
    })
    .is_err());
    assert!(SiteModel::new(&SiteModelParams {
      gamma_category_count: 4,
      gamma_shape: Some(-1.0),
      ..SiteModelParams::default()
    })
    .is_err());
    assert!(SiteModel::new(&SiteModelParams {
      proportion_invariant: 1.0,
      ..SiteModelParams::default()
    })
    .is_err());
    assert!(StrictClock::new(0.0).is_err());
  }
}
