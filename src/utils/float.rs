/// Numerically stable `ln(sum(exp(x_i)))` over a slice.
///
/// Returns `-inf` for an empty slice (the log of an empty sum).
pub fn log_sum_exp(values: &[f64]) -> f64 {
  let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
  if !max.is_finite() {
    return max;
  }
  let sum: f64 = values.iter().map(|x| (x - max).exp()).sum();
  max + sum.ln()
}
