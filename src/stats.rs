//! Post-processing diagnostics for sampled chains: burn-in estimation (MSER),
//! integrated autocorrelation time, and the potential scale reduction factor
//! (Gelman-Rubin R-hat).
//!
//! All estimators here are pure functions over array views; they never mutate
//! the chain store. Degenerate inputs (zero-variance series, too few walkers
//! or steps) are reported as explicit errors instead of silently wrong
//! numbers.

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use num_traits::ToPrimitive;
use rustfft::{num_complex::Complex, FftPlanner};
use std::error::Error;

/**
Estimates the burn-in of a scalar chain with the Marginal Standard Error Rule.

For each candidate truncation point `d` in `dmin, dmin + dstep, ...` up to
`dmax` (negative `dmax` counts from the end of the series, i.e. `T + dmax`),
the MSER statistic

```text
MSER(d) = (1 / (T - d)^2) * sum_{i >= d} (x_i - mean(x_{d:}))^2
```

is evaluated, and the `d` minimizing it is returned: the truncation point
after which the remaining series has the smallest standard error of the mean.

A constant series returns `dmin` (no burn-in needed). If the candidate range
collapses (`dmax` at or below `dmin`), the single candidate `dmin` is
returned. Series of length 0 or 1 are an error.

# Examples

```rust
use ndarray::Array1;
use potfit_uq::stats::mser;

// A transient at 10 that settles after index 5.
let series = Array1::from_vec(vec![
    10.0, 9.0, 8.0, 4.0, 2.0, 0.1, -0.1, 0.1, -0.1, 0.1, -0.1, 0.0,
]);
let burn_in = mser(series.view(), 0, 1, -1).unwrap();
assert!(burn_in >= 4 && burn_in <= 6);
```
*/
pub fn mser(
    series: ArrayView1<f64>,
    dmin: usize,
    dstep: usize,
    dmax: isize,
) -> Result<usize, Box<dyn Error>> {
    let t = series.len();
    if t < 2 {
        return Err(format!(
            "Cannot estimate burn-in for a series of length {t}: need at least two samples."
        )
        .into());
    }
    if dstep == 0 {
        return Err("Expected a positive candidate step size.".into());
    }
    if dmin >= t {
        return Err(format!(
            "Minimum truncation point {dmin} leaves no samples in a series of length {t}."
        )
        .into());
    }

    let dmax_eff = if dmax < 0 {
        t as isize + dmax
    } else {
        dmax.min(t as isize - 1)
    };

    let mut candidates: Vec<usize> = Vec::new();
    if dmax_eff <= dmin as isize {
        // Collapsed range: only dmin remains.
        candidates.push(dmin);
    } else {
        let mut d = dmin;
        while (d as isize) < dmax_eff {
            candidates.push(d);
            d += dstep;
        }
    }

    let mut best_d = candidates[0];
    let mut best_stat = f64::INFINITY;
    for &d in &candidates {
        let tail = series.slice(s![d..]);
        let len = tail.len() as f64;
        let mean = tail.sum() / len;
        let sq_sum = tail.fold(0.0, |acc, &x| acc + (x - mean) * (x - mean));
        let stat = sq_sum / (len * len);
        // Strict inequality keeps the earliest minimizer, so a constant
        // series yields dmin.
        if stat < best_stat {
            best_stat = stat;
            best_d = d;
        }
    }
    Ok(best_d)
}

/**
Estimates the integrated autocorrelation time per parameter.

`walker_series` has shape `[L, T, N]`: `L` parallel walkers of length `T` at a
single temperature, `N` parameters. Per parameter, the normalized
autocorrelation function is computed per walker (FFT-based) and averaged
across walkers, then summed with an automatic truncation window: the running
estimate `tau[m] = 2 * sum_{k <= m} rho(k) - 1` is accepted at the first lag
`m >= c * tau[m]`.

The windowed estimator understates the true time on chains that are not many
times longer than it, so reliability is judged against a factor much larger
than the window constant: if the chain is shorter than [`TAU_TOL`] times the
estimated time for any parameter, the estimate is unreliable. With
`quiet = false` this is an error, with `quiet = true` a warning goes to
stderr and the best available estimate is still returned. The ceiling of the
largest returned value is the usual choice of thinning interval.
*/
/// Minimum chain-length-to-tau ratio for a trustworthy integrated-time
/// estimate. Kept separate from (and much larger than) the window constant
/// `c`: at a window crossing `m >= c * tau[m]` the chain is by construction
/// longer than `c * tau`, so a check against `c` alone could never fire.
pub const TAU_TOL: f64 = 50.0;

pub fn autocorr(
    walker_series: ArrayView3<f64>,
    c: f64,
    quiet: bool,
) -> Result<Array1<f64>, Box<dyn Error>> {
    let (n_walkers, n_steps, n_params) = walker_series.dim();
    if n_walkers == 0 {
        return Err("Expected at least one walker.".into());
    }
    if n_steps < 2 {
        return Err(format!(
            "Cannot estimate autocorrelation from {n_steps} step(s): need at least two."
        )
        .into());
    }
    if !(c > 0.0) {
        return Err("Expected a positive window constant c.".into());
    }

    let mut taus = Array1::<f64>::zeros(n_params);
    let mut n_unreliable = 0usize;
    for p in 0..n_params {
        // Mean ACF across walkers; each walker's ACF is normalized to 1 at
        // lag zero, so the average is as well.
        let mut acf = vec![0.0; n_steps];
        for w in 0..n_walkers {
            let series: Vec<f64> = walker_series.slice(s![w, .., p]).to_vec();
            let walker_acf = autocorr_func_1d(&series)?;
            for (a, v) in acf.iter_mut().zip(walker_acf) {
                *a += v / n_walkers as f64;
            }
        }

        // Running integrated time and its automatic window.
        let mut cumsum = 0.0;
        let mut running = vec![0.0; n_steps];
        for (m, &rho) in acf.iter().enumerate() {
            cumsum += rho;
            running[m] = 2.0 * cumsum - 1.0;
        }
        let window = auto_window(&running, c);
        let tau = running[window];
        if (n_steps as f64) < TAU_TOL * tau {
            n_unreliable += 1;
        }
        taus[p] = tau;
    }

    if n_unreliable > 0 {
        let msg = format!(
            "The chain is shorter than {TAU_TOL} times the integrated autocorrelation \
             time for {n_unreliable} parameter(s); the estimate is unreliable \
             (tau = {taus}, chain length = {n_steps})."
        );
        if quiet {
            eprintln!("WARNING: {msg}");
        } else {
            return Err(msg.into());
        }
    }
    Ok(taus)
}

/// First lag `m` satisfying `m >= c * tau[m]`, falling back to the last lag.
fn auto_window(running_taus: &[f64], c: f64) -> usize {
    running_taus
        .iter()
        .enumerate()
        .find(|(m, &tau)| *m as f64 >= c * tau)
        .map(|(m, _)| m)
        .unwrap_or(running_taus.len() - 1)
}

/// FFT-based normalized autocorrelation function of one scalar series.
fn autocorr_func_1d(x: &[f64]) -> Result<Vec<f64>, Box<dyn Error>> {
    let n = x.len();
    if x.iter().all(|&v| v == x[0]) {
        return Err(
            "Cannot compute the autocorrelation of a zero-variance (constant) series.".into(),
        );
    }
    let nfft = 2 * n.next_power_of_two();
    let mean = x.iter().sum::<f64>() / n as f64;

    let mut buf: Vec<Complex<f64>> = x.iter().map(|&v| Complex::new(v - mean, 0.0)).collect();
    buf.resize(nfft, Complex::new(0.0, 0.0));

    let mut planner = FftPlanner::<f64>::new();
    planner.plan_fft_forward(nfft).process(&mut buf);
    for v in buf.iter_mut() {
        *v = Complex::new(v.norm_sqr(), 0.0);
    }
    planner.plan_fft_inverse(nfft).process(&mut buf);

    // rustfft leaves both passes unnormalized; the factor cancels in the
    // normalization by the lag-zero value.
    let acov: Vec<f64> = buf[..n].iter().map(|v| v.re).collect();
    Ok(acov.iter().map(|&v| v / acov[0]).collect())
}

/**
Computes the potential scale reduction factor (Gelman-Rubin R-hat) per
parameter.

`samples` has shape `[L, T, N]`: post-burn-in, thinned draws of `L >= 2`
walkers over `T >= 2` steps. Per parameter, the within-chain variance `W`
(mean of per-walker sample variances) is compared against the pooled variance
estimate

```text
var_hat = (T - 1) / T * W + B / T
```

with `B` the between-chain variance (variance of per-walker means scaled by
`T`), and `R_hat = sqrt(var_hat / W)` is returned. Values near 1 indicate the
walkers have mixed; a common acceptance threshold is 1.1. A zero within-chain
variance is an explicit error.
*/
pub fn rhat(samples: ArrayView3<f64>) -> Result<Array1<f64>, Box<dyn Error>> {
    let (n_walkers, n_steps, _n_params) = samples.dim();
    if n_walkers < 2 {
        return Err(format!(
            "Cannot assess convergence across {n_walkers} walker(s): need at least two."
        )
        .into());
    }
    if n_steps < 2 {
        return Err(format!(
            "Cannot assess convergence from {n_steps} step(s): need at least two."
        )
        .into());
    }
    let t = n_steps as f64;

    // Per-walker means and sample variances, both [L, N].
    let means = samples
        .mean_axis(Axis(1))
        .ok_or("Mean reduction over steps failed.")?;
    let vars = samples.var_axis(Axis(1), 1.0);

    let within = vars
        .mean_axis(Axis(0))
        .ok_or("Mean reduction over walkers failed.")?;
    if within.iter().any(|&w| w == 0.0) {
        return Err(
            "Zero within-chain variance: the chain is degenerate for at least one parameter."
                .into(),
        );
    }

    let between = means.var_axis(Axis(0), 1.0) * t;
    let var_hat = &within * ((t - 1.0) / t) + between / t;
    Ok((var_hat / within).mapv(f64::sqrt))
}

/// Streaming R-hat accumulator fed one population snapshot at a time.
///
/// Keeps per-walker running sums so the progress display can show the current
/// maximum R-hat of the natural-temperature chain without retaining the whole
/// history.
#[derive(Debug, Clone, PartialEq)]
pub struct RhatTracker {
    n: usize,
    sum: Array2<f64>,    // n_walkers x n_params
    sum_sq: Array2<f64>, // n_walkers x n_params
    n_walkers: usize,
    n_params: usize,
}

impl RhatTracker {
    pub fn new(n_walkers: usize, n_params: usize) -> Self {
        Self {
            n: 0,
            sum: Array2::zeros((n_walkers, n_params)),
            sum_sq: Array2::zeros((n_walkers, n_params)),
            n_walkers,
            n_params,
        }
    }

    /// Accumulates one snapshot laid out as `n_walkers * n_params` values in
    /// walker-major order.
    pub fn step<T>(&mut self, x: &[T]) -> Result<(), Box<dyn Error>>
    where
        T: ToPrimitive + Clone,
    {
        let x = ArrayView2::from_shape((self.n_walkers, self.n_params), x)?
            .mapv(|v| v.to_f64().unwrap_or(f64::NAN));
        self.sum += &x;
        self.sum_sq += &x.mapv(|v| v * v);
        self.n += 1;
        Ok(())
    }

    /// R-hat per parameter over everything accumulated so far.
    pub fn all(&self) -> Result<Array1<f64>, Box<dyn Error>> {
        if self.n < 2 {
            return Err(format!(
                "Cannot assess convergence from {} step(s): need at least two.",
                self.n
            )
            .into());
        }
        let n = self.n as f64;
        let means = &self.sum / n;
        let vars = (&self.sum_sq - &(means.mapv(|m| m * m) * n)) / (n - 1.0);
        let within = vars
            .mean_axis(Axis(0))
            .ok_or("Mean reduction over walkers failed.")?;
        let between = means.var_axis(Axis(0), 1.0) * n;
        let var_hat = &within * ((n - 1.0) / n) + between / n;
        Ok((var_hat / within).mapv(f64::sqrt))
    }

    /// Largest R-hat over all parameters.
    pub fn max(&self) -> Result<f64, Box<dyn Error>> {
        let all = self.all()?;
        Ok(*all.max()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn white_noise(rng: &mut SmallRng, len: usize) -> Vec<f64> {
        (0..len).map(|_| rng.sample(StandardNormal)).collect()
    }

    #[test]
    fn mser_recovers_changepoint() {
        // Offset noise for the first 100 steps, stationary noise after.
        let mut rng = SmallRng::seed_from_u64(42);
        let mut series: Vec<f64> = white_noise(&mut rng, 600);
        for x in series.iter_mut().take(100) {
            *x += 10.0;
        }
        let series = Array1::from_vec(series);
        let d = mser(series.view(), 0, 10, -10).unwrap();
        assert!(
            (90..=110).contains(&d),
            "Expected burn-in near 100 within one step, got {d}."
        );
    }

    #[test]
    fn mser_constant_series_returns_dmin() {
        let series = Array1::from_elem(50, 1.5);
        assert_eq!(mser(series.view(), 3, 5, -1).unwrap(), 3);
    }

    #[test]
    fn mser_collapsed_range_returns_dmin() {
        let series = Array1::from_vec(vec![5.0, 4.0, 3.0, 2.0, 1.0, 0.0]);
        // dmax below dmin: single candidate.
        assert_eq!(mser(series.view(), 2, 1, 1).unwrap(), 2);
    }

    #[test]
    fn mser_rejects_short_series() {
        let series = Array1::from_vec(vec![1.0]);
        assert!(mser(series.view(), 0, 1, -1).is_err());
        assert!(mser(Array1::<f64>::zeros(0).view(), 0, 1, -1).is_err());
    }

    #[test]
    fn autocorr_white_noise_is_near_one() {
        let mut rng = SmallRng::seed_from_u64(7);
        let series = Array3::from_shape_fn((4, 4000, 2), |_| rng.sample::<f64, _>(StandardNormal));
        let taus = autocorr(series.view(), 5.0, false).unwrap();
        for &tau in taus.iter() {
            assert!(
                (tau - 1.0).abs() < 0.3,
                "Expected tau near 1 for white noise, got {tau}."
            );
        }
    }

    #[test]
    fn autocorr_ar1_matches_theory() {
        // AR(1) with rho = 0.9 has integrated time (1 + rho)/(1 - rho) = 19.
        let mut rng = SmallRng::seed_from_u64(3);
        let rho: f64 = 0.9;
        let scale = (1.0 - rho * rho).sqrt();
        let mut series = Array3::<f64>::zeros((4, 20000, 1));
        for w in 0..4 {
            let mut x = 0.0;
            for s in 0..20000 {
                x = rho * x + scale * rng.sample::<f64, _>(StandardNormal);
                series[[w, s, 0]] = x;
            }
        }
        let tau = autocorr(series.view(), 5.0, false).unwrap()[0];
        assert!(
            (10.0..30.0).contains(&tau),
            "Expected tau near 19 for AR(1) with rho 0.9, got {tau}."
        );
    }

    #[test]
    fn autocorr_short_chain_errs_unless_quiet() {
        // AR(1) with rho 0.995 has a true integrated time of 399; on a chain
        // of 200 steps the windowed estimator understates it badly, but even
        // the understated value must fail the length-to-tau reliability check.
        let mut rng = SmallRng::seed_from_u64(11);
        let rho: f64 = 0.995;
        let scale = (1.0 - rho * rho).sqrt();
        let mut series = Array3::<f64>::zeros((2, 200, 1));
        for w in 0..2 {
            let mut x = 0.0;
            for s in 0..200 {
                x = rho * x + scale * rng.sample::<f64, _>(StandardNormal);
                series[[w, s, 0]] = x;
            }
        }
        assert!(autocorr(series.view(), 5.0, false).is_err());
        let taus = autocorr(series.view(), 5.0, true).unwrap();
        assert!(taus[0] > 1.0);
        assert!(
            TAU_TOL * taus[0] > 200.0,
            "Expected the reliability check to fire for tau = {}.",
            taus[0]
        );
    }

    #[test]
    fn autocorr_rejects_constant_series() {
        let series = Array3::from_elem((2, 100, 1), 2.0);
        assert!(autocorr(series.view(), 5.0, true).is_err());
    }

    #[test]
    fn rhat_known_values() {
        // 3 walkers, 2 steps, 4 parameters.
        let mut samples = Array3::<f64>::zeros((3, 2, 4));
        let step_0 = [
            [0.0, 1.0, 0.0, 1.0],
            [1.0, 2.0, 0.0, 2.0],
            [0.0, 0.0, 0.0, 2.0],
        ];
        let step_1 = [
            [1.0, 2.0, 2.0, 0.0],
            [1.0, 1.0, 1.0, 1.0],
            [0.0, 1.0, 0.0, 0.0],
        ];
        for w in 0..3 {
            for p in 0..4 {
                samples[[w, 0, p]] = step_0[w][p];
                samples[[w, 1, p]] = step_1[w][p];
            }
        }
        let got = rhat(samples.view()).unwrap();
        let expected = array![std::f64::consts::SQRT_2, 1.08012345, 0.89442719, 0.8660254];
        for (g, e) in got.iter().zip(expected.iter()) {
            assert!(
                (g - e).abs() < 1e-7,
                "Mismatch in R-hat: got {g}, expected {e}."
            );
        }
    }

    #[test]
    fn rhat_converged_chains_near_one() {
        let mut rng = SmallRng::seed_from_u64(5);
        let samples = Array3::from_shape_fn((4, 2000, 1), |_| rng.sample::<f64, _>(StandardNormal));
        let r = rhat(samples.view()).unwrap()[0];
        assert!(
            (r - 1.0).abs() < 0.05,
            "Expected R-hat near 1 for converged chains, got {r}."
        );
    }

    #[test]
    fn rhat_separated_chains_exceed_threshold() {
        let mut rng = SmallRng::seed_from_u64(5);
        let samples = Array3::from_shape_fn((2, 500, 1), |(w, _, _)| {
            10.0 * w as f64 + 0.1 * rng.sample::<f64, _>(StandardNormal)
        });
        let r = rhat(samples.view()).unwrap()[0];
        assert!(
            r > 1.1,
            "Expected R-hat far above 1.1 for non-mixed chains, got {r}."
        );
    }

    #[test]
    fn rhat_rejects_degenerate_input() {
        let constant = Array3::from_elem((2, 10, 1), 1.0);
        assert!(rhat(constant.view()).is_err());
        let one_walker = Array3::<f64>::zeros((1, 10, 1));
        assert!(rhat(one_walker.view()).is_err());
        let one_step = Array3::<f64>::zeros((3, 1, 1));
        assert!(rhat(one_step.view()).is_err());
    }

    #[test]
    fn tracker_matches_batch_rhat() {
        let mut rng = SmallRng::seed_from_u64(9);
        let samples = Array3::from_shape_fn((3, 50, 2), |_| rng.sample::<f64, _>(StandardNormal));
        let mut tracker = RhatTracker::new(3, 2);
        for s in 0..50 {
            let snapshot: Vec<f64> = samples.slice(s![.., s, ..]).iter().copied().collect();
            tracker.step(&snapshot).unwrap();
        }
        let streaming = tracker.all().unwrap();
        let batch = rhat(samples.view()).unwrap();
        for (s, b) in streaming.iter().zip(batch.iter()) {
            assert!(
                (s - b).abs() < 1e-10,
                "Streaming and batch R-hat disagree: {s} vs {b}."
            );
        }
        assert!(tracker.max().unwrap() >= *streaming.max().unwrap() - 1e-12);
    }
}
