//! The chain store: the time series of sampled parameter vectors and their
//! tempered log-posteriors, indexed by (temperature, walker, step, parameter).
//!
//! The store is owned and mutated exclusively by the sampler while a run is in
//! progress; callers get read-only views once the run finishes. A snapshot is
//! written only after the full iteration (both half-steps and all swap
//! attempts) has committed, so no partially-written iteration is ever visible.

use ndarray::prelude::*;
use std::error::Error;

/// Accumulated samples of one sampling run.
///
/// Samples have shape `[K, L, T, N]` (temperature, walker, step, parameter)
/// and log-posteriors shape `[K, L, T]`. Storage is preallocated for the
/// requested number of iterations; `recorded` tracks how many steps have
/// actually been committed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainStore {
    samples: Array4<f64>,
    log_probs: Array3<f64>,
    recorded: usize,
}

impl ChainStore {
    pub(crate) fn new(
        n_temps: usize,
        n_walkers: usize,
        n_steps: usize,
        n_params: usize,
    ) -> Self {
        Self {
            samples: Array4::zeros((n_temps, n_walkers, n_steps, n_params)),
            log_probs: Array3::zeros((n_temps, n_walkers, n_steps)),
            recorded: 0,
        }
    }

    /// Appends one full population snapshot.
    ///
    /// `positions` has shape `[K, L, N]` and `log_probs` shape `[K, L]`
    /// (tempered log-posterior per walker). The step counter advances only
    /// after every value has been written.
    pub(crate) fn record(&mut self, positions: ArrayView3<f64>, log_probs: ArrayView2<f64>) {
        let step = self.recorded;
        assert!(step < self.samples.shape()[2], "Chain store is full.");
        self.samples
            .slice_mut(s![.., .., step, ..])
            .assign(&positions);
        self.log_probs.slice_mut(s![.., .., step]).assign(&log_probs);
        self.recorded = step + 1;
    }

    /// The recorded samples, shape `[K, L, T, N]`.
    pub fn samples(&self) -> ArrayView4<f64> {
        self.samples.slice(s![.., .., ..self.recorded, ..])
    }

    /// The recorded tempered log-posteriors, shape `[K, L, T]`.
    pub fn log_probs(&self) -> ArrayView3<f64> {
        self.log_probs.slice(s![.., .., ..self.recorded])
    }

    /// The scalar time series for one (temperature, walker, parameter).
    pub fn series(&self, temp: usize, walker: usize, param: usize) -> ArrayView1<f64> {
        self.samples.slice(s![temp, walker, ..self.recorded, param])
    }

    /// The multi-walker series of one temperature, shape `[L, T, N]`, as
    /// expected by the autocorrelation estimator.
    pub fn walker_series(&self, temp: usize) -> ArrayView3<f64> {
        self.samples.slice(s![temp, .., ..self.recorded, ..])
    }

    /// Post-burn-in, thinned samples of one temperature, shape `[L, T', N]`.
    pub fn thinned(
        &self,
        temp: usize,
        burn_in: usize,
        thin: usize,
    ) -> Result<Array3<f64>, Box<dyn Error>> {
        if thin == 0 {
            return Err("Expected a thinning interval of at least 1.".into());
        }
        if burn_in >= self.recorded {
            return Err(format!(
                "Burn-in of {} discards the entire chain of length {}.",
                burn_in, self.recorded
            )
            .into());
        }
        Ok(self
            .samples
            .slice(s![temp, .., burn_in..self.recorded;thin, ..])
            .to_owned())
    }

    pub fn n_temps(&self) -> usize {
        self.samples.shape()[0]
    }

    pub fn n_walkers(&self) -> usize {
        self.samples.shape()[1]
    }

    /// The number of committed steps `T`.
    pub fn n_steps(&self) -> usize {
        self.recorded
    }

    pub fn n_params(&self) -> usize {
        self.samples.shape()[3]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_store() -> ChainStore {
        // 2 temps, 2 walkers, 4 steps, 1 param; sample value encodes (t, w, s).
        let mut store = ChainStore::new(2, 2, 4, 1);
        for step in 0..4 {
            let positions = Array3::from_shape_fn((2, 2, 1), |(t, w, _)| {
                100.0 * t as f64 + 10.0 * w as f64 + step as f64
            });
            let log_probs = Array2::from_elem((2, 2), -(step as f64));
            store.record(positions.view(), log_probs.view());
        }
        store
    }

    #[test]
    fn record_advances_step_dimension() {
        let store = toy_store();
        assert_eq!(store.n_steps(), 4);
        assert_eq!(store.samples().shape(), &[2, 2, 4, 1]);
        assert_eq!(store.samples()[[1, 0, 2, 0]], 102.0);
        assert_eq!(store.log_probs()[[0, 1, 3]], -3.0);
    }

    #[test]
    fn partial_run_exposes_only_recorded_steps() {
        let mut store = ChainStore::new(1, 2, 10, 1);
        let positions = Array3::zeros((1, 2, 1));
        let log_probs = Array2::zeros((1, 2));
        store.record(positions.view(), log_probs.view());
        store.record(positions.view(), log_probs.view());
        assert_eq!(store.samples().shape(), &[1, 2, 2, 1]);
        assert_eq!(store.n_steps(), 2);
    }

    #[test]
    fn series_addresses_one_walker() {
        let store = toy_store();
        let series = store.series(0, 1, 0);
        assert_eq!(series.to_vec(), vec![10.0, 11.0, 12.0, 13.0]);
    }

    #[test]
    fn thinned_applies_burn_in_and_stride() {
        let store = toy_store();
        let thinned = store.thinned(1, 1, 2).unwrap();
        assert_eq!(thinned.shape(), &[2, 2, 1]);
        // Walker 0 of temperature 1: steps 1 and 3 survive.
        assert_eq!(thinned[[0, 0, 0]], 101.0);
        assert_eq!(thinned[[0, 1, 0]], 103.0);
    }

    #[test]
    fn thinned_rejects_degenerate_requests() {
        let store = toy_store();
        assert!(store.thinned(0, 0, 0).is_err());
        assert!(store.thinned(0, 4, 1).is_err());
    }
}
