/*!
# Parallel-Tempered Ensemble Sampler

Runs `K` temperatures x `L` walkers over an `N`-dimensional log-posterior.
Within a temperature the walkers evolve under affine-invariant stretch moves:
the population is split into two halves, and each walker in the moving half
proposes against a randomly chosen partner from the complementary half, so
every walker updates exactly once per iteration. After both half-steps,
adjacent temperatures periodically attempt to swap walker states, which lets
hot, flattened replicas ferry the natural-temperature chain across posterior
modes.

Temperature `t` scales only the likelihood: its chain targets
`exp(beta_t * loglikelihood + logprior)`, so the `beta = 1` chain samples the
true posterior.

The independent log-probability evaluations of a half-step are fanned out over
a worker pool scoped to the run; all random draws are consumed serially from
one seeded generator in a fixed order, so a run is reproducible regardless of
how the evaluations are scheduled.

## Example Usage

```rust
use ndarray::Array3;
use potfit_uq::ladder::TemperatureLadder;
use potfit_uq::posterior::{CostFunction, Posterior};
use potfit_uq::sampler::PtSampler;

struct Quadratic;

impl CostFunction for Quadratic {
    fn evaluate(&self, params: &[f64]) -> f64 {
        0.5 * params.iter().map(|x| x * x).sum::<f64>()
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        vec![(-5.0, 5.0), (-5.0, 5.0)]
    }
}

let posterior = Posterior::new(Quadratic).unwrap();
let ladder = TemperatureLadder::geometric(2, 10.0).unwrap();
let mut sampler = PtSampler::new(posterior, ladder, 4).set_seed(42);

// 2 temperatures, 4 walkers, 2 parameters.
let p0 = Array3::from_shape_fn((2, 4, 2), |(t, w, p)| {
    0.1 * (t + w + p) as f64 - 0.2
});
sampler.run_mcmc(p0.view(), 50).unwrap();

let chain = sampler.chain().unwrap();
assert_eq!(chain.samples().shape(), &[2, 4, 50, 2]);
```
*/

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::prelude::*;
use rand::prelude::*;
use rayon::prelude::*;
use std::collections::VecDeque;
use std::error::Error;

use crate::chain::ChainStore;
use crate::ladder::TemperatureLadder;
use crate::posterior::{LogProbModel, LogProbParts};
use crate::stats::RhatTracker;

/// The full walker population of one run: positions `[K, L, N]` and the
/// cached log-probability components `[K, L]` of the last evaluation.
struct Population {
    positions: Array3<f64>,
    log_likes: Array2<f64>,
    log_priors: Array2<f64>,
}

impl Population {
    fn parts(&self, temp: usize, walker: usize) -> LogProbParts {
        LogProbParts {
            log_likelihood: self.log_likes[[temp, walker]],
            log_prior: self.log_priors[[temp, walker]],
        }
    }

    /// Tempered log-posterior of every walker, `[K, L]`.
    fn tempered(&self, betas: &[f64]) -> Array2<f64> {
        let (k, l, _) = self.positions.dim();
        Array2::from_shape_fn((k, l), |(t, w)| self.parts(t, w).tempered(betas[t]))
    }
}

/// Random decisions of one stretch move, drawn before any evaluation runs.
struct MoveDraw {
    temp: usize,
    walker: usize,
    partner: usize,
    z: f64,
    ln_u: f64,
}

/**
The parallel-tempered affine-invariant ensemble sampler.

Construction fixes the ladder and the walker count; `run_mcmc` takes the
initial population (shape `[K, L, N]`) and the iteration count, and fills the
internal [`ChainStore`]. The walker count must be even and at least twice the
number of parameters so the complementary-set stretch move is well defined.

A global random seed drives every stochastic decision (partner choice,
stretch factor, acceptance and swap draws); use [`PtSampler::set_seed`] for
reproducible runs.
*/
pub struct PtSampler<M> {
    /// The log-posterior model being sampled.
    pub model: M,
    ladder: TemperatureLadder,
    n_walkers: usize,
    scale: f64,
    swap_interval: usize,
    n_threads: usize,
    /// The global random seed.
    pub seed: u64,
    rng: SmallRng,
    chain: Option<ChainStore>,
    move_accepts: Vec<usize>,
    move_attempts: Vec<usize>,
    swap_accepts: Vec<usize>,
    swap_attempts: Vec<usize>,
}

impl<M: LogProbModel> PtSampler<M> {
    /// Creates a sampler with `n_walkers` walkers per temperature, stretch
    /// scale `a = 2` and swaps attempted every iteration.
    pub fn new(model: M, ladder: TemperatureLadder, n_walkers: usize) -> Self {
        let seed = thread_rng().gen::<u64>();
        let k = ladder.len();
        Self {
            model,
            ladder,
            n_walkers,
            scale: 2.0,
            swap_interval: 1,
            n_threads: 0,
            seed,
            rng: SmallRng::seed_from_u64(seed),
            chain: None,
            move_accepts: vec![0; k],
            move_attempts: vec![0; k],
            swap_accepts: vec![0; k.saturating_sub(1)],
            swap_attempts: vec![0; k.saturating_sub(1)],
        }
    }

    /// Sets the global seed, making the whole run reproducible.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Sets the stretch-move scale parameter `a` (must be > 1; default 2).
    pub fn set_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Attempts temperature swaps every `interval` iterations (default 1).
    pub fn set_swap_interval(mut self, interval: usize) -> Self {
        self.swap_interval = interval;
        self
    }

    /// Sets the worker-pool size for log-probability evaluations
    /// (0 means one worker per core).
    pub fn set_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads;
        self
    }

    /// The temperature ladder of this sampler.
    pub fn ladder(&self) -> &TemperatureLadder {
        &self.ladder
    }

    /// The chain of the last completed run, if any.
    pub fn chain(&self) -> Option<&ChainStore> {
        self.chain.as_ref()
    }

    /// Stretch-move acceptance rate per temperature.
    pub fn acceptance_rates(&self) -> Array1<f64> {
        Array1::from_iter(
            self.move_accepts
                .iter()
                .zip(&self.move_attempts)
                .map(|(&a, &n)| if n == 0 { 0.0 } else { a as f64 / n as f64 }),
        )
    }

    /// Swap acceptance rate per adjacent temperature pair.
    pub fn swap_acceptance_rates(&self) -> Array1<f64> {
        Array1::from_iter(
            self.swap_accepts
                .iter()
                .zip(&self.swap_attempts)
                .map(|(&a, &n)| if n == 0 { 0.0 } else { a as f64 / n as f64 }),
        )
    }

    /// Runs the sampler for `n_iterations` iterations from the initial
    /// population `p0` of shape `[K, L, N]`, filling the internal chain.
    pub fn run_mcmc(
        &mut self,
        p0: ArrayView3<f64>,
        n_iterations: usize,
    ) -> Result<(), Box<dyn Error>> {
        self.run_impl(p0, n_iterations, false)
    }

    /// Like [`PtSampler::run_mcmc`], additionally displaying a progress bar
    /// with the sliding-window acceptance rate, the overall swap rate and the
    /// running maximum R-hat of the natural-temperature chain.
    pub fn run_mcmc_progress(
        &mut self,
        p0: ArrayView3<f64>,
        n_iterations: usize,
    ) -> Result<(), Box<dyn Error>> {
        self.run_impl(p0, n_iterations, true)
    }

    fn run_impl(
        &mut self,
        p0: ArrayView3<f64>,
        n_iterations: usize,
        show_progress: bool,
    ) -> Result<(), Box<dyn Error>> {
        let k = self.ladder.len();
        let l = self.n_walkers;
        let shape = p0.shape();
        if shape[0] != k || shape[1] != l {
            return Err(format!(
                "Initial population has shape {shape:?}, expected [{k}, {l}, n_params]."
            )
            .into());
        }
        let n = shape[2];
        if n == 0 {
            return Err("Expected at least one parameter.".into());
        }
        if l < 2 || l % 2 != 0 {
            return Err(format!("Expected an even number of walkers >= 2, got {l}.").into());
        }
        if l < 2 * n {
            return Err(format!(
                "Expected at least 2 * n_params = {} walkers for the complementary-set \
                 stretch move, got {l}.",
                2 * n
            )
            .into());
        }
        if !(self.scale > 1.0) {
            return Err(format!(
                "Invalid stretch scale {}: expected a value > 1.",
                self.scale
            )
            .into());
        }
        if self.swap_interval == 0 {
            return Err("Expected a swap interval of at least 1.".into());
        }

        // The pool lives exactly as long as this run, including error paths.
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.n_threads)
            .build()
            .map_err(|e| format!("Failed to start the worker pool: {e}"))?;

        let betas = self.ladder.betas().to_vec();
        let mut pop = Population {
            positions: p0.to_owned(),
            log_likes: Array2::zeros((k, l)),
            log_priors: Array2::zeros((k, l)),
        };

        // Evaluate the initial population in one parallel batch.
        let initial: Vec<Vec<f64>> = (0..k)
            .flat_map(|t| (0..l).map(move |w| (t, w)))
            .map(|(t, w)| pop.positions.slice(s![t, w, ..]).to_vec())
            .collect();
        let parts: Vec<LogProbParts> = pool.install(|| {
            initial
                .par_iter()
                .map(|theta| self.model.log_prob(theta))
                .collect()
        });
        let mut n_invalid = 0usize;
        for ((t, w), part) in (0..k)
            .flat_map(|t| (0..l).map(move |w| (t, w)))
            .zip(&parts)
        {
            pop.log_likes[[t, w]] = part.log_likelihood;
            pop.log_priors[[t, w]] = part.log_prior;
            if part.tempered(betas[t]) == f64::NEG_INFINITY {
                n_invalid += 1;
            }
        }
        if n_invalid > 0 {
            eprintln!(
                "WARNING: {n_invalid} of {} initial walkers have log-probability -inf; \
                 their first moves can only be accepted against finite competitors.",
                k * l
            );
        }

        self.move_accepts = vec![0; k];
        self.move_attempts = vec![0; k];
        self.swap_accepts = vec![0; k.saturating_sub(1)];
        self.swap_attempts = vec![0; k.saturating_sub(1)];

        let mut store = ChainStore::new(k, l, n_iterations, n);

        let pb = if show_progress {
            let pb = ProgressBar::new(n_iterations as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{prefix:8} {bar:40.white} ETA {eta:3} | {msg}")
                    .unwrap()
                    .progress_chars("=>-"),
            );
            pb.set_prefix("PT-MCMC");
            Some(pb)
        } else {
            None
        };

        // Sliding window of 100 iterations for the displayed acceptance rate.
        let window_size = 100;
        let mut accept_window: VecDeque<f64> = VecDeque::with_capacity(window_size);
        let mut tracker = RhatTracker::new(l, n);

        for iter in 0..n_iterations {
            let mut accepted = 0;
            for first_half in [true, false] {
                accepted += stretch_half(
                    &self.model,
                    &pool,
                    &mut self.rng,
                    &betas,
                    self.scale,
                    &mut pop,
                    first_half,
                    &mut self.move_accepts,
                    &mut self.move_attempts,
                );
            }
            if k > 1 && iter % self.swap_interval == 0 {
                swap_sweep(
                    &mut self.rng,
                    &betas,
                    &mut pop,
                    &mut self.swap_accepts,
                    &mut self.swap_attempts,
                );
            }

            let tempered = pop.tempered(&betas);
            store.record(pop.positions.view(), tempered.view());

            if let Some(pb) = &pb {
                accept_window.push_front(accepted as f64 / (k * l) as f64);
                if accept_window.len() > window_size {
                    accept_window.pop_back();
                }
                let avg_accept: f64 =
                    accept_window.iter().sum::<f64>() / accept_window.len() as f64;

                let cold: Vec<f64> = pop.positions.slice(s![0, .., ..]).iter().copied().collect();
                tracker.step(&cold)?;
                let mut msg = format!("p(accept)≈{avg_accept:.2}");
                let swaps: usize = self.swap_attempts.iter().sum();
                if swaps > 0 {
                    let swap_rate =
                        self.swap_accepts.iter().sum::<usize>() as f64 / swaps as f64;
                    msg.push_str(&format!(" p(swap)≈{swap_rate:.2}"));
                }
                if let Ok(max_rhat) = tracker.max() {
                    msg.push_str(&format!(" max(rhat)≈{max_rhat:.2}"));
                }
                pb.set_message(msg);
                pb.inc(1);
            }
        }
        if let Some(pb) = &pb {
            pb.finish_with_message("Done!");
        }

        self.chain = Some(store);
        Ok(())
    }
}

/// Advances one half of every temperature's population by one stretch move.
///
/// Random draws happen serially in a fixed order; only the independent
/// log-probability evaluations run on the pool, and the accept/reject phase
/// starts after all of them have returned.
#[allow(clippy::too_many_arguments)]
fn stretch_half<M: LogProbModel>(
    model: &M,
    pool: &rayon::ThreadPool,
    rng: &mut SmallRng,
    betas: &[f64],
    scale: f64,
    pop: &mut Population,
    first_half: bool,
    move_accepts: &mut [usize],
    move_attempts: &mut [usize],
) -> usize {
    let (k, l, n) = pop.positions.dim();
    let half = l / 2;
    let (start, other) = if first_half { (0, half) } else { (half, 0) };

    let mut draws = Vec::with_capacity(k * half);
    for temp in 0..k {
        for walker in start..start + half {
            // Complementary-set sampling: the partner always comes from the
            // other half, so partner != walker and detailed balance holds.
            let partner = other + rng.gen_range(0..half);
            let z = ((scale - 1.0) * rng.gen::<f64>() + 1.0).powi(2) / scale;
            let ln_u = rng.gen::<f64>().ln();
            draws.push(MoveDraw {
                temp,
                walker,
                partner,
                z,
                ln_u,
            });
        }
    }

    let proposals: Vec<Vec<f64>> = draws
        .iter()
        .map(|d| {
            let cur = pop.positions.slice(s![d.temp, d.walker, ..]);
            let oth = pop.positions.slice(s![d.temp, d.partner, ..]);
            cur.iter()
                .zip(oth.iter())
                .map(|(&x, &o)| o + d.z * (x - o))
                .collect()
        })
        .collect();

    // Fan-out/fan-in barrier: every evaluation returns before any decision.
    let parts: Vec<LogProbParts> = pool.install(|| {
        proposals
            .par_iter()
            .map(|theta| model.log_prob(theta))
            .collect()
    });

    let mut accepted = 0;
    for ((draw, theta), part) in draws.iter().zip(&proposals).zip(&parts) {
        let beta = betas[draw.temp];
        move_attempts[draw.temp] += 1;
        let proposed = part.tempered(beta);
        if proposed == f64::NEG_INFINITY {
            // Rejected outright; never form inf - inf in the ratio.
            continue;
        }
        let current = pop.parts(draw.temp, draw.walker).tempered(beta);
        let accept = current == f64::NEG_INFINITY
            || (n as f64 - 1.0) * draw.z.ln() + proposed - current > draw.ln_u;
        if accept {
            pop.positions
                .slice_mut(s![draw.temp, draw.walker, ..])
                .assign(&ArrayView1::from(&theta[..]));
            pop.log_likes[[draw.temp, draw.walker]] = part.log_likelihood;
            pop.log_priors[[draw.temp, draw.walker]] = part.log_prior;
            move_accepts[draw.temp] += 1;
            accepted += 1;
        }
    }
    accepted
}

/// Attempts one state swap per walker index for every adjacent temperature
/// pair. Swaps exchange position and cached log-probabilities, not walker
/// identity.
fn swap_sweep(
    rng: &mut SmallRng,
    betas: &[f64],
    pop: &mut Population,
    swap_accepts: &mut [usize],
    swap_attempts: &mut [usize],
) {
    let (k, l, n) = pop.positions.dim();
    for temp in 0..k - 1 {
        for walker in 0..l {
            let ln_u = rng.gen::<f64>().ln();
            swap_attempts[temp] += 1;
            let ll_cold = pop.log_likes[[temp, walker]];
            let ll_hot = pop.log_likes[[temp + 1, walker]];
            // Equal likelihoods swap with probability one; this also covers
            // both being -inf without forming inf - inf.
            let accept = ll_cold == ll_hot
                || (betas[temp + 1] - betas[temp]) * (ll_cold - ll_hot) > ln_u;
            if accept {
                for p in 0..n {
                    pop.positions.swap([temp, walker, p], [temp + 1, walker, p]);
                }
                pop.log_likes.swap([temp, walker], [temp + 1, walker]);
                pop.log_priors.swap([temp, walker], [temp + 1, walker]);
                swap_accepts[temp] += 1;
            }
        }
    }
}
