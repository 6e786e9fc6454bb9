/*!
Adapts an external potential-fit cost function into the log-posterior that the
sampler evaluates.

The fitting layer hands us a [`CostFunction`]: a residual-style loss over the
(possibly transformed, e.g. logarithmic) parameter space together with one
`(low, high)` bound pair per parameter. [`Posterior`] wraps that object into a
[`LogProbModel`] returning the pair `(log-likelihood, log-prior)`:

- the log-prior is `0.0` inside the bounding box and `-inf` outside (a bounded
  uniform prior), optionally multiplied by a user-supplied density via
  [`Posterior::with_log_prior`];
- the log-likelihood is the negative loss, with any NaN or infinite loss
  mapped to `-inf` so a numerical failure in the evaluator becomes a rejected
  move instead of a crash;
- when the prior is `-inf` the loss is never evaluated (the likelihood is the
  expensive part).

# Examples

```rust
use potfit_uq::posterior::{CostFunction, LogProbModel, Posterior};

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
let inside = posterior.log_prob(&[1.0, -1.0]);
assert_eq!(inside.log_likelihood, -1.0);
assert_eq!(inside.log_prior, 0.0);

let outside = posterior.log_prob(&[6.0, 0.0]);
assert_eq!(outside.log_prior, f64::NEG_INFINITY);
```
*/

use std::error::Error;

/// The external cost/loss object produced by the fitting layer.
///
/// `evaluate` returns a residual-sum-of-squares-style loss at `params`; a
/// numerical failure in the underlying evaluator may surface as NaN. Both
/// methods operate in the transformed parameter space. Implementations must
/// be pure given `params` so calls can run concurrently.
pub trait CostFunction: Send + Sync {
    /// Evaluates the loss at `params`.
    fn evaluate(&self, params: &[f64]) -> f64;

    /// Returns one `(low, high)` pair per parameter.
    fn bounds(&self) -> Vec<(f64, f64)>;
}

/// An additional log-prior density evaluated inside the bounding box.
pub trait LogPrior: Send + Sync {
    /// Returns the log-density at `theta`.
    fn log_prior(&self, theta: &[f64]) -> f64;
}

/// The default flat prior: constant log-density inside the bounds.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uniform;

impl LogPrior for Uniform {
    fn log_prior(&self, _theta: &[f64]) -> f64 {
        0.0
    }
}

/// The two components of a log-posterior evaluation.
///
/// The sampler keeps them separate because tempering scales only the
/// likelihood term, never the prior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogProbParts {
    pub log_likelihood: f64,
    pub log_prior: f64,
}

impl LogProbParts {
    /// Returns `beta * log_likelihood + log_prior`.
    ///
    /// Guards the `-inf` components explicitly so no `0 * inf` NaN can leak
    /// out of a degenerate evaluation.
    pub fn tempered(&self, beta: f64) -> f64 {
        if self.log_prior == f64::NEG_INFINITY || self.log_likelihood == f64::NEG_INFINITY {
            return f64::NEG_INFINITY;
        }
        beta * self.log_likelihood + self.log_prior
    }
}

/// Anything the sampler can draw from: a callable returning the per-walker
/// log-posterior components for a parameter vector.
pub trait LogProbModel: Send + Sync {
    fn log_prob(&self, theta: &[f64]) -> LogProbParts;
}

/**
Wraps a [`CostFunction`] and a bounding box into a [`LogProbModel`].

Bounds default to the ones declared by the cost function and can be overridden
with [`Posterior::with_bounds`]. Construction fails fast on malformed bounds
(wrong dimension, `low >= high`, NaN) so no sampling run starts from an
inconsistent configuration.
*/
#[derive(Debug, Clone)]
pub struct Posterior<C, P = Uniform> {
    cost: C,
    bounds: Vec<(f64, f64)>,
    prior: P,
}

impl<C: CostFunction> Posterior<C, Uniform> {
    /// Creates a posterior using the bounds declared by the cost function.
    pub fn new(cost: C) -> Result<Self, Box<dyn Error>> {
        let bounds = cost.bounds();
        validate_bounds(&bounds)?;
        Ok(Self {
            cost,
            bounds,
            prior: Uniform,
        })
    }

    /// Creates a posterior with caller-supplied bounds, overriding the ones
    /// declared by the cost function.
    pub fn with_bounds(cost: C, bounds: Vec<(f64, f64)>) -> Result<Self, Box<dyn Error>> {
        let declared = cost.bounds().len();
        if bounds.len() != declared {
            return Err(format!(
                "Expected {} bound pairs to match the cost function, got {}.",
                declared,
                bounds.len()
            )
            .into());
        }
        validate_bounds(&bounds)?;
        Ok(Self {
            cost,
            bounds,
            prior: Uniform,
        })
    }
}

impl<C: CostFunction, P: LogPrior> Posterior<C, P> {
    /// Replaces the flat in-box prior with a user-supplied log-density.
    ///
    /// The bounding box is still enforced: outside it the prior is `-inf`
    /// regardless of the supplied density.
    pub fn with_log_prior<P2: LogPrior>(self, prior: P2) -> Posterior<C, P2> {
        Posterior {
            cost: self.cost,
            bounds: self.bounds,
            prior,
        }
    }

    /// The dimensionality of the parameter space.
    pub fn n_params(&self) -> usize {
        self.bounds.len()
    }

    /// The enforced `(low, high)` pairs.
    pub fn bounds(&self) -> &[(f64, f64)] {
        &self.bounds
    }

    fn log_prior(&self, theta: &[f64]) -> f64 {
        // A wrong-length vector can never be inside the box.
        if theta.len() != self.bounds.len() {
            return f64::NEG_INFINITY;
        }
        let in_box = theta
            .iter()
            .zip(&self.bounds)
            .all(|(&x, &(low, high))| low <= x && x <= high);
        if in_box {
            self.prior.log_prior(theta)
        } else {
            f64::NEG_INFINITY
        }
    }
}

impl<C: CostFunction, P: LogPrior> LogProbModel for Posterior<C, P> {
    fn log_prob(&self, theta: &[f64]) -> LogProbParts {
        let log_prior = self.log_prior(theta);
        if log_prior == f64::NEG_INFINITY {
            // Out of support: skip the expensive evaluator entirely.
            return LogProbParts {
                log_likelihood: f64::NEG_INFINITY,
                log_prior,
            };
        }
        let loss = self.cost.evaluate(theta);
        // Any non-finite loss (NaN or either infinity) marks the point as
        // unsupported rather than letting garbage into the acceptance ratio.
        let log_likelihood = if loss.is_finite() {
            -loss
        } else {
            f64::NEG_INFINITY
        };
        LogProbParts {
            log_likelihood,
            log_prior,
        }
    }
}

fn validate_bounds(bounds: &[(f64, f64)]) -> Result<(), Box<dyn Error>> {
    if bounds.is_empty() {
        return Err("Expected at least one bound pair.".into());
    }
    for (i, &(low, high)) in bounds.iter().enumerate() {
        if low.is_nan() || high.is_nan() || low >= high {
            return Err(format!(
                "Invalid bounds ({low}, {high}) for parameter {i}: expected low < high."
            )
            .into());
        }
    }
    Ok(())
}
