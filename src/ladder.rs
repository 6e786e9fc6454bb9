/*!
The temperature ladder used for parallel tempering.

A ladder is an ordered sequence of inverse temperatures ("betas"), strictly
decreasing from `beta = 1` (the natural temperature, whose chain samples the
true posterior) towards hotter, flatter replicas that mix across posterior
modes. The ladder is fixed for the duration of a sampling run.

# Examples

```rust
use potfit_uq::ladder::TemperatureLadder;

// Four temperatures, geometrically spaced between T = 1 and T = 100.
let ladder = TemperatureLadder::geometric(4, 100.0).unwrap();
assert_eq!(ladder.len(), 4);
assert_eq!(ladder.betas()[0], 1.0);

// Or spell the temperatures out explicitly.
let ladder = TemperatureLadder::with_temperatures(vec![1.0, 2.0, 4.0]).unwrap();
assert_eq!(ladder.betas()[2], 0.25);
```
*/

use std::error::Error;

/// An ordered sequence of inverse temperatures, strictly decreasing from 1.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureLadder {
    betas: Vec<f64>,
}

impl TemperatureLadder {
    /// Builds a ladder from explicit temperatures.
    ///
    /// The temperatures must start at 1 (the natural temperature) and be
    /// strictly increasing and finite.
    pub fn with_temperatures(temperatures: Vec<f64>) -> Result<Self, Box<dyn Error>> {
        let betas: Vec<f64> = temperatures.iter().map(|t| 1.0 / t).collect();
        validate_betas(&betas)?;
        Ok(Self { betas })
    }

    /// Builds a geometric ladder of `ntemps` temperatures between `T = 1` and
    /// `T = tmax_ratio` (the ratio of the hottest temperature to the natural
    /// one). `ntemps == 1` gives the single-temperature ladder `[1.0]`.
    pub fn geometric(ntemps: usize, tmax_ratio: f64) -> Result<Self, Box<dyn Error>> {
        if ntemps == 0 {
            return Err("Expected at least one temperature.".into());
        }
        if ntemps == 1 {
            return Ok(Self { betas: vec![1.0] });
        }
        if !tmax_ratio.is_finite() || tmax_ratio <= 1.0 {
            return Err(format!(
                "Invalid maximum temperature ratio {tmax_ratio}: expected a finite value > 1."
            )
            .into());
        }
        let betas: Vec<f64> = (0..ntemps)
            .map(|k| tmax_ratio.powf(-(k as f64) / (ntemps - 1) as f64))
            .collect();
        validate_betas(&betas)?;
        Ok(Self { betas })
    }

    /// The inverse temperatures, hottest last.
    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    /// The number of temperatures `K`.
    pub fn len(&self) -> usize {
        self.betas.len()
    }

    /// Always false: a valid ladder has at least one rung.
    pub fn is_empty(&self) -> bool {
        self.betas.is_empty()
    }
}

fn validate_betas(betas: &[f64]) -> Result<(), Box<dyn Error>> {
    if betas.is_empty() {
        return Err("Expected at least one temperature.".into());
    }
    if betas[0] != 1.0 {
        return Err(format!(
            "Expected the ladder to start at the natural temperature (beta = 1), got beta = {}.",
            betas[0]
        )
        .into());
    }
    for pair in betas.windows(2) {
        if !(pair[1] < pair[0]) {
            return Err(format!(
                "Expected strictly decreasing betas, got {} followed by {}.",
                pair[0], pair[1]
            )
            .into());
        }
    }
    if betas.iter().any(|b| !b.is_finite() || *b <= 0.0) {
        return Err("Expected all betas to be finite and positive.".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn geometric_endpoints() {
        let ladder = TemperatureLadder::geometric(5, 100.0).unwrap();
        assert_eq!(ladder.len(), 5);
        assert_eq!(ladder.betas()[0], 1.0);
        assert_abs_diff_eq!(ladder.betas()[4], 0.01, epsilon = 1e-12);
    }

    #[test]
    fn geometric_is_strictly_decreasing() {
        let ladder = TemperatureLadder::geometric(8, 50.0).unwrap();
        for pair in ladder.betas().windows(2) {
            assert!(pair[1] < pair[0]);
        }
    }

    #[test]
    fn single_temperature_ladder() {
        let ladder = TemperatureLadder::geometric(1, 100.0).unwrap();
        assert_eq!(ladder.betas(), &[1.0]);
    }

    #[test]
    fn explicit_temperatures_convert_to_betas() {
        let ladder = TemperatureLadder::with_temperatures(vec![1.0, 10.0]).unwrap();
        assert_eq!(ladder.betas(), &[1.0, 0.1]);
    }

    #[test]
    fn rejects_ladder_not_starting_at_one() {
        assert!(TemperatureLadder::with_temperatures(vec![2.0, 4.0]).is_err());
    }

    #[test]
    fn rejects_non_monotonic_ladder() {
        assert!(TemperatureLadder::with_temperatures(vec![1.0, 4.0, 2.0]).is_err());
    }

    #[test]
    fn rejects_empty_and_bad_ratio() {
        assert!(TemperatureLadder::geometric(0, 100.0).is_err());
        assert!(TemperatureLadder::geometric(4, 1.0).is_err());
        assert!(TemperatureLadder::geometric(4, f64::INFINITY).is_err());
    }
}
