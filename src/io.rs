//! Saving sampled chains to disk (requires the `csv` feature).

#[cfg(feature = "csv")]
use crate::chain::ChainStore;
#[cfg(feature = "csv")]
use csv::Writer;
#[cfg(feature = "csv")]
use ndarray::s;
#[cfg(feature = "csv")]
use std::error::Error;
#[cfg(feature = "csv")]
use std::fs::File;

/// Writes a chain to a CSV file with one row per recorded walker state and
/// the header `temp,walker,sample,dim_0,...,dim_{N-1},log_prob`.
#[cfg(feature = "csv")]
pub fn save_csv(chain: &ChainStore, filename: &str) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(filename)?);

    let mut header = vec!["temp".to_string(), "walker".to_string(), "sample".to_string()];
    header.extend((0..chain.n_params()).map(|p| format!("dim_{p}")));
    header.push("log_prob".to_string());
    wtr.write_record(&header)?;

    let samples = chain.samples();
    let log_probs = chain.log_probs();
    for t in 0..chain.n_temps() {
        for w in 0..chain.n_walkers() {
            for step in 0..chain.n_steps() {
                let mut row = vec![t.to_string(), w.to_string(), step.to_string()];
                row.extend(samples.slice(s![t, w, step, ..]).iter().map(f64::to_string));
                row.push(log_probs[[t, w, step]].to_string());
                wtr.write_record(&row)?;
            }
        }
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(all(test, feature = "csv"))]
mod tests {
    use super::*;
    use ndarray::prelude::*;
    use tempfile::NamedTempFile;

    #[test]
    fn writes_header_and_one_row_per_state() {
        let mut chain = ChainStore::new(2, 2, 3, 2);
        for step in 0..3 {
            let positions = Array3::from_shape_fn((2, 2, 2), |(t, w, p)| {
                1000.0 * t as f64 + 100.0 * w as f64 + 10.0 * step as f64 + p as f64
            });
            let log_probs = Array2::from_elem((2, 2), -0.5);
            chain.record(positions.view(), log_probs.view());
        }

        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        save_csv(&chain, &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next().unwrap(), "temp,walker,sample,dim_0,dim_1,log_prob");
        // 2 temps x 2 walkers x 3 steps.
        assert_eq!(lines.clone().count(), 12);
        assert_eq!(lines.next().unwrap(), "0,0,0,0,1,-0.5");
    }
}
