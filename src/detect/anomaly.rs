/// Population mean and standard deviation of one feature across a batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dispersion {
    pub mean: f64,
    /// Population standard deviation (divides by N).
    pub std: f64,
}

impl Dispersion {
    /// Welford's single-pass accumulation.
    pub fn of(values: impl IntoIterator<Item = f64>) -> Self {
        let mut count = 0usize;
        let mut mean = 0.0;
        let mut m2 = 0.0;
        for x in values {
            count += 1;
            let delta = x - mean;
            mean += delta / count as f64;
            m2 += delta * (x - mean);
        }
        let std = if count == 0 { 0.0 } else { (m2 / count as f64).max(0.0).sqrt() };
        Self { mean, std }
    }

    /// Absolute z-score of `value`. `None` for a zero-variance batch, which
    /// can never flag a sample.
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if self.std <= 0.0 {
            return None;
        }
        Some((value - self.mean).abs() / self.std)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_population_stats() {
        let d = Dispersion::of([1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!((d.mean - 3.0).abs() < 1e-12);
        // population variance of 1..5 is 2.0
        assert!((d.std - 2f64.sqrt()).abs() < 1e-12);
        assert!(d.z_score(10.0).unwrap() > 4.9);
    }

    #[test]
    fn test_z_score_is_absolute() {
        let d = Dispersion::of([1.0, 2.0, 3.0, 4.0, 5.0]);
        let below = d.z_score(-4.0).unwrap();
        let above = d.z_score(10.0).unwrap();
        assert!((below - above).abs() < 1e-12);
    }

    #[test]
    fn test_constant_batch_has_no_z_score() {
        let d = Dispersion::of(vec![0.1; 12]);
        assert_eq!(d.z_score(0.1), None);
        assert_eq!(d.z_score(1000.0), None);
    }

    #[test]
    fn test_empty_batch() {
        let d = Dispersion::of(std::iter::empty());
        assert_eq!(d.mean, 0.0);
        assert_eq!(d.z_score(1.0), None);
    }
}
