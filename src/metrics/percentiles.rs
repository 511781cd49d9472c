use hdrhistogram::Histogram;
use serde::Serialize;

/// HdrHistogram range for the p95 estimate: 1 ms → 1 h, 3 significant figures.
const HIST_LOW: u64 = 1;
const HIST_HIGH: u64 = 3_600_000;
const HIST_SIGFIG: u8 = 3;

/// Response-time summary derived from a bounded recent sample.
/// Serialized straight into endpoint, overview and query responses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DurationStats {
    pub count: u64,
    pub avg: f64,
    pub min: u64,
    pub max: u64,
    pub p95: u64,
}

impl DurationStats {
    /// Summarise a set of millisecond durations.
    ///
    /// Count, min, max and avg are exact. p95 comes from an HdrHistogram and
    /// is accurate to three significant figures, kept within `min..=max`.
    /// Returns zeroed values if the sample is empty.
    pub fn from_samples<I>(samples: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        let values: Vec<u64> = samples.into_iter().collect();
        let (Some(&min), Some(&max)) = (values.iter().min(), values.iter().max()) else {
            return Self::empty();
        };
        let count = values.len() as u64;
        let sum: u128 = values.iter().map(|&v| u128::from(v)).sum();

        Self {
            count,
            avg: round2(sum as f64 / count as f64),
            min,
            max,
            p95: p95(&values).clamp(min, max),
        }
    }

    /// All-zero placeholder used before any samples are recorded.
    pub fn empty() -> Self {
        Self {
            count: 0,
            avg: 0.0,
            min: 0,
            max: 0,
            p95: 0,
        }
    }
}

fn p95(values: &[u64]) -> u64 {
    let Ok(mut hist) = Histogram::<u64>::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG) else {
        return 0;
    };
    for &ms in values {
        hist.saturating_record(ms);
    }
    hist.value_at_quantile(0.95)
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Parse raw stored sample values; unparsable entries are skipped.
pub fn parse_samples<'a, I>(raw: I) -> impl Iterator<Item = u64> + 'a
where
    I: IntoIterator<Item = &'a String> + 'a,
{
    raw.into_iter().filter_map(|v| v.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sample_is_zeroed() {
        assert_eq!(DurationStats::from_samples(Vec::new()), DurationStats::empty());
    }

    #[test]
    fn small_values_are_exact() {
        let stats = DurationStats::from_samples(1..=100);
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, 1);
        assert_eq!(stats.max, 100);
        assert_eq!(stats.p95, 95);
        assert_eq!(stats.avg, 50.5);
    }

    #[test]
    fn slow_values_keep_exact_bounds() {
        let stats = DurationStats::from_samples([5000, 3001, 12345]);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, 3001);
        assert_eq!(stats.max, 12345);
        assert_eq!(stats.avg, 6782.0);
        assert_eq!(stats.p95, 12345);

        let mixed = DurationStats::from_samples((1..=99).chain([60_017]));
        assert_eq!(mixed.max, 60_017);
        assert!(mixed.p95 <= mixed.max);
    }

    #[test]
    fn rounding() {
        assert_eq!(round2(5.0 / 37.0 * 100.0), 13.51);
        assert_eq!(round2(2.0 / 3.0), 0.67);
    }

    #[test]
    fn garbage_samples_are_skipped() {
        let raw = vec!["12".to_owned(), "oops".to_owned(), "30".to_owned()];
        let parsed: Vec<u64> = parse_samples(&raw).collect();
        assert_eq!(parsed, vec![12, 30]);
    }
}
