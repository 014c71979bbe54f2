use crate::types::{Reliability, StageCounts};

/// Minimums for one reliability band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub min_items: usize,
    /// Fraction of attempted analyses that must succeed.
    pub min_success_ratio: f64,
    pub min_relevant: usize,
}

/// Reliability bands over analysis attempts and successes.
#[derive(Debug, Clone, PartialEq)]
pub struct ReliabilityBands {
    pub reliable: Band,
    pub questionable: Band,
    /// Items needed for `unreliable`; at least one success is also required.
    pub unreliable_min_items: usize,
}

impl Default for ReliabilityBands {
    fn default() -> Self {
        Self {
            reliable: Band { min_items: 10, min_success_ratio: 0.8, min_relevant: 5 },
            questionable: Band { min_items: 5, min_success_ratio: 0.6, min_relevant: 3 },
            unreliable_min_items: 3,
        }
    }
}

impl ReliabilityBands {
    pub fn rate(&self, counts: &StageCounts) -> Reliability {
        let items = counts.attempted;
        let ratio = if items == 0 { 0.0 } else { counts.analyzed as f64 / items as f64 };
        let meets = |band: &Band| items >= band.min_items && ratio >= band.min_success_ratio && counts.relevant >= band.min_relevant;

        if meets(&self.reliable) {
            Reliability::Reliable
        } else if meets(&self.questionable) {
            Reliability::Questionable
        } else if items >= self.unreliable_min_items && counts.analyzed >= 1 {
            Reliability::Unreliable
        } else {
            Reliability::Insufficient
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(attempted: usize, analyzed: usize, relevant: usize) -> StageCounts {
        StageCounts { attempted, analyzed, relevant, ..Default::default() }
    }

    #[test]
    fn bands_follow_thresholds() {
        let bands = ReliabilityBands::default();
        assert_eq!(bands.rate(&counts(10, 8, 5)), Reliability::Reliable);
        assert_eq!(bands.rate(&counts(13, 10, 13)), Reliability::Questionable);
        assert_eq!(bands.rate(&counts(5, 3, 3)), Reliability::Questionable);
        assert_eq!(bands.rate(&counts(5, 2, 5)), Reliability::Unreliable);
        assert_eq!(bands.rate(&counts(3, 1, 0)), Reliability::Unreliable);
        assert_eq!(bands.rate(&counts(3, 0, 3)), Reliability::Insufficient);
        assert_eq!(bands.rate(&counts(2, 2, 2)), Reliability::Insufficient);
        assert_eq!(bands.rate(&StageCounts::default()), Reliability::Insufficient);
    }
}
