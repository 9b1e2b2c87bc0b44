//! Severity-weighted risk scoring over a scan's findings.

use std::collections::BTreeMap;

use crate::models::{Finding, RiskAssessment, Severity};

/// Score a set of findings. Result depends only on the multiset of
/// severities, so ordering of the input never matters.
pub fn score(findings: &[Finding]) -> RiskAssessment {
    score_severities(findings.iter().map(|f| f.severity))
}

pub fn score_severities<I>(severities: I) -> RiskAssessment
where
    I: IntoIterator<Item = Severity>,
{
    let mut counts: BTreeMap<Severity, usize> = Severity::ALL.iter().map(|s| (*s, 0)).collect();
    for severity in severities {
        *counts.entry(severity).or_insert(0) += 1;
    }
    from_counts(counts)
}

pub fn from_counts(counts: BTreeMap<Severity, usize>) -> RiskAssessment {
    let total: usize = counts.values().sum();
    let weighted: u64 = counts
        .iter()
        .map(|(severity, count)| severity.weight() as u64 * *count as u64)
        .sum();
    let risk = weighted as f64 / total.max(1) as f64;

    RiskAssessment {
        level: (total > 0).then(|| level_for(risk)),
        counts,
        total,
        risk,
    }
}

/// Band a score by the midpoints between adjacent severity weights.
pub fn level_for(risk: f64) -> Severity {
    if risk >= 8.5 {
        Severity::Critical
    } else if risk >= 5.5 {
        Severity::High
    } else if risk >= 2.5 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_of_each() {
        let result = score_severities([
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
        ]);
        assert_eq!(result.total, 4);
        assert!((result.risk - 5.5).abs() < f64::EPSILON);
        assert_eq!(result.level, Some(Severity::High));
        for severity in Severity::ALL {
            assert_eq!(result.counts[&severity], 1);
        }
    }

    #[test]
    fn test_empty_scores_zero() {
        let result = score(&[]);
        assert_eq!(result.total, 0);
        assert_eq!(result.risk, 0.0);
        assert_eq!(result.level, None);
        assert_eq!(result.counts.len(), 4);
        assert!(result.counts.values().all(|c| *c == 0));
    }

    #[test]
    fn test_order_independent() {
        let forward = [
            Severity::Low,
            Severity::Critical,
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ];
        let mut reversed = forward;
        reversed.reverse();
        let mut rotated = forward;
        rotated.rotate_left(2);

        let a = score_severities(forward);
        assert_eq!(a, score_severities(reversed));
        assert_eq!(a, score_severities(rotated));
    }

    #[test]
    fn test_bounds() {
        let all_critical = score_severities(vec![Severity::Critical; 7]);
        assert!((all_critical.risk - 10.0).abs() < f64::EPSILON);
        assert_eq!(all_critical.level, Some(Severity::Critical));

        let all_low = score_severities(vec![Severity::Low; 3]);
        assert!((all_low.risk - 1.0).abs() < f64::EPSILON);
        assert_eq!(all_low.level, Some(Severity::Low));
    }

    #[test]
    fn test_level_bands() {
        assert_eq!(level_for(8.5), Severity::Critical);
        assert_eq!(level_for(8.49), Severity::High);
        assert_eq!(level_for(5.5), Severity::High);
        assert_eq!(level_for(4.0), Severity::Medium);
        assert_eq!(level_for(2.4), Severity::Low);
    }
}
