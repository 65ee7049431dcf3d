//! Liveness classification of per-face scores.
//!
//! The liveness model returns one record per face it found around the
//! detected box: the face corners plus a score in `[0, 1]`. A record is
//! **live** when its score reaches the active threshold; the boundary is
//! inclusive. Everything here is a pure function of the scores, so the same
//! input always produces the same verdict.
//!
//! Two thresholds are in use:
//!
//! - [`INTERACTIVE_THRESHOLD`] (0.6) gates the interactive enrollment flow.
//! - [`PASSIVE_THRESHOLD`] (0.3) is used by the passive, descriptor-rich flow
//!   where the user is not prompted.

use serde::Serialize;

use crate::types::BoundingBox;

/// Threshold for the interactive detect + liveness + capture flow.
pub const INTERACTIVE_THRESHOLD: f32 = 0.6;

/// Threshold for the passive flow that also computes face descriptors.
pub const PASSIVE_THRESHOLD: f32 = 0.3;

/// One liveness model record: face corners in frame pixels and a score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LivenessScore {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
}

impl LivenessScore {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            score,
        }
    }

    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::new(self.x1, self.y1, self.x2, self.y2)
    }

    /// Score as a whole percentage, as shown on the overlay label.
    pub fn percent(&self) -> u32 {
        (self.score.clamp(0.0, 1.0) * 100.0).round() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Live,
    Spoof,
}

impl Verdict {
    pub fn is_live(&self) -> bool {
        matches!(self, Verdict::Live)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Live => "REAL",
            Verdict::Spoof => "FAKE",
        }
    }
}

/// A liveness record together with its verdict under the active threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassifiedFace {
    pub record: LivenessScore,
    pub verdict: Verdict,
}

/// `score >= threshold` is live. NaN scores are never live.
pub fn classify(score: f32, threshold: f32) -> Verdict {
    if score >= threshold {
        Verdict::Live
    } else {
        Verdict::Spoof
    }
}

/// Classify every record, preserving model order.
pub fn classify_all(records: &[LivenessScore], threshold: f32) -> Vec<ClassifiedFace> {
    records
        .iter()
        .map(|record| ClassifiedFace {
            record: *record,
            verdict: classify(record.score, threshold),
        })
        .collect()
}

/// The highest-scoring record. Ties keep the earliest; NaN scores are skipped.
pub fn strongest(records: &[LivenessScore]) -> Option<&LivenessScore> {
    records
        .iter()
        .filter(|r| !r.score.is_nan())
        .fold(None, |best: Option<&LivenessScore>, r| match best {
            Some(b) if b.score >= r.score => Some(b),
            _ => Some(r),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn record(score: f32) -> LivenessScore {
        LivenessScore::new(10.0, 20.0, 110.0, 140.0, score)
    }

    #[rstest]
    #[case(0.9, INTERACTIVE_THRESHOLD, Verdict::Live)]
    #[case(0.6, INTERACTIVE_THRESHOLD, Verdict::Live)]
    #[case(0.5999, INTERACTIVE_THRESHOLD, Verdict::Spoof)]
    #[case(0.4, INTERACTIVE_THRESHOLD, Verdict::Spoof)]
    #[case(0.4, PASSIVE_THRESHOLD, Verdict::Live)]
    #[case(0.3, PASSIVE_THRESHOLD, Verdict::Live)]
    #[case(0.29, PASSIVE_THRESHOLD, Verdict::Spoof)]
    #[case(0.0, 0.0, Verdict::Live)]
    #[case(1.0, 1.0, Verdict::Live)]
    fn test_classify_threshold(
        #[case] score: f32,
        #[case] threshold: f32,
        #[case] expected: Verdict,
    ) {
        assert_eq!(classify(score, threshold), expected);
    }

    #[test]
    fn test_nan_is_never_live() {
        assert_eq!(classify(f32::NAN, 0.0), Verdict::Spoof);
    }

    #[test]
    fn test_classify_all_preserves_order() {
        let records = vec![record(0.2), record(0.8), record(0.6)];
        let faces = classify_all(&records, INTERACTIVE_THRESHOLD);
        let verdicts: Vec<Verdict> = faces.iter().map(|f| f.verdict).collect();
        assert_eq!(verdicts, vec![Verdict::Spoof, Verdict::Live, Verdict::Live]);
        assert_eq!(faces[1].record.score, 0.8);
    }

    #[test]
    fn test_strongest_picks_highest() {
        let records = vec![record(0.2), record(0.8), record(0.6)];
        assert_eq!(strongest(&records).map(|r| r.score), Some(0.8));
    }

    #[test]
    fn test_strongest_tie_keeps_first() {
        let mut a = record(0.7);
        a.x1 = 1.0;
        let mut b = record(0.7);
        b.x1 = 2.0;
        assert_eq!(strongest(&[a, b]).map(|r| r.x1), Some(1.0));
    }

    #[test]
    fn test_strongest_skips_nan() {
        let records = vec![record(f32::NAN), record(0.1)];
        assert_eq!(strongest(&records).map(|r| r.score), Some(0.1));
        assert!(strongest(&[record(f32::NAN)]).is_none());
    }

    #[test]
    fn test_strongest_empty() {
        assert!(strongest(&[]).is_none());
    }

    #[test]
    fn test_percent_rounds() {
        assert_eq!(record(0.937).percent(), 94);
        assert_eq!(record(0.9).percent(), 90);
        assert_eq!(record(1.4).percent(), 100);
        assert_eq!(record(-0.2).percent(), 0);
    }

    #[test]
    fn test_bounds_normalized() {
        let r = LivenessScore::new(110.0, 140.0, 10.0, 20.0, 0.5);
        assert_eq!(r.bounds(), BoundingBox::new(10.0, 20.0, 110.0, 140.0));
    }
}
