//! Read-side view of a defect with its derived fields.
//!
//! `risk_factor` and `new_defect` are computed here on every read and never
//! written back; the stored record stays free of policy-dependent values.

use serde::Serialize;

use crate::models::ccn_defect::CcnDefect;
use crate::models::defect_status::{DefectStatus, StatusAnomaly};
use crate::services::risk_factor::{RiskFactor, RiskThresholds};

/// A stored defect plus the values derived from it at read time.
#[derive(Debug, Clone, Serialize)]
pub struct CcnDefectView<'a> {
    #[serde(flatten)]
    pub defect: &'a CcnDefect,
    pub risk_factor: RiskFactor,
    pub new_defect: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub status_anomalies: Vec<StatusAnomaly>,
}

/// Build the read view of `defect` against the thresholds in force now.
pub fn present<'a>(defect: &'a CcnDefect, thresholds: &RiskThresholds) -> CcnDefectView<'a> {
    let decoded = defect.common.status.decode();
    if !decoded.is_clean() {
        tracing::warn!(
            task_id = defect.task_id,
            func_signature = %defect.func_signature,
            status = defect.common.status.bits(),
            anomalies = ?decoded.anomalies,
            "Stored defect status has anomalies"
        );
    }

    CcnDefectView {
        defect,
        risk_factor: thresholds.classify(defect.ccn),
        new_defect: decoded.flags.contains(DefectStatus::NEW),
        status_anomalies: decoded.anomalies,
    }
}

/// Present every defect whose risk band is in `risk_mask` (see [`RiskFactor::bits`]).
pub fn present_filtered<'a>(
    defects: &'a [CcnDefect],
    thresholds: &RiskThresholds,
    risk_mask: i32,
) -> Vec<CcnDefectView<'a>> {
    defects
        .iter()
        .map(|d| present(d, thresholds))
        .filter(|view| view.risk_factor.matches_mask(risk_mask))
        .collect()
}

/// Active defect counts per risk band, as shown on a task overview.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RiskBreakdown {
    pub very_high: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl RiskBreakdown {
    pub fn total(&self) -> usize {
        self.very_high + self.high + self.medium + self.low
    }
}

/// Count defects that still count against the task: not fixed, ignored or masked.
pub fn risk_breakdown(defects: &[CcnDefect], thresholds: &RiskThresholds) -> RiskBreakdown {
    let mut counts = RiskBreakdown::default();
    for defect in defects {
        let status = defect.common.status;
        if !status.is_active() || status.contains(DefectStatus::IGNORE) {
            continue;
        }
        match thresholds.classify(defect.ccn) {
            RiskFactor::VeryHigh => counts.very_high += 1,
            RiskFactor::High => counts.high += 1,
            RiskFactor::Medium => counts.medium += 1,
            RiskFactor::Low => counts.low += 1,
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defect(ccn: i32, status: DefectStatus) -> CcnDefect {
        let mut d = CcnDefect {
            task_id: 3,
            func_signature: format!("sig-{ccn}"),
            ccn,
            ..Default::default()
        };
        d.common.status = status;
        d
    }

    #[test]
    fn new_defect_follows_new_bit() {
        let t = RiskThresholds::default();
        assert!(present(&defect(25, DefectStatus::NEW), &t).new_defect);
        assert!(!present(&defect(25, DefectStatus::NONE), &t).new_defect);
        assert!(!present(&defect(25, DefectStatus::FIXED), &t).new_defect);
    }

    #[test]
    fn rethresholding_changes_view_without_touching_record() {
        let stored = defect(25, DefectStatus::NEW);
        let before = stored.clone();

        let loose = present(&stored, &RiskThresholds::default());
        assert_eq!(loose.risk_factor, RiskFactor::High);

        let strict = RiskThresholds::new(5, 10, 20).unwrap();
        assert_eq!(present(&stored, &strict).risk_factor, RiskFactor::VeryHigh);

        assert_eq!(stored, before);
    }

    #[test]
    fn corrupt_status_is_flagged_not_fatal() {
        let stored = defect(12, DefectStatus::from_bits(1 | 2 | 256));
        let view = present(&stored, &RiskThresholds::default());
        assert!(!view.new_defect);
        assert_eq!(view.status_anomalies.len(), 2);
    }

    #[test]
    fn view_serializes_derived_fields_next_to_record() {
        let stored = defect(31, DefectStatus::NEW);
        let json = serde_json::to_value(present(&stored, &RiskThresholds::default())).unwrap();
        assert_eq!(json["risk_factor"], 1);
        assert_eq!(json["new_defect"], true);
        assert_eq!(json["func_signature"], "sig-31");
        assert!(json.get("status_anomalies").is_none());
    }

    #[test]
    fn filtered_presentation_by_risk_mask() {
        let defects = vec![
            defect(5, DefectStatus::NEW),
            defect(25, DefectStatus::NEW),
            defect(45, DefectStatus::NEW),
        ];
        let mask = RiskFactor::VeryHigh.bits() | RiskFactor::High.bits();
        let views = present_filtered(&defects, &RiskThresholds::default(), mask);
        let ccns: Vec<i32> = views.iter().map(|v| v.defect.ccn).collect();
        assert_eq!(ccns, vec![25, 45]);
    }

    #[test]
    fn breakdown_counts_only_active_defects() {
        let defects = vec![
            defect(5, DefectStatus::NEW),
            defect(25, DefectStatus::NONE),
            defect(45, DefectStatus::FIXED),
            defect(46, DefectStatus::NEW | DefectStatus::IGNORE),
            defect(47, DefectStatus::PATH_MASK),
            defect(50, DefectStatus::NONE),
        ];
        let counts = risk_breakdown(&defects, &RiskThresholds::default());
        assert_eq!(
            counts,
            RiskBreakdown {
                very_high: 1,
                high: 1,
                medium: 0,
                low: 1
            }
        );
        assert_eq!(counts.total(), 3);
    }
}
