//! CCN defect lifecycle: scan-driven and operator-driven status transitions.
//!
//! Every function here is pure over a [`CcnDefect`]. Scan transitions
//! (create, persist, fix) are driven by [`crate::services::reconciliation`];
//! operator transitions (ignore, un-ignore, mark) and configuration
//! transitions (mask) are applied independently of the liveness dimension.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::AppError;
use crate::models::ccn_defect::{CcnDefect, CodeComment};
use crate::models::defect_common::{AnalysisVersion, DefectCommon, Mark};
use crate::models::defect_status::DefectStatus;
use crate::models::observation::FunctionObservation;
use crate::services::masking::MaskHits;

/// The scan run a batch of observations belongs to.
#[derive(Debug, Clone)]
pub struct ScanContext {
    pub task_id: i64,
    pub tool_name: String,
    pub build_number: String,
    pub scanned_at: DateTime<Utc>,
}

impl ScanContext {
    pub fn new(
        task_id: i64,
        tool_name: impl Into<String>,
        build_number: impl Into<String>,
        scanned_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            tool_name: tool_name.into(),
            build_number: build_number.into(),
            scanned_at,
        }
    }

    pub fn analysis_version(&self) -> AnalysisVersion {
        AnalysisVersion::new(self.task_id, self.tool_name.clone())
    }

    pub fn now_millis(&self) -> i64 {
        self.scanned_at.timestamp_millis()
    }
}

/// What a scan transition did to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Created,
    Persisted,
    /// A FIXED record was observed again.
    Reopened,
    Fixed,
    Unchanged,
}

/// Operator request to ignore a defect.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IgnoreRequest {
    pub ignore_reason_type: i32,
    pub ignore_reason: Option<String>,
    pub ignore_author: String,
}

/// Bits changed by a mask evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaskChange {
    pub added: DefectStatus,
    pub removed: DefectStatus,
}

impl MaskChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Reject malformed observations and observations from another task.
pub fn validate_observation(obs: &FunctionObservation, ctx: &ScanContext) -> Result<(), AppError> {
    obs.validate()?;
    if obs.task_id != ctx.task_id {
        return Err(AppError::TaskMismatch {
            expected: ctx.task_id,
            found: obs.task_id,
        });
    }
    Ok(())
}

/// First observation of a function: a NEW record.
pub fn create(obs: &FunctionObservation, ctx: &ScanContext) -> Result<CcnDefect, AppError> {
    validate_observation(obs, ctx)?;

    let mut defect = CcnDefect {
        task_id: obs.task_id,
        common: DefectCommon {
            tool_name: Some(ctx.tool_name.clone()),
            status: DefectStatus::NEW,
            create_time: Some(ctx.now_millis()),
            create_build_number: Some(ctx.build_number.clone()),
            ..Default::default()
        },
        ..Default::default()
    };
    apply_observation(&mut defect, obs, ctx);

    Ok(defect)
}

/// A known function observed again.
///
/// Clears NEW, refreshes the measurement and version, and reopens a FIXED
/// record. IGNORE and mask bits are left alone.
pub fn persist(
    prior: &mut CcnDefect,
    obs: &FunctionObservation,
    ctx: &ScanContext,
) -> Result<Transition, AppError> {
    validate_observation(obs, ctx)?;
    if prior.task_id != obs.task_id {
        return Err(AppError::TaskMismatch {
            expected: prior.task_id,
            found: obs.task_id,
        });
    }

    let status = &mut prior.common.status;
    let transition = if status.contains(DefectStatus::FIXED) {
        status.remove(DefectStatus::FIXED);
        prior.common.fixed_time = None;
        prior.common.fixed_build_number = None;
        Transition::Reopened
    } else {
        Transition::Persisted
    };
    prior.common.status.remove(DefectStatus::NEW);

    apply_observation(prior, obs, ctx);
    Ok(transition)
}

/// A known function missing from the scan that should have reported it.
pub fn fix(prior: &mut CcnDefect, ctx: &ScanContext) -> Result<Transition, AppError> {
    if prior.task_id != ctx.task_id {
        return Err(AppError::TaskMismatch {
            expected: prior.task_id,
            found: ctx.task_id,
        });
    }
    if prior.common.status.contains(DefectStatus::FIXED) {
        return Ok(Transition::Unchanged);
    }

    let common = &mut prior.common;
    common.status.remove(DefectStatus::NEW);
    common.status.insert(DefectStatus::FIXED);
    common.fixed_time = Some(ctx.now_millis());
    common.fixed_build_number = Some(ctx.build_number.clone());
    Ok(Transition::Fixed)
}

/// Operator ignore. FIXED and NEW are kept so the audit trail survives.
pub fn ignore(
    defect: &mut CcnDefect,
    request: &IgnoreRequest,
    at: DateTime<Utc>,
) -> Result<(), AppError> {
    if request.ignore_author.trim().is_empty() {
        return Err(AppError::Validation(
            "Ignoring a defect requires an author".to_string(),
        ));
    }

    let common = &mut defect.common;
    common.status.insert(DefectStatus::IGNORE);
    common.ignore_time = Some(at.timestamp_millis());
    common.ignore_reason_type = Some(request.ignore_reason_type);
    common.ignore_reason = request.ignore_reason.clone();
    common.ignore_author = Some(request.ignore_author.clone());
    Ok(())
}

/// Operator un-ignore: clears IGNORE and the ignore metadata.
pub fn unignore(defect: &mut CcnDefect) -> Result<(), AppError> {
    if !defect.common.status.contains(DefectStatus::IGNORE) {
        return Err(AppError::InvalidTransition(format!(
            "Defect {} is not ignored",
            defect.func_signature
        )));
    }

    let common = &mut defect.common;
    common.status.remove(DefectStatus::IGNORE);
    common.ignore_time = None;
    common.ignore_reason_type = None;
    common.ignore_reason = None;
    common.ignore_author = None;
    Ok(())
}

/// Set the developer acknowledgement. `Mark::None` clears the mark time.
pub fn mark(defect: &mut CcnDefect, mark: Mark, at: DateTime<Utc>) {
    defect.common.mark = Some(mark);
    defect.common.mark_time = match mark {
        Mark::None => None,
        Mark::Tagged | Mark::Prompted => Some(at.timestamp_millis()),
    };
}

/// Attach or replace the referenced code comment. Lifecycle fields are untouched.
pub fn attach_comment(defect: &mut CcnDefect, comment: CodeComment) {
    defect.code_comment = Some(comment);
}

/// Bring PATH_MASK / CHECKER_MASK in line with the rules that currently hit.
///
/// `exclude_time` is stamped when the first mask bit appears and cleared when
/// the last one goes; it is not refreshed while some mask stays set.
pub fn apply_masks(defect: &mut CcnDefect, hits: MaskHits, at: DateTime<Utc>) -> MaskChange {
    let before = defect.common.status;
    let common = &mut defect.common;

    common.status.set(DefectStatus::PATH_MASK, hits.path);
    common.status.set(DefectStatus::CHECKER_MASK, hits.checker);

    let after = common.status;
    if after.is_masked() {
        if !before.is_masked() || common.exclude_time.is_none() {
            common.exclude_time = Some(at.timestamp_millis());
        }
    } else {
        common.exclude_time = None;
    }

    MaskChange {
        added: DefectStatus::from_bits(after.bits() & !before.bits() & DefectStatus::ANY_MASK.bits()),
        removed: DefectStatus::from_bits(before.bits() & !after.bits() & DefectStatus::ANY_MASK.bits()),
    }
}

/// Copy measurement, provenance and version from an observation.
fn apply_observation(defect: &mut CcnDefect, obs: &FunctionObservation, ctx: &ScanContext) {
    defect.func_signature = obs.func_signature.clone();
    defect.function_name = obs.function_name.clone();
    defect.long_name = obs.long_name.clone();
    defect.ccn = obs.ccn;
    defect.start_lines = obs.start_lines;
    defect.end_lines = obs.end_lines;
    defect.total_lines = obs.total_lines;
    defect.condition_lines = obs.condition_lines.clone();
    defect.latest_date_time = obs.latest_date_time;
    defect.pinpoint_hash = obs.pinpoint_hash.clone();

    let common = &mut defect.common;
    common.author = obs.author.clone();
    common.rel_path = obs.rel_path.clone();
    common.file_path = obs.file_path.clone();
    common.url = obs.url.clone();
    common.repo_id = obs.repo_id.clone();
    common.revision = obs.revision.clone();
    common.branch = obs.branch.clone();
    common.sub_module = obs.sub_module.clone();
    common.md5 = obs.md5.clone();
    common.tool_name = Some(ctx.tool_name.clone());
    common.analysis_version = Some(ctx.analysis_version());
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(build: &str, minute: u32) -> ScanContext {
        ScanContext::new(
            7,
            "CCN",
            build,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap(),
        )
    }

    fn obs(ccn: i32) -> FunctionObservation {
        FunctionObservation {
            task_id: 7,
            func_signature: "sig-handle".to_string(),
            function_name: Some("handle".to_string()),
            long_name: Some("Server::handle(Request&)".to_string()),
            ccn,
            start_lines: Some(100),
            end_lines: Some(180),
            total_lines: Some(81),
            rel_path: Some("src/server.cc".to_string()),
            author: Some("dana".to_string()),
            latest_date_time: Some(1_709_000_000_000),
            ..Default::default()
        }
    }

    fn ignore_request() -> IgnoreRequest {
        IgnoreRequest {
            ignore_reason_type: 2,
            ignore_reason: Some("legacy".to_string()),
            ignore_author: "erin".to_string(),
        }
    }

    // -- Scan transitions --

    #[test]
    fn create_sets_new_and_versioning() {
        let c = ctx("10", 0);
        let defect = create(&obs(25), &c).unwrap();
        assert_eq!(defect.common.status, DefectStatus::NEW);
        assert_eq!(defect.common.create_time, Some(c.now_millis()));
        assert_eq!(defect.common.create_build_number.as_deref(), Some("10"));
        assert_eq!(
            defect.common.analysis_version,
            Some(AnalysisVersion::new(7, "CCN"))
        );
        assert!(defect.entity_id.is_none());
        assert!(defect.invariant_violations().is_empty());
    }

    #[test]
    fn create_rejects_malformed_observation() {
        let mut bad = obs(25);
        bad.end_lines = Some(50);
        let err = create(&bad, &ctx("10", 0)).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn create_rejects_other_task() {
        let mut foreign = obs(25);
        foreign.task_id = 8;
        let err = create(&foreign, &ctx("10", 0)).unwrap_err();
        assert!(matches!(
            err,
            AppError::TaskMismatch {
                expected: 7,
                found: 8
            }
        ));
    }

    #[test]
    fn persist_clears_new_and_updates_measurement() {
        let mut defect = create(&obs(25), &ctx("10", 0)).unwrap();
        let mut later = obs(31);
        later.start_lines = Some(110);
        later.end_lines = Some(200);
        later.total_lines = Some(91);

        let t = persist(&mut defect, &later, &ctx("11", 5)).unwrap();

        assert_eq!(t, Transition::Persisted);
        assert!(!defect.common.status.contains(DefectStatus::NEW));
        assert_eq!(defect.ccn, 31);
        assert_eq!(defect.start_lines, Some(110));
        assert_eq!(defect.common.create_build_number.as_deref(), Some("10"));
    }

    #[test]
    fn persist_is_idempotent() {
        let mut defect = create(&obs(25), &ctx("10", 0)).unwrap();
        persist(&mut defect, &obs(25), &ctx("11", 5)).unwrap();
        let first = defect.common.status;
        persist(&mut defect, &obs(25), &ctx("12", 10)).unwrap();
        assert_eq!(defect.common.status, first);
    }

    #[test]
    fn persist_keeps_ignore_and_mask_bits() {
        let c = ctx("10", 0);
        let mut defect = create(&obs(25), &c).unwrap();
        ignore(&mut defect, &ignore_request(), c.scanned_at).unwrap();
        apply_masks(
            &mut defect,
            MaskHits {
                path: false,
                checker: true,
            },
            c.scanned_at,
        );

        persist(&mut defect, &obs(25), &ctx("11", 5)).unwrap();
        assert_eq!(
            defect.common.status,
            DefectStatus::IGNORE | DefectStatus::CHECKER_MASK
        );
    }

    #[test]
    fn persist_rejects_cross_task_record() {
        let mut defect = create(&obs(25), &ctx("10", 0)).unwrap();
        defect.task_id = 99;
        let err = persist(&mut defect, &obs(25), &ctx("11", 5)).unwrap_err();
        assert!(err.is_integrity_fault());
        assert_eq!(defect.ccn, 25);
    }

    #[test]
    fn fix_sets_fixed_and_clears_new() {
        let mut defect = create(&obs(25), &ctx("10", 0)).unwrap();
        let c = ctx("11", 5);
        let t = fix(&mut defect, &c).unwrap();
        assert_eq!(t, Transition::Fixed);
        assert_eq!(defect.common.status, DefectStatus::FIXED);
        assert_eq!(defect.common.fixed_time, Some(c.now_millis()));
        assert_eq!(defect.common.fixed_build_number.as_deref(), Some("11"));
        assert!(defect.invariant_violations().is_empty());
    }

    #[test]
    fn fix_twice_keeps_first_fix() {
        let mut defect = create(&obs(25), &ctx("10", 0)).unwrap();
        fix(&mut defect, &ctx("11", 5)).unwrap();
        let t = fix(&mut defect, &ctx("12", 10)).unwrap();
        assert_eq!(t, Transition::Unchanged);
        assert_eq!(defect.common.fixed_build_number.as_deref(), Some("11"));
    }

    #[test]
    fn reobserving_fixed_defect_reopens_it() {
        let mut defect = create(&obs(25), &ctx("10", 0)).unwrap();
        fix(&mut defect, &ctx("11", 5)).unwrap();
        let t = persist(&mut defect, &obs(25), &ctx("12", 10)).unwrap();
        assert_eq!(t, Transition::Reopened);
        assert!(defect.common.status.is_empty());
        assert!(defect.common.fixed_time.is_none());
        assert!(defect.common.fixed_build_number.is_none());
    }

    // -- Operator transitions --

    #[test]
    fn ignoring_fixed_defect_keeps_fixed() {
        let mut defect = create(&obs(25), &ctx("10", 0)).unwrap();
        fix(&mut defect, &ctx("11", 5)).unwrap();
        ignore(&mut defect, &ignore_request(), Utc::now()).unwrap();
        assert_eq!(defect.common.status, DefectStatus::FIXED | DefectStatus::IGNORE);
        assert_eq!(defect.common.ignore_author.as_deref(), Some("erin"));
        assert_eq!(defect.common.ignore_reason_type, Some(2));
        assert!(defect.invariant_violations().is_empty());
    }

    #[test]
    fn ignore_requires_author() {
        let mut defect = create(&obs(25), &ctx("10", 0)).unwrap();
        let mut request = ignore_request();
        request.ignore_author = "  ".to_string();
        assert!(ignore(&mut defect, &request, Utc::now()).is_err());
        assert!(!defect.common.status.contains(DefectStatus::IGNORE));
    }

    #[test]
    fn unignore_clears_metadata() {
        let mut defect = create(&obs(25), &ctx("10", 0)).unwrap();
        ignore(&mut defect, &ignore_request(), Utc::now()).unwrap();
        unignore(&mut defect).unwrap();
        assert_eq!(defect.common.status, DefectStatus::NEW);
        assert!(defect.common.ignore_time.is_none());
        assert!(defect.common.ignore_author.is_none());
        assert!(defect.common.ignore_reason.is_none());
    }

    #[test]
    fn unignore_requires_ignored_defect() {
        let mut defect = create(&obs(25), &ctx("10", 0)).unwrap();
        let err = unignore(&mut defect).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
    }

    #[test]
    fn mark_sets_and_clears_time() {
        let mut defect = create(&obs(25), &ctx("10", 0)).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap();
        mark(&mut defect, Mark::Tagged, at);
        assert_eq!(defect.common.mark, Some(Mark::Tagged));
        assert_eq!(defect.common.mark_time, Some(at.timestamp_millis()));
        mark(&mut defect, Mark::None, at);
        assert!(defect.common.mark_time.is_none());
    }

    #[test]
    fn attach_comment_leaves_status() {
        let mut defect = create(&obs(25), &ctx("10", 0)).unwrap();
        attach_comment(&mut defect, CodeComment::default());
        assert!(defect.code_comment.is_some());
        assert_eq!(defect.common.status, DefectStatus::NEW);
    }

    // -- Mask transitions --

    #[test]
    fn mask_sets_and_clears_exclude_time() {
        let mut defect = create(&obs(25), &ctx("10", 0)).unwrap();
        let first = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap();

        let change = apply_masks(&mut defect, MaskHits { path: true, checker: false }, first);
        assert_eq!(change.added, DefectStatus::PATH_MASK);
        assert_eq!(defect.common.exclude_time, Some(first.timestamp_millis()));

        let change = apply_masks(&mut defect, MaskHits { path: true, checker: true }, second);
        assert_eq!(change.added, DefectStatus::CHECKER_MASK);
        assert_eq!(defect.common.exclude_time, Some(first.timestamp_millis()));

        let change = apply_masks(&mut defect, MaskHits::default(), second);
        assert_eq!(change.removed, DefectStatus::ANY_MASK);
        assert!(defect.common.exclude_time.is_none());
        assert_eq!(defect.common.status, DefectStatus::NEW);
    }

    #[test]
    fn mask_is_independent_of_fixed_and_ignore() {
        let mut defect = create(&obs(25), &ctx("10", 0)).unwrap();
        fix(&mut defect, &ctx("11", 5)).unwrap();
        ignore(&mut defect, &ignore_request(), Utc::now()).unwrap();
        apply_masks(&mut defect, MaskHits { path: true, checker: false }, Utc::now());
        assert_eq!(
            defect.common.status,
            DefectStatus::FIXED | DefectStatus::IGNORE | DefectStatus::PATH_MASK
        );
        assert!(defect.invariant_violations().is_empty());
    }

    #[test]
    fn unchanged_mask_reports_no_change() {
        let mut defect = create(&obs(25), &ctx("10", 0)).unwrap();
        assert!(apply_masks(&mut defect, MaskHits::default(), Utc::now()).is_empty());
    }
}
