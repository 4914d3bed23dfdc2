//! Scan reconciliation: merge one scan's observations into a task's defects.
//!
//! Validates observations, resolves their identity against the stored
//! records, evaluates mask rules and applies the lifecycle transitions for the
//! whole batch. Per-record failures are collected into the summary instead of
//! aborting the batch. [`reconcile_and_store`] wraps the pure pass in a
//! transaction holding the task's advisory lock, so only one scan per task is
//! reconciled at a time.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use serde::Serialize;
use sqlx::PgPool;

use crate::errors::AppError;
use crate::models::ccn_defect::CcnDefect;
use crate::models::observation::{FunctionObservation, ScanBatch};
use crate::services::defect_store;
use crate::services::lifecycle::{self, IgnoreRequest, MaskChange, ScanContext, Transition};
use crate::services::masking::{MaskHits, MaskMatcher};
use crate::services::matching::{DefectIndex, MatchKey, MatchPolicy, MatchResult};

/// Whether mask rules are evaluated before or after fix decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationOrder {
    /// Masked records and observations take no part in create/persist/fix.
    #[default]
    MaskThenFix,
    /// Liveness is decided on the raw scan; masks are applied afterwards.
    FixThenMask,
}

impl FromStr for EvaluationOrder {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mask_then_fix" => Ok(Self::MaskThenFix),
            "fix_then_mask" => Ok(Self::FixThenMask),
            other => Err(AppError::Validation(format!(
                "Unknown evaluation order '{other}'"
            ))),
        }
    }
}

/// Policy knobs for a reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    pub order: EvaluationOrder,
    pub matching: MatchPolicy,
}

/// Failure affecting a single record of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileError {
    /// Index into the batch's observations, if the failure came from one.
    pub record_index: Option<usize>,
    pub func_signature: Option<String>,
    pub stage: String,
    pub code: String,
    pub message: String,
}

/// Counts for one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub task_id: i64,
    pub build_number: String,
    pub total_observed: usize,
    pub created: usize,
    pub persisted: usize,
    pub reopened: usize,
    pub fixed: usize,
    pub masked: usize,
    pub unmasked: usize,
    pub skipped_masked: usize,
    #[serde(rename = "errors")]
    pub error_count: usize,
    pub error_details: Vec<ReconcileError>,
}

/// Updated records for the task plus the pass summary.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub defects: Vec<CcnDefect>,
    pub summary: ReconcileSummary,
}

/// Reconcile one scan of a task against its current records.
///
/// `prior` is every current record of the task. The returned defect list
/// holds those records, updated, followed by the records created by this scan.
pub fn reconcile(
    prior: Vec<CcnDefect>,
    observations: &[FunctionObservation],
    masks: &MaskMatcher,
    ctx: &ScanContext,
    options: &ReconcileOptions,
) -> ReconcileOutcome {
    let mut summary = ReconcileSummary {
        task_id: ctx.task_id,
        build_number: ctx.build_number.clone(),
        total_observed: observations.len(),
        ..Default::default()
    };
    let mut errors = Vec::new();

    // 1. Records of another task are integrity faults; they are not touched or returned.
    let mut defects = Vec::with_capacity(prior.len() + observations.len());
    for defect in prior {
        if defect.task_id != ctx.task_id {
            let err = AppError::TaskMismatch {
                expected: ctx.task_id,
                found: defect.task_id,
            };
            record_error(&mut errors, None, &defect.func_signature, "load", err);
            continue;
        }
        defects.push(defect);
    }
    let mut index = DefectIndex::build(&defects);

    // 2. Validation. Records named by a rejected observation are protected from fix.
    let mut protected = HashSet::new();
    let mut valid = Vec::with_capacity(observations.len());
    let mut seen = HashSet::new();
    for (i, obs) in observations.iter().enumerate() {
        let result = lifecycle::validate_observation(obs, ctx).and_then(|()| {
            if seen.insert(obs.func_signature.as_str()) {
                Ok(())
            } else {
                Err(AppError::Conflict(format!(
                    "func_signature {} reported twice in one scan",
                    obs.func_signature
                )))
            }
        });
        match result {
            Ok(()) => valid.push(i),
            Err(err) => {
                protected.extend(index.signature_holders(&obs.func_signature, None));
                record_error(&mut errors, Some(i), &obs.func_signature, "validate", err);
            }
        }
    }

    // 3. Identity matching, one key at a time across the whole batch, so a
    //    weaker key never steals a record a stronger key would have matched.
    let mut matches: Vec<Option<usize>> = vec![None; observations.len()];
    let mut ambiguous: HashMap<usize, (MatchKey, Vec<usize>)> = HashMap::new();
    let mut pending = valid;
    for &key in options.matching.precedence() {
        let mut unmatched = Vec::with_capacity(pending.len());
        for i in pending {
            let obs = &observations[i];
            match index.resolve_key(obs, key) {
                MatchResult::Matched { index: d, key } => {
                    let rekey_conflict = key != MatchKey::Signature
                        && defects[d].func_signature != obs.func_signature
                        && !index
                            .signature_holders(&obs.func_signature, Some(d))
                            .is_empty();
                    if rekey_conflict {
                        protected.insert(d);
                        protected.extend(index.signature_holders(&obs.func_signature, None));
                        let err = AppError::Conflict(format!(
                            "{:?} match would re-key {} to a signature another defect holds",
                            key, defects[d].func_signature
                        ));
                        record_error(&mut errors, Some(i), &obs.func_signature, "match", err);
                        continue;
                    }
                    tracing::debug!(
                        task_id = ctx.task_id,
                        func_signature = %obs.func_signature,
                        matched_signature = %defects[d].func_signature,
                        key = ?key,
                        "Observation matched stored defect"
                    );
                    index.claim(d);
                    matches[i] = Some(d);
                }
                MatchResult::Ambiguous { key, candidates } => {
                    ambiguous.entry(i).or_insert((key, candidates));
                    unmatched.push(i);
                }
                MatchResult::New => unmatched.push(i),
            }
        }
        pending = unmatched;
    }

    let mut new_observations = Vec::with_capacity(pending.len());
    for i in pending {
        match ambiguous.remove(&i) {
            Some((key, candidates)) => {
                protected.extend(candidates.iter().copied());
                let err = AppError::Conflict(format!(
                    "{key:?} matches {} stored defects",
                    candidates.len()
                ));
                record_error(
                    &mut errors,
                    Some(i),
                    &observations[i].func_signature,
                    "match",
                    err,
                );
            }
            None => new_observations.push(i),
        }
    }

    // 4. Masks and liveness, in the configured order.
    let tool = ctx.tool_name.as_str();
    let observation_hits: Vec<MaskHits> = observations
        .iter()
        .map(|obs| masks.evaluate(obs.match_path(), Some(tool)))
        .collect();

    let pass = LivenessPass {
        observations,
        matches: &matches,
        new_observations: &new_observations,
        protected: &protected,
        ctx,
    };

    match options.order {
        EvaluationOrder::MaskThenFix => {
            let matched_by: HashMap<usize, usize> = matches
                .iter()
                .enumerate()
                .filter_map(|(i, m)| m.map(|d| (d, i)))
                .collect();
            for (d, defect) in defects.iter_mut().enumerate() {
                let hits = match matched_by.get(&d) {
                    Some(&i) => observation_hits[i],
                    None => stored_hits(masks, defect, tool),
                };
                tally_mask(&mut summary, lifecycle::apply_masks(defect, hits, ctx.scanned_at));
            }
            pass.run(&mut defects, Some(observation_hits.as_slice()), &mut summary, &mut errors);
        }
        EvaluationOrder::FixThenMask => {
            pass.run(&mut defects, None, &mut summary, &mut errors);
            for defect in defects.iter_mut() {
                let hits = stored_hits(masks, defect, tool);
                tally_mask(&mut summary, lifecycle::apply_masks(defect, hits, ctx.scanned_at));
            }
        }
    }

    summary.error_count = errors.len();
    summary.error_details = errors;

    tracing::info!(
        task_id = summary.task_id,
        build_number = %summary.build_number,
        observed = summary.total_observed,
        created = summary.created,
        persisted = summary.persisted,
        reopened = summary.reopened,
        fixed = summary.fixed,
        masked = summary.masked,
        unmasked = summary.unmasked,
        skipped_masked = summary.skipped_masked,
        errors = summary.error_count,
        "Scan reconciled"
    );

    ReconcileOutcome { defects, summary }
}

/// Create, persist and fix decisions for one pass.
struct LivenessPass<'a> {
    observations: &'a [FunctionObservation],
    matches: &'a [Option<usize>],
    new_observations: &'a [usize],
    protected: &'a HashSet<usize>,
    ctx: &'a ScanContext,
}

impl LivenessPass<'_> {
    /// With `mask_hits`, masked observations and masked records are left out.
    fn run(
        &self,
        defects: &mut Vec<CcnDefect>,
        mask_hits: Option<&[MaskHits]>,
        summary: &mut ReconcileSummary,
        errors: &mut Vec<ReconcileError>,
    ) {
        let masked_observation = |i: usize| mask_hits.is_some_and(|hits| hits[i].any());

        let mut observed = HashSet::new();
        for (i, matched) in self.matches.iter().enumerate() {
            let Some(d) = *matched else {
                continue;
            };
            observed.insert(d);
            if masked_observation(i) {
                summary.skipped_masked += 1;
                continue;
            }
            let obs = &self.observations[i];
            match lifecycle::persist(&mut defects[d], obs, self.ctx) {
                Ok(Transition::Reopened) => summary.reopened += 1,
                Ok(_) => summary.persisted += 1,
                Err(err) => record_error(errors, Some(i), &obs.func_signature, "persist", err),
            }
        }

        for (d, defect) in defects.iter_mut().enumerate() {
            if observed.contains(&d) || self.protected.contains(&d) {
                continue;
            }
            if mask_hits.is_some() && defect.common.status.is_masked() {
                continue;
            }
            match lifecycle::fix(defect, self.ctx) {
                Ok(Transition::Fixed) => {
                    tracing::debug!(
                        task_id = defect.task_id,
                        func_signature = %defect.func_signature,
                        "Defect absent from scan; marked fixed"
                    );
                    summary.fixed += 1;
                }
                Ok(_) => {}
                Err(err) => {
                    let signature = defect.func_signature.clone();
                    record_error(errors, None, &signature, "fix", err);
                }
            }
        }

        for &i in self.new_observations {
            if masked_observation(i) {
                summary.skipped_masked += 1;
                continue;
            }
            let obs = &self.observations[i];
            match lifecycle::create(obs, self.ctx) {
                Ok(defect) => {
                    defects.push(defect);
                    summary.created += 1;
                }
                Err(err) => record_error(errors, Some(i), &obs.func_signature, "create", err),
            }
        }
    }
}

fn stored_hits(masks: &MaskMatcher, defect: &CcnDefect, tool: &str) -> MaskHits {
    let checker = defect.common.tool_name.as_deref().unwrap_or(tool);
    masks.evaluate(defect.common.match_path(), Some(checker))
}

fn tally_mask(summary: &mut ReconcileSummary, change: MaskChange) {
    if !change.added.is_empty() {
        summary.masked += 1;
    }
    if !change.removed.is_empty() {
        summary.unmasked += 1;
    }
}

fn record_error(
    errors: &mut Vec<ReconcileError>,
    record_index: Option<usize>,
    func_signature: &str,
    stage: &str,
    err: AppError,
) {
    if err.is_integrity_fault() {
        tracing::error!(
            stage,
            record_index = ?record_index,
            func_signature,
            error = %err,
            "Defect integrity fault"
        );
    } else {
        tracing::warn!(
            stage,
            record_index = ?record_index,
            func_signature,
            error = %err,
            "Observation rejected"
        );
    }
    errors.push(ReconcileError {
        record_index,
        func_signature: Some(func_signature.to_string()).filter(|s| !s.is_empty()),
        stage: stage.to_string(),
        code: err.code().to_string(),
        message: err.to_string(),
    });
}

/// Read a scan batch document from disk.
pub fn load_batch(path: &Path) -> Result<ScanBatch, AppError> {
    let raw = std::fs::read(path).map_err(|e| {
        AppError::NotFound(format!("Scan batch {}: {e}", path.display()))
    })?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Reconcile a batch against storage in one transaction under the task lock.
pub async fn reconcile_and_store(
    pool: &PgPool,
    batch: &ScanBatch,
    options: &ReconcileOptions,
) -> Result<ReconcileOutcome, AppError> {
    let masks = batch.mask_rules.compile()?;
    let ctx = ScanContext::new(
        batch.task_id,
        batch.tool_name.clone(),
        batch.build_number.clone(),
        Utc::now(),
    );

    let mut tx = pool.begin().await?;
    defect_store::lock_task(&mut *tx, batch.task_id).await?;

    let prior = defect_store::load_current(&mut *tx, batch.task_id).await?;
    let mut outcome = reconcile(prior, &batch.observations, &masks, &ctx, options);
    defect_store::save_all(&mut *tx, &mut outcome.defects).await?;

    tx.commit().await?;
    Ok(outcome)
}

/// Operator ignore through storage.
pub async fn ignore_defect(
    pool: &PgPool,
    task_id: i64,
    func_signature: &str,
    request: &IgnoreRequest,
) -> Result<CcnDefect, AppError> {
    let mut tx = pool.begin().await?;
    defect_store::lock_task(&mut *tx, task_id).await?;

    let mut defect = defect_store::find_one(&mut *tx, task_id, func_signature).await?;
    lifecycle::ignore(&mut defect, request, Utc::now())?;
    defect_store::save_one(&mut *tx, &mut defect).await?;

    tx.commit().await?;
    tracing::info!(
        task_id,
        func_signature,
        ignore_author = %request.ignore_author,
        status = %defect.common.status,
        "Defect ignored"
    );
    Ok(defect)
}

/// Operator un-ignore through storage.
pub async fn unignore_defect(
    pool: &PgPool,
    task_id: i64,
    func_signature: &str,
) -> Result<CcnDefect, AppError> {
    let mut tx = pool.begin().await?;
    defect_store::lock_task(&mut *tx, task_id).await?;

    let mut defect = defect_store::find_one(&mut *tx, task_id, func_signature).await?;
    lifecycle::unignore(&mut defect)?;
    defect_store::save_one(&mut *tx, &mut defect).await?;

    tx.commit().await?;
    tracing::info!(task_id, func_signature, status = %defect.common.status, "Defect un-ignored");
    Ok(defect)
}
