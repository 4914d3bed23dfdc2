//! PostgreSQL persistence for CCN defects.
//!
//! Each record is stored as its wire document in a JSONB column, with the
//! identity columns alongside for lookup and uniqueness. All functions take a
//! connection so callers can run them inside one transaction.

use sqlx::types::Json;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::ccn_defect::CcnDefect;

/// Serialize work on a task for the rest of the current transaction.
pub async fn lock_task(conn: &mut PgConnection, task_id: i64) -> Result<(), AppError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(task_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Every current record of a task.
pub async fn load_current(conn: &mut PgConnection, task_id: i64) -> Result<Vec<CcnDefect>, AppError> {
    let rows = sqlx::query_scalar::<_, Json<CcnDefect>>(
        "SELECT document FROM ccn_defects WHERE task_id = $1 ORDER BY created_at, id",
    )
    .bind(task_id)
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().map(|Json(defect)| defect).collect())
}

/// Look up one record by its identity.
pub async fn find_one(
    conn: &mut PgConnection,
    task_id: i64,
    func_signature: &str,
) -> Result<CcnDefect, AppError> {
    sqlx::query_scalar::<_, Json<CcnDefect>>(
        "SELECT document FROM ccn_defects WHERE task_id = $1 AND func_signature = $2",
    )
    .bind(task_id)
    .bind(func_signature)
    .fetch_optional(conn)
    .await?
    .map(|Json(defect)| defect)
    .ok_or_else(|| {
        AppError::NotFound(format!(
            "Defect {func_signature} not found for task {task_id}"
        ))
    })
}

/// Insert or update one record, assigning its `_id` on first save.
pub async fn save_one(conn: &mut PgConnection, defect: &mut CcnDefect) -> Result<(), AppError> {
    let violations = defect.invariant_violations();
    if !violations.is_empty() {
        tracing::warn!(
            task_id = defect.task_id,
            func_signature = %defect.func_signature,
            violations = ?violations,
            "Saving defect with invariant violations"
        );
    }

    let id = match defect.entity_id.as_deref() {
        Some(raw) => Uuid::parse_str(raw)
            .map_err(|e| AppError::Validation(format!("Invalid defect _id '{raw}': {e}")))?,
        None => {
            let id = Uuid::now_v7();
            defect.entity_id = Some(id.to_string());
            id
        }
    };

    sqlx::query(
        r#"
        INSERT INTO ccn_defects (id, task_id, func_signature, status, document)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO UPDATE
        SET func_signature = EXCLUDED.func_signature,
            status = EXCLUDED.status,
            document = EXCLUDED.document,
            updated_at = NOW()
        "#,
    )
    .bind(id)
    .bind(defect.task_id)
    .bind(&defect.func_signature)
    .bind(defect.common.status.bits())
    .bind(Json(&*defect))
    .execute(conn)
    .await?;
    Ok(())
}

/// Save every record of a reconciliation pass.
pub async fn save_all(conn: &mut PgConnection, defects: &mut [CcnDefect]) -> Result<(), AppError> {
    for defect in defects.iter_mut() {
        save_one(&mut *conn, defect).await?;
    }
    tracing::debug!(count = defects.len(), "Defects saved");
    Ok(())
}
