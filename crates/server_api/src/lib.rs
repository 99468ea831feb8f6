use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use shared::{
    domain::{BusinessId, KpiId, NewTask, RecurrenceMeta, TaskId, TaskStatus},
    error::{ApiError, ErrorCode},
    protocol::{
        CreateKpiRequest, CreateTaskRequest, KpiPayload, KpiStats, TaskPayload,
        UpdateKpiRequest,
    },
};
use storage::{KpiPatch, NewKpi, Storage, StoredKpi, StoredTask};
use xero::XeroApi;

pub mod callback;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub xero: Arc<dyn XeroApi>,
}

pub async fn list_kpis(ctx: &ApiContext, business_id: BusinessId) -> Result<Vec<KpiPayload>, ApiError> {
    let kpis = ctx
        .storage
        .list_kpis(business_id)
        .await
        .map_err(internal)?;
    Ok(kpis.into_iter().map(kpi_payload).collect())
}

pub async fn create_kpi(ctx: &ApiContext, req: CreateKpiRequest) -> Result<KpiPayload, ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("kpi name cannot be empty"));
    }

    let created = ctx
        .storage
        .create_kpi(&NewKpi {
            business_id: BusinessId(req.business_id),
            name: name.to_string(),
            description: req.description,
            unit: req.unit,
            target: req.target,
            current_value: req.current_value,
        })
        .await
        .map_err(internal)?;
    Ok(kpi_payload(created))
}

pub async fn update_kpi(
    ctx: &ApiContext,
    kpi_id: KpiId,
    req: UpdateKpiRequest,
) -> Result<KpiPayload, ApiError> {
    if let Some(name) = req.name.as_deref() {
        if name.trim().is_empty() {
            return Err(ApiError::validation("kpi name cannot be empty"));
        }
    }

    let patch = KpiPatch {
        name: req.name,
        description: req.description,
        unit: req.unit,
        target: req.target,
        current_value: req.current_value,
    };
    let updated = ctx
        .storage
        .update_kpi(kpi_id, BusinessId(req.business_id), &patch)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("kpi not found"))?;
    Ok(kpi_payload(updated))
}

pub async fn delete_kpi(
    ctx: &ApiContext,
    kpi_id: KpiId,
    business_id: BusinessId,
) -> Result<u64, ApiError> {
    let deleted = ctx
        .storage
        .delete_kpi(kpi_id, business_id)
        .await
        .map_err(internal)?;
    if deleted == 0 {
        return Err(ApiError::not_found("kpi not found"));
    }
    Ok(deleted)
}

/// Aggregates the KPI health summary shown on the dashboard. Attainment is
/// averaged over KPIs that carry both a current value and a non-zero target.
pub async fn kpi_stats(ctx: &ApiContext, business_id: BusinessId) -> Result<KpiStats, ApiError> {
    let kpis = ctx
        .storage
        .list_kpis(business_id)
        .await
        .map_err(internal)?;

    let total = kpis.len() as u64;
    let with_target = kpis.iter().filter(|k| k.target.is_some()).count() as u64;
    let on_target = kpis
        .iter()
        .filter(|k| matches!((k.current_value, k.target), (Some(c), Some(t)) if c >= t))
        .count() as u64;

    let attainments: Vec<f64> = kpis
        .iter()
        .filter_map(|k| match (k.current_value, k.target) {
            (Some(current), Some(target)) if target != 0.0 => Some(current / target),
            _ => None,
        })
        .collect();
    let average_attainment = if attainments.is_empty() {
        None
    } else {
        Some(attainments.iter().sum::<f64>() / attainments.len() as f64)
    };

    Ok(KpiStats {
        total,
        with_target,
        on_target,
        average_attainment,
    })
}

pub async fn list_tasks(
    ctx: &ApiContext,
    business_id: BusinessId,
    status: Option<TaskStatus>,
) -> Result<Vec<TaskPayload>, ApiError> {
    let tasks = ctx
        .storage
        .list_tasks(business_id, status)
        .await
        .map_err(internal)?;
    Ok(tasks.into_iter().map(task_payload).collect())
}

pub async fn create_task(ctx: &ApiContext, req: CreateTaskRequest) -> Result<TaskPayload, ApiError> {
    let title = req.title.trim();
    if title.is_empty() {
        return Err(ApiError::validation("task title cannot be empty"));
    }

    let recurrence = match req.recurrence_pattern {
        Some(pattern) => {
            if !recurrence::is_valid(&pattern) {
                return Err(ApiError::validation(format!(
                    "unrecognized recurrence pattern '{pattern}'"
                )));
            }
            Some(RecurrenceMeta {
                pattern,
                source_task_id: None,
                last_completed: None,
            })
        }
        None => None,
    };

    let created = ctx
        .storage
        .insert_task(&NewTask {
            business_id: BusinessId(req.business_id),
            title: title.to_string(),
            notes: req.notes,
            status: TaskStatus::Pending,
            due_date: req.due_date,
            scheduled_date: req.scheduled_date,
            recurrence,
        })
        .await
        .map_err(internal)?;
    Ok(task_payload(created))
}

/// Marks a task as completed and, when the task recurs, persists the
/// regenerated follow-up task in the same request.
pub async fn complete_task(
    ctx: &ApiContext,
    business_id: BusinessId,
    task_id: TaskId,
    completed_on: Option<NaiveDate>,
) -> Result<(TaskPayload, Option<TaskPayload>), ApiError> {
    let completed_on = completed_on.unwrap_or_else(|| Utc::now().date_naive());

    let existing = ctx
        .storage
        .get_task(task_id, business_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("task not found"))?;
    if existing.status == TaskStatus::Completed {
        return Err(ApiError::validation("task is already completed"));
    }

    let completed = ctx
        .storage
        .mark_task_completed(task_id, business_id, completed_on)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::validation("task is already completed"))?;

    let regenerated = match recurrence::regenerate(&completed.record(), completed_on) {
        Some(follow_up) => Some(task_payload(
            ctx.storage.insert_task(&follow_up).await.map_err(internal)?,
        )),
        None => None,
    };

    Ok((task_payload(completed), regenerated))
}

fn kpi_payload(kpi: StoredKpi) -> KpiPayload {
    KpiPayload {
        kpi_id: kpi.kpi_id,
        business_id: kpi.business_id,
        name: kpi.name,
        description: kpi.description,
        unit: kpi.unit,
        target: kpi.target,
        current_value: kpi.current_value,
        created_at: kpi.created_at,
        updated_at: kpi.updated_at,
    }
}

fn task_payload(task: StoredTask) -> TaskPayload {
    TaskPayload {
        task_id: task.task_id,
        business_id: task.business_id,
        title: task.title,
        notes: task.notes,
        status: task.status,
        due_date: task.due_date,
        scheduled_date: task.scheduled_date,
        recurrence: task.recurrence,
        created_at: task.created_at,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
