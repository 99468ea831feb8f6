use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{BusinessId, KpiId, RecurrenceMeta, TaskId, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiPayload {
    pub kpi_id: KpiId,
    pub business_id: BusinessId,
    pub name: String,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub target: Option<f64>,
    pub current_value: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateKpiRequest {
    pub business_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub target: Option<f64>,
    #[serde(default)]
    pub current_value: Option<f64>,
}

/// Partial patch; absent fields are left untouched.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct UpdateKpiRequest {
    pub business_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub target: Option<f64>,
    #[serde(default)]
    pub current_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiListResponse {
    pub success: bool,
    pub kpis: Vec<KpiPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiResponse {
    pub success: bool,
    pub kpi: KpiPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiDeleteResponse {
    pub success: bool,
    pub deleted: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiStats {
    pub total: u64,
    pub with_target: u64,
    pub on_target: u64,
    /// Mean of `current / target` over KPIs that have both values and a
    /// non-zero target. `None` when no KPI qualifies.
    pub average_attainment: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiStatsResponse {
    pub success: bool,
    pub stats: KpiStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_id: TaskId,
    pub business_id: BusinessId,
    pub title: String,
    pub notes: Option<String>,
    pub status: TaskStatus,
    pub due_date: Option<NaiveDate>,
    pub scheduled_date: Option<NaiveDate>,
    pub recurrence: Option<RecurrenceMeta>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateTaskRequest {
    pub business_id: i64,
    pub title: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub scheduled_date: Option<NaiveDate>,
    #[serde(default)]
    pub recurrence_pattern: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CompleteTaskRequest {
    pub business_id: i64,
    /// Completion date; defaults to today when absent.
    #[serde(default)]
    pub completed_on: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskListResponse {
    pub success: bool,
    pub tasks: Vec<TaskPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub success: bool,
    pub task: TaskPayload,
}

/// Completion result: the completed task plus the regenerated follow-up when
/// the task carried a valid recurrence pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletionResponse {
    pub success: bool,
    pub completed: TaskPayload,
    pub regenerated: Option<TaskPayload>,
}
