use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(BusinessId);
id_newtype!(KpiId);
id_newtype!(TaskId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(TaskStatus::Pending),
            "completed" => Some(TaskStatus::Completed),
            _ => None,
        }
    }
}

/// Recurrence bookkeeping carried by a task row. `pattern` keeps the
/// user-entered string; it is parsed into a closed enum at the point of use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceMeta {
    pub pattern: String,
    pub source_task_id: Option<TaskId>,
    pub last_completed: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub business_id: BusinessId,
    pub title: String,
    pub notes: Option<String>,
    pub status: TaskStatus,
    pub due_date: Option<NaiveDate>,
    pub scheduled_date: Option<NaiveDate>,
    pub recurrence: Option<RecurrenceMeta>,
}

/// A task that has not been persisted yet (no id). Produced by task creation
/// requests and by recurrence regeneration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub business_id: BusinessId,
    pub title: String,
    pub notes: Option<String>,
    pub status: TaskStatus,
    pub due_date: Option<NaiveDate>,
    pub scheduled_date: Option<NaiveDate>,
    pub recurrence: Option<RecurrenceMeta>,
}
