//! Job record model and DTOs.

use std::fmt;

use labrun_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;

/// Marks fingerprint keys of unnamed jobs.
const UNNAMED_KEY_PREFIX: char = '#';

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: DbId,
    pub name: String,
    pub config: Json<Value>,
    /// Outcome of the most recent successful run; empty before the first.
    pub result: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Job {
    /// Name handed to the engine and used in logs: the job name, or
    /// `job_<id>` for unnamed jobs.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("job_{}", self.id)
        } else {
            self.name.clone()
        }
    }

    /// Key under which this job's configuration fingerprint is stored.
    ///
    /// Unnamed jobs use `#<id>`. Names starting with `#` get a second `#`
    /// prepended, so no name shares a key with an unnamed job.
    pub fn fingerprint_key(&self) -> String {
        if self.name.is_empty() {
            format!("{UNNAMED_KEY_PREFIX}{}", self.id)
        } else if self.name.starts_with(UNNAMED_KEY_PREFIX) {
            format!("{UNNAMED_KEY_PREFIX}{}", self.name)
        } else {
            self.name.clone()
        }
    }
}

/// A result submitted either as text (`"0.42"`) or as a JSON number
/// (`0.42`). Numbers are stored in their JSON text form.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    Text(String),
    Number(serde_json::Number),
}

impl ResultValue {
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Number(n) => n.to_string(),
        }
    }
}

impl From<&str> for ResultValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Fields of a partial update. Absent, empty-string, `null` and empty-object
/// values leave the stored field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateJob {
    pub name: Option<String>,
    pub config: Option<Value>,
    pub result: Option<ResultValue>,
}

impl UpdateJob {
    /// The new name, if one was provided and is non-empty.
    pub fn name_value(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.is_empty())
    }

    /// The new config, if one was provided and is non-empty.
    pub fn config_value(&self) -> Option<&Value> {
        self.config.as_ref().filter(|config| match config {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            _ => true,
        })
    }

    /// The new result as text, if one was provided and is non-empty.
    pub fn result_value(&self) -> Option<String> {
        self.result
            .clone()
            .map(ResultValue::into_text)
            .filter(|text| !text.is_empty())
    }
}

/// DTO for `POST /api/v1/jobs`: updates the job when `id` exists, creates
/// it otherwise.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpsertJob {
    pub id: Option<DbId>,
    #[serde(flatten)]
    pub fields: UpdateJob,
}

/// Request body accepted by bulk endpoints: one item or a list of items.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::Many(items) => items,
            Self::One(item) => vec![item],
        }
    }
}

/// Selects a single job either by id or by name (first match by id order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobLookup {
    Id(DbId),
    Name(String),
}

impl JobLookup {
    /// Build a lookup from optional query parameters. `name` takes priority
    /// over `id`; returns `None` when neither is given.
    pub fn from_params(id: Option<DbId>, name: Option<String>) -> Option<Self> {
        match (name, id) {
            (Some(name), _) => Some(Self::Name(name)),
            (None, Some(id)) => Some(Self::Id(id)),
            (None, None) => None,
        }
    }
}

impl fmt::Display for JobLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {id}"),
            Self::Name(name) => write!(f, "name '{name}'"),
        }
    }
}

/// Query parameters for the `?id=` / `?name=` selectors.
#[derive(Debug, Default, Deserialize)]
pub struct JobLookupQuery {
    pub id: Option<DbId>,
    pub name: Option<String>,
}

impl JobLookupQuery {
    pub fn lookup(self) -> Option<JobLookup> {
        JobLookup::from_params(self.id, self.name)
    }
}

/// Outcome of importing configuration sections as job records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub created: usize,
    pub updated: usize,
}
