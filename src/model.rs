//! Domain types shared by the stores, the sync core and the derived views.

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Task ids are millisecond timestamps, so they sort by creation.
pub type TaskId = i64;

/// Legacy marker written by older builds when a session had no task.
pub const NO_TASK_SENTINEL: &str = "No task selected";

static LAST_TASK_ID: AtomicI64 = AtomicI64::new(0);

/// Allocate a new task id from the wall clock.
///
/// Two calls within the same millisecond still yield distinct, increasing ids.
pub fn next_task_id() -> TaskId {
  let now = Utc::now().timestamp_millis();
  let mut last = LAST_TASK_ID.load(Ordering::Relaxed);
  loop {
    let next = now.max(last + 1);
    match LAST_TASK_ID.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
      Ok(_) => return next,
      Err(actual) => last = actual,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
  #[default]
  University,
  Career,
  Other,
}

impl Category {
  pub const ALL: [Category; 3] = [Category::University, Category::Career, Category::Other];

  pub fn as_str(self) -> &'static str {
    match self {
      Category::University => "university",
      Category::Career => "career",
      Category::Other => "other",
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  High,
  Medium,
  #[default]
  Low,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
  Critical,
  Upcoming,
  #[default]
  Flexible,
}

/// Eisenhower matrix cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quadrant {
  Do,
  Schedule,
  Delegate,
  Eliminate,
}

impl Quadrant {
  pub const ALL: [Quadrant; 4] = [
    Quadrant::Do,
    Quadrant::Schedule,
    Quadrant::Delegate,
    Quadrant::Eliminate,
  ];

  /// Only the exact high/low x critical/flexible pairs get their own cell;
  /// any other combination lands in `Eliminate`.
  pub fn of(priority: Priority, urgency: Urgency) -> Self {
    match (priority, urgency) {
      (Priority::High, Urgency::Critical) => Quadrant::Do,
      (Priority::High, Urgency::Flexible) => Quadrant::Schedule,
      (Priority::Low, Urgency::Critical) => Quadrant::Delegate,
      _ => Quadrant::Eliminate,
    }
  }

  pub fn title(self) -> &'static str {
    match self {
      Quadrant::Do => "Do",
      Quadrant::Schedule => "Schedule",
      Quadrant::Delegate => "Delegate",
      Quadrant::Eliminate => "Eliminate",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerMode {
  Light,
  Deep,
  Custom,
}

impl TimerMode {
  pub const ALL: [TimerMode; 3] = [TimerMode::Light, TimerMode::Deep, TimerMode::Custom];

  pub fn as_str(self) -> &'static str {
    match self {
      TimerMode::Light => "light",
      TimerMode::Deep => "deep",
      TimerMode::Custom => "custom",
    }
  }
}

/// A user-created work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub id: TaskId,
  pub name: String,
  pub estimated_minutes: u32,
  #[serde(default)]
  pub category: Category,
  #[serde(default, deserialize_with = "blank_as_none")]
  pub custom_category: Option<String>,
  #[serde(default, deserialize_with = "blank_as_none")]
  pub course: Option<String>,
  #[serde(default)]
  pub priority: Priority,
  #[serde(default)]
  pub urgency: Urgency,
  #[serde(default, deserialize_with = "blank_as_none_date")]
  pub deadline: Option<NaiveDate>,
  #[serde(default)]
  pub completed: bool,
  #[serde(default)]
  pub completed_at: Option<DateTime<Utc>>,
  #[serde(default = "Utc::now")]
  pub created_at: DateTime<Utc>,
}

impl Task {
  pub fn new(id: TaskId, fields: TaskFields, created_at: DateTime<Utc>) -> Self {
    Self {
      id,
      name: fields.name,
      estimated_minutes: fields.estimated_minutes,
      category: fields.category,
      custom_category: fields.custom_category,
      course: fields.course,
      priority: fields.priority,
      urgency: fields.urgency,
      deadline: fields.deadline,
      completed: false,
      completed_at: None,
      created_at,
    }
  }

  /// Overwrite every user-editable field. Identity and completion are untouched.
  pub fn apply(&mut self, fields: &TaskFields) {
    self.name = fields.name.clone();
    self.estimated_minutes = fields.estimated_minutes;
    self.category = fields.category;
    self.custom_category = fields.custom_category.clone();
    self.course = fields.course.clone();
    self.priority = fields.priority;
    self.urgency = fields.urgency;
    self.deadline = fields.deadline;
  }

  /// `completed_at` is set exactly when the task becomes completed and cleared otherwise.
  pub fn set_completed(&mut self, completed: bool, at: DateTime<Utc>) {
    self.completed = completed;
    self.completed_at = completed.then_some(at);
  }

  pub fn quadrant(&self) -> Quadrant {
    Quadrant::of(self.priority, self.urgency)
  }

  /// Completed before `cutoff`, so the retention sweep may delete it.
  pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
    self.completed && self.completed_at.is_some_and(|at| at < cutoff)
  }
}

/// The user-editable part of a task, already validated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskFields {
  pub name: String,
  pub estimated_minutes: u32,
  pub category: Category,
  pub custom_category: Option<String>,
  pub course: Option<String>,
  pub priority: Priority,
  pub urgency: Urgency,
  pub deadline: Option<NaiveDate>,
}

/// Raw form input for creating or editing a task.
#[derive(Debug, Clone, Default)]
pub struct TaskInput {
  pub name: String,
  pub hours: u32,
  pub minutes: u32,
  pub category: Category,
  pub custom_category: Option<String>,
  pub course: Option<String>,
  pub priority: Priority,
  pub urgency: Urgency,
  pub deadline: Option<NaiveDate>,
}

impl TaskInput {
  /// Validate the form. Returns `None` for a blank name or a zero duration.
  pub fn validate(&self) -> Option<TaskFields> {
    let name = self.name.trim();
    let estimated_minutes = self.hours.checked_mul(60)?.checked_add(self.minutes)?;
    if name.is_empty() || estimated_minutes == 0 {
      return None;
    }

    let custom_category = match self.category {
      Category::Other => non_blank(self.custom_category.as_deref()),
      _ => None,
    };

    Some(TaskFields {
      name: name.to_string(),
      estimated_minutes,
      category: self.category,
      custom_category,
      course: non_blank(self.course.as_deref()),
      priority: self.priority,
      urgency: self.urgency,
      deadline: self.deadline,
    })
  }
}

fn non_blank(s: Option<&str>) -> Option<String> {
  s.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

/// One completed work interval. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
  pub mode: TimerMode,
  /// Display name of the task at logging time. Not a foreign key.
  #[serde(default, deserialize_with = "blank_as_none")]
  pub task: Option<String>,
  #[serde(default)]
  pub work_minutes: u32,
  pub completed_at: DateTime<Utc>,
  pub date: NaiveDate,
}

impl Session {
  pub fn new(
    mode: TimerMode,
    task: Option<String>,
    work_minutes: u32,
    completed_at: DateTime<Utc>,
  ) -> Self {
    Self {
      mode,
      task,
      work_minutes,
      completed_at,
      date: completed_at.with_timezone(&Local).date_naive(),
    }
  }

  /// Task name usable for joins, skipping the legacy "no task" marker.
  pub fn task_name(&self) -> Option<&str> {
    self
      .task
      .as_deref()
      .filter(|name| *name != NO_TASK_SENTINEL)
  }
}

/// Everything the local store persists under its main key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreData {
  #[serde(default, alias = "todos")]
  pub tasks: Vec<Task>,
  #[serde(default)]
  pub sessions: Vec<Session>,
}

/// An authenticated user as reported by the auth service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
  pub id: String,
  #[serde(default)]
  pub email: Option<String>,
}

fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
  D: Deserializer<'de>,
{
  let v: Option<String> = Option::deserialize(deserializer)?;
  Ok(v.filter(|s| !s.trim().is_empty()))
}

fn blank_as_none_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
  D: Deserializer<'de>,
{
  match blank_as_none(deserializer)? {
    Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    None => Ok(None),
  }
}
