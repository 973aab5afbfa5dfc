//! Read-only projections over a task/session snapshot.
//!
//! Nothing here touches a store or the cache; every function takes the slices
//! it needs and returns a fresh value for the CLI to print.

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, Utc};
use std::collections::{BTreeSet, HashMap};

use crate::config::ModesConfig;
use crate::model::{Category, Quadrant, Session, Task, TimerMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tab {
  #[default]
  Current,
  Completed,
}

/// Tasks shown for a tab, optionally narrowed to one deadline date.
pub fn filter_list(tasks: &[Task], tab: Tab, date: Option<NaiveDate>) -> Vec<&Task> {
  tasks
    .iter()
    .filter(|task| match tab {
      Tab::Current => !task.completed,
      Tab::Completed => task.completed,
    })
    .filter(|task| date.is_none() || task.deadline == date)
    .collect()
}

/// How close a deadline is, relative to `today`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineStatus {
  Overdue,
  /// Today or tomorrow
  Due,
  /// Within three days
  Soon,
  Later,
}

pub fn deadline_status(deadline: NaiveDate, today: NaiveDate) -> DeadlineStatus {
  match (deadline - today).num_days() {
    d if d < 0 => DeadlineStatus::Overdue,
    0 | 1 => DeadlineStatus::Due,
    2 | 3 => DeadlineStatus::Soon,
    _ => DeadlineStatus::Later,
  }
}

/// Active tasks of one category grouped by quadrant.
#[derive(Debug, Default)]
pub struct Matrix<'a> {
  cells: HashMap<Quadrant, Vec<&'a Task>>,
}

impl<'a> Matrix<'a> {
  pub fn cell(&self, quadrant: Quadrant) -> &[&'a Task] {
    self.cells.get(&quadrant).map(Vec::as_slice).unwrap_or(&[])
  }
}

pub fn matrix(tasks: &[Task], category: Category) -> Matrix<'_> {
  let mut matrix = Matrix::default();
  for task in tasks
    .iter()
    .filter(|task| !task.completed && task.category == category)
  {
    matrix.cells.entry(task.quadrant()).or_default().push(task);
  }
  matrix
}

/// Calendar marks: deadlines of tasks not yet done.
pub fn deadline_dates(tasks: &[Task]) -> BTreeSet<NaiveDate> {
  tasks
    .iter()
    .filter(|task| !task.completed)
    .filter_map(|task| task.deadline)
    .collect()
}

/// Work intervals needed to cover `estimated_minutes` in each mode.
pub fn pomodoro_estimate(estimated_minutes: u32, modes: &ModesConfig) -> Vec<(TimerMode, u32)> {
  TimerMode::ALL
    .iter()
    .map(|&mode| {
      let work = modes.work_minutes(mode).max(1);
      (mode, estimated_minutes.div_ceil(work))
    })
    .collect()
}

/// "1h 30m", "2h", "45m"
pub fn format_duration(minutes: u32) -> String {
  let (hours, mins) = (minutes / 60, minutes % 60);
  match (hours, mins) {
    (0, m) => format!("{}m", m),
    (h, 0) => format!("{}h", h),
    (h, m) => format!("{}h {}m", h, m),
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DailyStats {
  pub sessions: usize,
  pub minutes: u32,
}

pub fn daily_stats(sessions: &[Session], today: NaiveDate) -> DailyStats {
  sessions
    .iter()
    .filter(|session| session.date == today)
    .fold(DailyStats::default(), |acc, session| DailyStats {
      sessions: acc.sessions + 1,
      minutes: acc.minutes + session.work_minutes,
    })
}

/// A Monday to Sunday week, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekRange {
  pub start: NaiveDate,
  pub end: NaiveDate,
}

impl WeekRange {
  pub fn contains(&self, date: NaiveDate) -> bool {
    self.start <= date && date <= self.end
  }

  fn contains_instant(&self, at: Option<DateTime<Utc>>) -> bool {
    at.is_some_and(|at| self.contains(at.with_timezone(&Local).date_naive()))
  }

  pub fn label(&self) -> String {
    format!(
      "{} - {}",
      self.start.format("%b %-d"),
      self.end.format("%b %-d, %Y")
    )
  }
}

/// The week containing `today`, shifted by `offset` weeks (negative is earlier).
pub fn week_range(today: NaiveDate, offset: i64) -> WeekRange {
  let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
  let start = monday + Duration::weeks(offset);
  WeekRange {
    start,
    end: start + Duration::days(6),
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WeeklyOverview {
  pub focus_minutes: u32,
  pub sessions: usize,
  pub by_mode: Vec<(TimerMode, usize)>,
  pub tasks_completed: usize,
  pub tasks_created: usize,
  pub created_and_completed: usize,
  /// Percent, rounded; `None` when no task was created that week
  pub completion_rate: Option<u32>,
}

/// `sessions` must already be limited to the week.
pub fn weekly_overview(sessions: &[Session], tasks: &[Task], week: &WeekRange) -> WeeklyOverview {
  let by_mode = [TimerMode::Deep, TimerMode::Light, TimerMode::Custom]
    .into_iter()
    .map(|mode| (mode, sessions.iter().filter(|s| s.mode == mode).count()))
    .filter(|(_, count)| *count > 0)
    .collect();

  let created: Vec<&Task> = tasks
    .iter()
    .filter(|task| week.contains_instant(Some(task.created_at)))
    .collect();
  let created_and_completed = created.iter().filter(|task| task.completed).count();
  let completion_rate = (!created.is_empty())
    .then(|| (created_and_completed as f64 / created.len() as f64 * 100.0).round() as u32);

  WeeklyOverview {
    focus_minutes: sessions.iter().map(|s| s.work_minutes).sum(),
    sessions: sessions.len(),
    by_mode,
    tasks_completed: tasks
      .iter()
      .filter(|task| task.completed && week.contains_instant(task.completed_at))
      .count(),
    tasks_created: created.len(),
    created_and_completed,
    completion_rate,
  }
}

/// Last task with a given name wins, matching how a later entry shadows an
/// earlier one in a name-keyed map.
fn tasks_by_name(tasks: &[Task]) -> HashMap<&str, &Task> {
  tasks.iter().map(|task| (task.name.as_str(), task)).collect()
}

/// Focused minutes per category. Sessions naming no known task count as `Other`.
pub fn time_allocation(sessions: &[Session], tasks: &[Task]) -> Vec<(Category, u32)> {
  let by_name = tasks_by_name(tasks);
  let mut buckets: HashMap<Category, u32> = HashMap::new();

  for session in sessions {
    let Some(name) = session.task_name() else {
      continue;
    };
    let category = by_name
      .get(name)
      .map(|task| task.category)
      .unwrap_or(Category::Other);
    *buckets.entry(category).or_default() += session.work_minutes;
  }

  Category::ALL
    .iter()
    .filter_map(|category| {
      buckets
        .get(category)
        .filter(|minutes| **minutes > 0)
        .map(|minutes| (*category, *minutes))
    })
    .collect()
}

/// Focused minutes per quadrant of the task each session names.
/// Sessions naming no known task are left out.
pub fn quadrant_reality(sessions: &[Session], tasks: &[Task]) -> Vec<(Quadrant, u32)> {
  let by_name = tasks_by_name(tasks);
  let mut buckets: HashMap<Quadrant, u32> = HashMap::new();

  for session in sessions {
    let Some(task) = session.task_name().and_then(|name| by_name.get(name)) else {
      continue;
    };
    *buckets.entry(task.quadrant()).or_default() += session.work_minutes;
  }

  Quadrant::ALL
    .iter()
    .map(|quadrant| (*quadrant, buckets.get(quadrant).copied().unwrap_or(0)))
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insights {
  pub week: WeekRange,
  pub overview: WeeklyOverview,
  pub allocation: Vec<(Category, u32)>,
  pub quadrants: Vec<(Quadrant, u32)>,
}

pub fn insights(sessions: &[Session], tasks: &[Task], week: WeekRange) -> Insights {
  let in_week: Vec<Session> = sessions
    .iter()
    .filter(|session| week.contains(session.date))
    .cloned()
    .collect();

  Insights {
    week,
    overview: weekly_overview(&in_week, tasks, &week),
    allocation: time_allocation(&in_week, tasks),
    quadrants: quadrant_reality(&in_week, tasks),
  }
}
