//! Command line surface.

use chrono::NaiveDate;
use clap::{Args, Subcommand};
use serde::de::DeserializeOwned;
use std::path::PathBuf;

use crate::model::{Category, Priority, TaskId, TaskInput, TimerMode, Urgency};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Show tasks, soonest deadline first
  #[command(visible_alias = "ls")]
  List {
    /// Show completed tasks instead of open ones
    #[arg(long)]
    completed: bool,

    /// Only tasks due on this date (YYYY-MM-DD)
    #[arg(long)]
    date: Option<NaiveDate>,
  },

  /// Create a task
  Add(TaskArgs),

  /// Replace every field of a task
  Edit {
    id: TaskId,
    #[command(flatten)]
    task: TaskArgs,
  },

  /// Mark a task completed
  Done { id: TaskId },

  /// Mark a task not completed
  Undo { id: TaskId },

  /// Delete a task
  #[command(visible_alias = "delete")]
  Rm { id: TaskId },

  /// Re-read tasks from the remote store, ignoring the cache
  Refresh,

  /// Open tasks of one category on the Eisenhower matrix
  Matrix {
    #[arg(long, default_value = "university", value_parser = parse_enum::<Category>)]
    category: Category,
  },

  /// Dates with open deadlines
  Calendar,

  /// Record a finished work interval
  Log {
    #[arg(value_parser = parse_enum::<TimerMode>)]
    mode: TimerMode,

    /// Name of the task worked on
    #[arg(long)]
    task: Option<String>,
  },

  /// Today's sessions and focused minutes
  Stats,

  /// Weekly report
  Insights {
    /// How many weeks back to look (0 is the current week)
    #[arg(long, default_value_t = 0)]
    weeks_ago: u32,
  },

  /// Write all tasks and sessions to a JSON file
  Export {
    /// Output path (default: focusgrid-data-<date>.json)
    #[arg(short, long)]
    output: Option<PathBuf>,
  },

  /// Load tasks and sessions from an export file
  Import { file: PathBuf },

  /// Manage the course list of a category
  Courses {
    #[command(subcommand)]
    action: CourseAction,
  },

  /// Sign in (password from FOCUSGRID_PASSWORD)
  Signin { email: String },

  /// Create an account (password from FOCUSGRID_PASSWORD)
  Signup { email: String },

  Signout,

  /// Show who is signed in
  Whoami,
}

#[derive(Subcommand, Debug)]
pub enum CourseAction {
  List {
    #[arg(long, default_value = "university", value_parser = parse_enum::<Category>)]
    category: Category,
  },
  Add {
    name: String,
    #[arg(long, default_value = "university", value_parser = parse_enum::<Category>)]
    category: Category,
  },
  Rm {
    name: String,
    #[arg(long, default_value = "university", value_parser = parse_enum::<Category>)]
    category: Category,
  },
}

#[derive(Args, Debug, Clone)]
pub struct TaskArgs {
  pub name: String,

  #[arg(long, default_value_t = 0)]
  pub hours: u32,

  #[arg(short, long, default_value_t = 0)]
  pub minutes: u32,

  #[arg(long, default_value = "university", value_parser = parse_enum::<Category>)]
  pub category: Category,

  /// Label shown for category "other"
  #[arg(long)]
  pub custom_category: Option<String>,

  #[arg(long)]
  pub course: Option<String>,

  #[arg(short, long, default_value = "low", value_parser = parse_enum::<Priority>)]
  pub priority: Priority,

  #[arg(short, long, default_value = "flexible", value_parser = parse_enum::<Urgency>)]
  pub urgency: Urgency,

  /// YYYY-MM-DD
  #[arg(short, long)]
  pub deadline: Option<NaiveDate>,
}

impl From<TaskArgs> for TaskInput {
  fn from(args: TaskArgs) -> Self {
    Self {
      name: args.name,
      hours: args.hours,
      minutes: args.minutes,
      category: args.category,
      custom_category: args.custom_category,
      course: args.course,
      priority: args.priority,
      urgency: args.urgency,
      deadline: args.deadline,
    }
  }
}

/// Parse a lowercase enum name the same way stored rows are read.
fn parse_enum<T: DeserializeOwned>(s: &str) -> Result<T, String> {
  serde_json::from_value(serde_json::Value::String(s.trim().to_lowercase()))
    .map_err(|_| format!("unknown value '{}'", s))
}
