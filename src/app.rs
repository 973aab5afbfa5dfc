use chrono::Local;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::commands::{Command, CourseAction};
use crate::config::Config;
use crate::event::AuthEvents;
use crate::identity::IdentityLifecycle;
use crate::model::{Category, Identity, Quadrant, Task, TaskId, TaskInput};
use crate::remote::{AuthSession, RemoteAdapter, RestClient, RetryPolicy, SignUpOutcome};
use crate::store::{LocalStore, Stores, AUTH_SESSION_KEY};
use crate::sync::{SessionLog, SyncCache};
use crate::transfer;
use crate::views::{self, DeadlineStatus, Tab};

/// Main application state
pub struct App {
  config: Config,
  stores: Arc<Stores>,
  /// Present when a remote backend is configured
  client: Option<Arc<RestClient>>,
  tasks: SyncCache,
  sessions: Arc<SessionLog>,
  lifecycle: IdentityLifecycle,
  events: AuthEvents,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let local = LocalStore::open(&config.data_dir()?)?;
    let events = AuthEvents::new();

    let client = match &config.remote {
      Some(remote) => match Config::get_api_key() {
        Ok(api_key) => Some(Arc::new(RestClient::new(remote, api_key, events.sender())?)),
        Err(e) => {
          warn!(error = %e, "remote configured without an API key, running local-only");
          None
        }
      },
      None => None,
    };

    let adapter = match (&client, &config.remote) {
      (Some(client), Some(remote)) => Some(RemoteAdapter::new(
        client.clone(),
        RetryPolicy::from(remote),
      )),
      _ => None,
    };

    let stores = Arc::new(Stores::new(local, adapter));
    let tasks = SyncCache::new(stores.clone(), config.retention());
    let sessions = Arc::new(SessionLog::new(stores.clone(), config.modes.clone()));
    let lifecycle = IdentityLifecycle::new(stores.clone(), tasks.clone(), sessions.clone());

    Ok(Self {
      config,
      stores,
      client,
      tasks,
      sessions,
      lifecycle,
      events,
    })
  }

  pub async fn run(&mut self, command: Command) -> Result<()> {
    let restored = self.restore_session();
    self.lifecycle.startup(restored).await;

    let result = self.execute(command).await;
    self.tasks.flush().await;

    self.process_auth_events().await;
    self.save_session();
    result
  }

  /// Reinstate tokens from an earlier run.
  fn restore_session(&self) -> Option<Identity> {
    let client = self.client.as_ref()?;
    let session: AuthSession = self.stores.local.load_json(AUTH_SESSION_KEY)?;
    let identity = session.user.clone();
    client.restore(session);
    Some(identity)
  }

  fn save_session(&self) {
    let Some(client) = &self.client else {
      return;
    };
    let result = match client.session() {
      Some(session) => self.stores.local.save_json(AUTH_SESSION_KEY, &session),
      None => self.stores.local.remove(AUTH_SESSION_KEY),
    };
    if let Err(e) = result {
      warn!(error = %e, "could not persist auth session");
    }
  }

  async fn process_auth_events(&mut self) {
    while let Some(event) = self.events.try_next() {
      let transition = self.lifecycle.handle(event).await;
      debug!(?transition, "auth event handled");
    }
  }

  fn client(&self) -> Result<&RestClient> {
    self
      .client
      .as_deref()
      .ok_or_else(|| eyre!("No remote backend configured. Add a `remote` section to the config file."))
  }

  async fn execute(&mut self, command: Command) -> Result<()> {
    match command {
      Command::List { completed, date } => {
        let tab = if completed { Tab::Completed } else { Tab::Current };
        let tasks = self.tasks.load(false).await.unwrap_or_default();
        let shown = views::filter_list(&tasks, tab, date);
        if shown.is_empty() {
          println!("No tasks");
        }
        for task in shown {
          println!("{}", self.format_task(task));
        }
      }

      Command::Add(args) => match self.tasks.add(&TaskInput::from(args)).await {
        Some(task) => println!("Added {}", self.format_task(&task)),
        None => return Err(eyre!("A task needs a name and a duration above zero")),
      },

      Command::Edit { id, task } => {
        if !self.tasks.update(id, &TaskInput::from(task)).await {
          return Err(eyre!("Could not update task {}", id));
        }
        println!("Updated task {}", id);
      }

      Command::Done { id } => {
        let name = self.task_name(id).await?;
        self.tasks.toggle_complete(id, true).await;
        println!("Completed {}", name);
      }

      Command::Undo { id } => {
        let name = self.task_name(id).await?;
        self.tasks.toggle_complete(id, false).await;
        println!("Reopened {}", name);
      }

      Command::Rm { id } => {
        let name = self.task_name(id).await?;
        self.tasks.delete(id).await;
        println!("Deleted {}", name);
      }

      Command::Refresh => {
        if self.stores.identity().is_none() {
          println!("Not signed in; local data is always current");
          return Ok(());
        }
        match self.tasks.load(true).await {
          Some(tasks) => println!("Loaded {} tasks", tasks.len()),
          None => return Err(eyre!("Could not reach the remote store")),
        }
      }

      Command::Matrix { category } => {
        let tasks = self.tasks.load(false).await.unwrap_or_default();
        let matrix = views::matrix(&tasks, category);
        for quadrant in Quadrant::ALL {
          println!("== {} ==", quadrant.title());
          for task in matrix.cell(quadrant) {
            println!("  {}  {}", task.id, task.name);
          }
        }
      }

      Command::Calendar => {
        for date in self.tasks.deadline_dates().await {
          println!("{}", date);
        }
      }

      Command::Log { mode, task } => {
        let session = self.sessions.log(mode, task).await;
        println!(
          "Logged {} min {} session{}",
          session.work_minutes,
          mode.as_str(),
          session
            .task_name()
            .map(|name| format!(" on {}", name))
            .unwrap_or_default()
        );
        self.print_stats().await;
      }

      Command::Stats => self.print_stats().await,

      Command::Insights { weeks_ago } => {
        let week = views::week_range(Local::now().date_naive(), -i64::from(weeks_ago));
        let tasks = self.tasks.load(false).await.unwrap_or_default();
        let report = self.sessions.insights(&tasks, week).await;
        print_insights(&report);
      }

      Command::Export { output } => {
        let text = transfer::export(&self.stores).await?;
        let path = output
          .unwrap_or_else(|| PathBuf::from(transfer::default_file_name(Local::now().date_naive())));
        std::fs::write(&path, text)
          .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
        println!("Exported to {}", path.display());
      }

      Command::Import { file } => {
        let text = std::fs::read_to_string(&file)
          .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
        let data = transfer::parse_import(&text)?;
        let summary = transfer::import(&self.stores, &self.tasks, &self.sessions, data).await?;
        println!(
          "Imported {} tasks and {} sessions",
          summary.tasks, summary.sessions
        );
      }

      Command::Courses { action } => {
        let local = &self.stores.local;
        let courses = match action {
          CourseAction::List { category } => local.courses(category),
          CourseAction::Add { name, category } => local.add_course(category, &name)?,
          CourseAction::Rm { name, category } => local.remove_course(category, &name)?,
        };
        for course in courses {
          println!("{}", course);
        }
      }

      Command::Signin { email } => {
        let password = Config::get_password()?;
        let identity = self.client()?.sign_in_with_password(&email, &password).await?;
        println!("Signed in as {}", identity.email.as_deref().unwrap_or(&identity.id));
      }

      Command::Signup { email } => {
        let password = Config::get_password()?;
        match self.client()?.sign_up(&email, &password).await? {
          SignUpOutcome::SignedIn(identity) => println!(
            "Account created, signed in as {}",
            identity.email.as_deref().unwrap_or(&identity.id)
          ),
          SignUpOutcome::ConfirmationRequired => {
            println!("Account created. Check your email to confirm it, then sign in.")
          }
        }
      }

      Command::Signout => {
        self.client()?.sign_out().await?;
        println!("Signed out");
      }

      Command::Whoami => match self.client.as_ref().and_then(|c| c.identity()) {
        Some(identity) => println!(
          "{} ({})",
          identity.email.as_deref().unwrap_or("no email"),
          identity.id
        ),
        None => println!("Not signed in"),
      },
    }
    Ok(())
  }

  async fn task_name(&self, id: TaskId) -> Result<String> {
    self
      .tasks
      .get(id)
      .await
      .map(|task| task.name)
      .ok_or_else(|| eyre!("No task with id {}", id))
  }

  async fn print_stats(&self) {
    match self.sessions.stats().await {
      Some(stats) => println!(
        "Today: {} pomodoro{}, {} min focused",
        stats.sessions,
        if stats.sessions == 1 { "" } else { "s" },
        stats.minutes
      ),
      None => println!("Today: stats unavailable"),
    }
  }

  fn format_task(&self, task: &Task) -> String {
    let check = if task.completed { "x" } else { " " };
    let category = match (&task.custom_category, task.category) {
      (Some(label), Category::Other) => label.clone(),
      (_, category) => category.as_str().to_string(),
    };
    let pomodoros = views::pomodoro_estimate(task.estimated_minutes, &self.config.modes)
      .into_iter()
      .map(|(mode, count)| format!("{} {}", count, mode.as_str()))
      .collect::<Vec<_>>()
      .join(" / ");

    let mut line = format!(
      "{}  [{}] {}  {}  {}",
      task.id,
      check,
      task.name,
      views::format_duration(task.estimated_minutes),
      category
    );
    if let Some(course) = &task.course {
      line.push_str(&format!(" / {}", course));
    }
    if let Some(deadline) = task.deadline {
      let marker = match views::deadline_status(deadline, Local::now().date_naive()) {
        DeadlineStatus::Overdue => " (overdue)",
        DeadlineStatus::Due => " (due)",
        DeadlineStatus::Soon => " (soon)",
        DeadlineStatus::Later => "",
      };
      line.push_str(&format!("  due {}{}", deadline.format("%b %-d"), marker));
    }
    line.push_str(&format!("  [{}]", pomodoros));
    line
  }
}

fn print_insights(report: &views::Insights) {
  let overview = &report.overview;
  println!("Week of {}", report.week.label());
  println!(
    "Focus time: {} across {} session{}",
    views::format_duration(overview.focus_minutes),
    overview.sessions,
    if overview.sessions == 1 { "" } else { "s" }
  );
  let split = overview
    .by_mode
    .iter()
    .map(|(mode, count)| format!("{} {}", count, mode.as_str()))
    .collect::<Vec<_>>()
    .join(" / ");
  if !split.is_empty() {
    println!("Sessions: {}", split);
  }
  println!("Tasks completed: {}", overview.tasks_completed);
  match overview.completion_rate {
    Some(rate) => println!(
      "Completion rate: {}% ({} of {} created)",
      rate, overview.created_and_completed, overview.tasks_created
    ),
    None => println!("Completion rate: - (no tasks created)"),
  }

  println!("Time allocation:");
  if report.allocation.is_empty() {
    println!("  No focus sessions this week");
  }
  for (category, minutes) in &report.allocation {
    println!("  {:<12}{}", category.as_str(), views::format_duration(*minutes));
  }

  println!("Quadrant reality:");
  for (quadrant, minutes) in &report.quadrants {
    println!("  {:<12}{}", quadrant.title(), views::format_duration(*minutes));
  }
}
