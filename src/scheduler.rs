//! Scheduled backup and restore jobs.
//!
//! A persistent task table plus a tokio dispatcher: schedules parse as
//! 5-field cron expressions or `@every <duration>`, firings acquire a
//! slot from a bounded pool, whole tasks retry with a delay, and state
//! survives restarts in `<state-dir>/schedules.json`. Secrets are never
//! part of a task record; a task only names the environment variable
//! holding its passphrase.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use dbkp_datastore::prune::KeepOptions;
use dbkp_tools::compression::Compression;
use dbkp_tools::crypt_config::KeySource;
use dbkp_tools::error::{Error, Result};

use crate::adapters::{adapter_for, ConnectionInfo, LocalRunner};
use crate::backup::{run_backup, BackupOptions};
use crate::notify::{LogNotifier, Notifier, TaskEvent};
use crate::restore::{run_restore, RestoreOptions};

pub const STATE_FILE_NAME: &str = "schedules.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Backup,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Ok,
    Failed,
}

/// Per-task knobs; everything here is safe to persist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    pub compression: Compression,
    pub dedup: bool,
    pub parity_stripe: usize,
    pub audit: bool,
    pub allow_insecure: bool,
    #[serde(flatten)]
    pub keep: KeepOptions,
    /// Name of the environment variable read at execution time for the
    /// encryption passphrase. The passphrase itself is never stored.
    pub passphrase_env: Option<String>,
    /// Restore only: object name; latest backup when unset.
    pub backup_name: Option<String>,
    /// Restore only: scheduled restores are destructive and must be
    /// confirmed when the task is created.
    pub confirm_restore: bool,
    pub dry_run: bool,
    pub retries: u32,
    pub retry_delay_secs: u64,
}

/// One persisted scheduler entry.
///
/// For backups `source_uri` is the database and `target_uri` the
/// storage; for restores `source_uri` is the storage and `target_uri`
/// the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub kind: TaskKind,
    pub engine: String,
    pub source_uri: String,
    pub target_uri: String,
    /// 5-field cron expression or `@every <duration>`.
    pub schedule: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub options: TaskOptions,
}

/// Parsed schedule specification.
pub enum Schedule {
    Cron(Box<cron::Schedule>),
    Every(Duration),
}

impl Schedule {
    /// Accepts a 5-field cron expression (minute precision) or
    /// `@every <duration>` such as `@every 15m`.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if let Some(interval) = spec.strip_prefix("@every ") {
            let duration = humantime::parse_duration(interval.trim())
                .map_err(|err| Error::Config(format!("invalid interval '{interval}' - {err}")))?;
            if duration.is_zero() {
                return Err(Error::Config("interval must not be zero".into()));
            }
            return Ok(Schedule::Every(duration));
        }

        if spec.split_whitespace().count() != 5 {
            return Err(Error::Config(format!(
                "invalid schedule '{spec}' - expected 5 cron fields or '@every <duration>'"
            )));
        }
        // the cron crate wants a seconds field; pin it to zero
        let with_seconds = format!("0 {spec}");
        let schedule = cron::Schedule::from_str(&with_seconds)
            .map_err(|err| Error::Config(format!("invalid cron expression '{spec}' - {err}")))?;
        Ok(Schedule::Cron(Box::new(schedule)))
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(schedule) => schedule.after(&after).next(),
            Schedule::Every(interval) => {
                let interval = chrono::Duration::from_std(*interval).ok()?;
                after.checked_add_signed(interval)
            }
        }
    }
}

/// Runs one task to completion; swapped out in tests.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: &ScheduledTask, cancel: &CancellationToken) -> Result<()>;
}

/// Default executor driving the backup and restore pipelines.
pub struct PipelineExecutor;

impl TaskExecutor for PipelineExecutor {
    fn execute(&self, task: &ScheduledTask, cancel: &CancellationToken) -> Result<()> {
        let runner = LocalRunner::new();
        let encryption = key_from_env(&task.options)?;

        match task.kind {
            TaskKind::Backup => {
                let conn = ConnectionInfo::from_uri(&task.source_uri)?;
                let adapter = adapter_for(&task.engine)?;
                let options = BackupOptions {
                    name: None,
                    compression: task.options.compression,
                    encryption,
                    dedup: task.options.dedup,
                    parity_stripe: task.options.parity_stripe,
                    audit: task.options.audit,
                    allow_insecure: task.options.allow_insecure,
                    keep: task.options.keep.clone(),
                };
                run_backup(
                    adapter.as_ref(),
                    &conn,
                    &runner,
                    &task.target_uri,
                    &options,
                    cancel,
                )?;
                Ok(())
            }
            TaskKind::Restore => {
                let conn = ConnectionInfo::from_uri(&task.target_uri)?;
                let adapter = adapter_for(&task.engine)?;
                let name = match &task.options.backup_name {
                    Some(name) => name.clone(),
                    None => latest_backup_name(&task.source_uri, &task.options, cancel)?,
                };
                let options = RestoreOptions {
                    name,
                    decrypt_key: key_from_env(&task.options)?,
                    confirm_restore: task.options.confirm_restore,
                    dry_run: task.options.dry_run,
                    allow_insecure: task.options.allow_insecure,
                    parity_stripe: task.options.parity_stripe,
                };
                run_restore(
                    adapter.as_ref(),
                    &conn,
                    &runner,
                    &task.source_uri,
                    &options,
                    cancel,
                )
            }
        }
    }
}

fn key_from_env(options: &TaskOptions) -> Result<Option<KeySource>> {
    match &options.passphrase_env {
        None => Ok(None),
        Some(variable) => match std::env::var(variable) {
            Ok(passphrase) => Ok(Some(KeySource::Passphrase(passphrase))),
            Err(_) => Err(Error::Config(format!(
                "environment variable '{variable}' with the passphrase is not set"
            ))),
        },
    }
}

/// Resolve the newest backup via the latest pointer.
fn latest_backup_name(
    storage_uri: &str,
    options: &TaskOptions,
    cancel: &CancellationToken,
) -> Result<String> {
    let store = dbkp_datastore::make_store(
        storage_uri,
        &dbkp_datastore::StoreOptions {
            allow_insecure: options.allow_insecure,
            cancel: cancel.clone(),
            ..Default::default()
        },
    )?;
    let data = store
        .get_meta(dbkp_datastore::manifest::LATEST_MANIFEST_NAME)
        .map_err(|err| match err {
            Error::NotFound(_) => Error::NotFound("no latest backup pointer in storage".into()),
            other => other,
        })?;
    Ok(dbkp_datastore::Manifest::from_json(&data)?.filename)
}

struct SchedulerState {
    state_path: PathBuf,
    tasks: Mutex<BTreeMap<String, ScheduledTask>>,
    running: Mutex<HashSet<String>>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
    executor: Arc<dyn TaskExecutor>,
    notifier: Arc<dyn Notifier>,
}

/// Cron/interval dispatcher with bounded parallelism.
pub struct Scheduler {
    state: Arc<SchedulerState>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Default worker pool size.
pub const DEFAULT_PARALLELISM: usize = 4;

impl Scheduler {
    pub fn new(state_dir: impl Into<PathBuf>, parallelism: usize) -> Result<Self> {
        Self::with_parts(
            state_dir,
            parallelism,
            Arc::new(PipelineExecutor),
            Arc::new(LogNotifier),
        )
    }

    pub fn with_parts(
        state_dir: impl Into<PathBuf>,
        parallelism: usize,
        executor: Arc<dyn TaskExecutor>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir).map_err(|err| {
            Error::Resource(format!("unable to create state dir {state_dir:?} - {err}"))
        })?;
        let state_path = state_dir.join(STATE_FILE_NAME);

        let mut tasks = BTreeMap::new();
        match std::fs::read(&state_path) {
            Ok(data) => {
                let loaded: Vec<ScheduledTask> = serde_json::from_slice(&data).map_err(|err| {
                    Error::Config(format!("invalid scheduler state {state_path:?} - {err}"))
                })?;
                for mut task in loaded {
                    // recompute after a restart; the stored value is stale
                    task.next_run = Schedule::parse(&task.schedule)?.next_after(Utc::now());
                    if task.status == TaskStatus::Running {
                        task.status = TaskStatus::Pending;
                    }
                    tasks.insert(task.id.clone(), task);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::from_io(err)),
        }

        let parallelism = parallelism.max(1);
        Ok(Self {
            state: Arc::new(SchedulerState {
                state_path,
                tasks: Mutex::new(tasks),
                running: Mutex::new(HashSet::new()),
                slots: Arc::new(Semaphore::new(parallelism)),
                cancel: CancellationToken::new(),
                executor,
                notifier,
            }),
            handle: Mutex::new(None),
        })
    }

    /// Register a task and persist the table.
    pub fn add(&self, mut task: ScheduledTask) -> Result<()> {
        let schedule = Schedule::parse(&task.schedule)?;
        if task.kind == TaskKind::Restore && !task.options.confirm_restore {
            return Err(Error::Security(
                "scheduled restores must be confirmed when the task is created".into(),
            ));
        }

        task.next_run = schedule.next_after(Utc::now());
        task.status = TaskStatus::Pending;

        let mut tasks = self.state.tasks.lock().unwrap();
        if tasks.contains_key(&task.id) {
            return Err(Error::Config(format!(
                "task '{}' is already scheduled",
                task.id
            )));
        }
        log::info!("scheduled task '{}' ({})", task.id, task.schedule);
        tasks.insert(task.id.clone(), task);
        self.state.persist(&tasks)
    }

    /// De-register a task and persist the table.
    pub fn remove(&self, id: &str) -> Result<()> {
        let mut tasks = self.state.tasks.lock().unwrap();
        if tasks.remove(id).is_none() {
            return Err(Error::NotFound(format!("task '{id}'")));
        }
        log::info!("removed task '{id}'");
        self.state.persist(&tasks)
    }

    /// Current tasks, including their next fire time.
    pub fn list(&self) -> Vec<ScheduledTask> {
        self.state.tasks.lock().unwrap().values().cloned().collect()
    }

    /// Start the dispatch loop.
    pub fn start(&self) {
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            log::info!("scheduler started");
            loop {
                tokio::select! {
                    _ = state.cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                SchedulerState::dispatch_due(&state);
            }
            log::info!("scheduler stopped");
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Cancel in-flight work and stop the dispatch loop.
    pub async fn stop(&self) {
        self.state.cancel.cancel();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl SchedulerState {
    fn persist(&self, tasks: &BTreeMap<String, ScheduledTask>) -> Result<()> {
        let list: Vec<&ScheduledTask> = tasks.values().collect();
        let data = serde_json::to_vec_pretty(&list)
            .map_err(|err| Error::Internal(anyhow::anyhow!("state encoding failed - {err}")))?;

        // atomic replace so a crash never leaves a torn state file
        let tmp_path = self.state_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &data)?;
        std::fs::rename(&tmp_path, &self.state_path)?;
        Ok(())
    }

    /// Fire everything that is due; called once per tick.
    fn dispatch_due(state: &Arc<Self>) {
        let now = Utc::now();
        let due: Vec<ScheduledTask> = {
            let mut tasks = state.tasks.lock().unwrap();
            let mut due = Vec::new();
            for task in tasks.values_mut() {
                let fire = matches!(task.next_run, Some(at) if at <= now);
                if !fire {
                    continue;
                }
                // advance regardless of whether this firing runs, so a
                // skipped slot does not refire every tick
                task.next_run = Schedule::parse(&task.schedule)
                    .ok()
                    .and_then(|schedule| schedule.next_after(now));
                due.push(task.clone());
            }
            if !due.is_empty() {
                let _ = state.persist(&tasks);
            }
            due
        };

        for task in due {
            state.clone().spawn_execution(task);
        }
    }

    fn spawn_execution(self: Arc<Self>, task: ScheduledTask) {
        {
            let running = self.running.lock().unwrap();
            if running.contains(&task.id) {
                log::warn!("task '{}' is still running, skipping this firing", task.id);
                return;
            }
        }
        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                log::warn!(
                    "no free worker slot for task '{}', skipping this firing",
                    task.id
                );
                return;
            }
        };

        self.running.lock().unwrap().insert(task.id.clone());
        self.update_task(&task.id, |entry| entry.status = TaskStatus::Running);

        let state = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let result = state.run_with_retries(&task).await;

            let success = result.is_ok();
            let error_text = result.as_ref().err().map(|err| err.to_string());

            state.update_task(&task.id, |entry| {
                entry.status = if success { TaskStatus::Ok } else { TaskStatus::Failed };
                entry.last_run = Some(Utc::now());
                entry.last_error = error_text.clone();
            });
            state.running.lock().unwrap().remove(&task.id);

            state.notifier.notify(&TaskEvent {
                task_id: task.id.clone(),
                kind: task.kind,
                success,
                error: error_text,
                finished_at: Utc::now(),
            });
        });
    }

    async fn run_with_retries(&self, task: &ScheduledTask) -> Result<()> {
        let attempts = task.options.retries + 1;
        let delay = Duration::from_secs(task.options.retry_delay_secs);

        for attempt in 1..=attempts {
            let executor = self.executor.clone();
            let cancel = self.cancel.clone();
            let task_clone = task.clone();
            let result = tokio::task::spawn_blocking(move || {
                executor.execute(&task_clone, &cancel)
            })
            .await
            .map_err(|err| Error::Internal(anyhow::anyhow!("task execution panicked - {err}")))?;

            match result {
                Ok(()) => return Ok(()),
                Err(err) if attempt < attempts => {
                    log::warn!(
                        "task '{}' attempt {attempt}/{attempts} failed - {err}; retrying in {}s",
                        task.id,
                        delay.as_secs()
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!("retry loop always returns");
    }

    fn update_task<F: FnOnce(&mut ScheduledTask)>(&self, id: &str, update: F) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(entry) = tasks.get_mut(id) {
            update(entry);
            let _ = self.persist(&tasks);
        }
    }
}
