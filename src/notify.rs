//! Notification seam for task outcomes.
//!
//! Actual transports (webhook, chat) live outside the core; the default
//! implementation just logs.

use chrono::{DateTime, Utc};

use crate::scheduler::TaskKind;

#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub task_id: String,
    pub kind: TaskKind,
    pub success: bool,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &TaskEvent);
}

/// Default notifier: one log line per finished task.
#[derive(Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &TaskEvent) {
        if event.success {
            log::info!("task {} ({:?}) finished successfully", event.task_id, event.kind);
        } else {
            log::error!(
                "task {} ({:?}) failed: {}",
                event.task_id,
                event.kind,
                event.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}
