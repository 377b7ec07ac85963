//! dbkp - database backup with a deduplicating, encrypting storage
//! pipeline.
//!
//! The core takes a logical dump from a database adapter, streams it
//! through optional compression and authenticated encryption into an
//! abstract object store (optionally content-defined-deduplicated),
//! commits a tamper-evident manifest, and restores the whole chain in
//! reverse with integrity verification. A scheduler drives recurring
//! jobs with bounded parallelism and retries.
//!
//! Command line parsing, configuration file loading and notification
//! transports are intentionally out of scope; this crate is the library
//! those wrappers drive.

pub mod adapters;
pub mod backup;
pub mod notify;
pub mod rekey;
pub mod restore;
pub mod scheduler;

mod storage;

pub use dbkp_datastore as datastore;
pub use dbkp_tools as tools;

pub use dbkp_tools::error::{Error, ErrorKind, Result};

pub use backup::{prune_backups, run_backup, run_backup_batch, BackupOptions, BackupTarget};
pub use rekey::{run_rekey, RekeyOptions, RekeySummary};
pub use restore::{run_restore, RestoreOptions};
pub use scheduler::{ScheduledTask, Scheduler, TaskKind, TaskOptions};
