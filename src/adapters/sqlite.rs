use std::io::{Read, Write};

use dbkp_tools::error::{Error, Result};

use super::{ConnectionInfo, DatabaseAdapter, Runner};

/// SQLite via the `sqlite3` command line shell.
///
/// `ConnectionInfo::dbname` is the database file path.
pub struct SqliteAdapter;

impl DatabaseAdapter for SqliteAdapter {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn test_connection(&self, conn: &ConnectionInfo, runner: &dyn Runner) -> Result<()> {
        if !std::path::Path::new(&conn.dbname).exists() {
            return Err(Error::Connection(format!(
                "sqlite database file '{}' does not exist",
                conn.dbname
            )));
        }
        runner.run(
            "sqlite3",
            &[conn.dbname.clone(), "SELECT 1;".to_string()],
            &mut std::io::sink(),
        )
    }

    fn run_backup(
        &self,
        conn: &ConnectionInfo,
        runner: &dyn Runner,
        sink: &mut dyn Write,
    ) -> Result<()> {
        runner.run("sqlite3", &[conn.dbname.clone(), ".dump".to_string()], sink)
    }

    fn run_restore(
        &self,
        conn: &ConnectionInfo,
        runner: &dyn Runner,
        source: &mut (dyn Read + Send),
    ) -> Result<()> {
        runner.run_with_io(
            "sqlite3",
            &[conn.dbname.clone()],
            source,
            &mut std::io::sink(),
        )
    }
}
