use std::io::{Read, Write};

use dbkp_tools::error::Result;

use super::{ConnectionInfo, DatabaseAdapter, Runner};

/// PostgreSQL via `pg_dump` / `psql`.
pub struct PostgresAdapter;

impl PostgresAdapter {
    /// Connection string passed to the tools; credentials travel inside
    /// it so no interactive prompt can appear.
    fn conninfo(conn: &ConnectionInfo) -> String {
        let mut uri = String::from("postgresql://");
        if let Some(user) = &conn.user {
            uri.push_str(user);
            if let Some(password) = &conn.password {
                uri.push(':');
                uri.push_str(password);
            }
            uri.push('@');
        }
        uri.push_str(conn.host.as_deref().unwrap_or("localhost"));
        uri.push_str(&format!(":{}", conn.port.unwrap_or(5432)));
        uri.push('/');
        uri.push_str(&conn.dbname);
        uri
    }
}

impl DatabaseAdapter for PostgresAdapter {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn test_connection(&self, conn: &ConnectionInfo, runner: &dyn Runner) -> Result<()> {
        runner.run(
            "psql",
            &[
                Self::conninfo(conn),
                "--no-psqlrc".to_string(),
                "-tA".to_string(),
                "-c".to_string(),
                "SELECT 1".to_string(),
            ],
            &mut std::io::sink(),
        )
    }

    fn run_backup(
        &self,
        conn: &ConnectionInfo,
        runner: &dyn Runner,
        sink: &mut dyn Write,
    ) -> Result<()> {
        runner.run(
            "pg_dump",
            &[
                Self::conninfo(conn),
                "--no-password".to_string(),
                "--format=plain".to_string(),
            ],
            sink,
        )
    }

    fn run_restore(
        &self,
        conn: &ConnectionInfo,
        runner: &dyn Runner,
        source: &mut (dyn Read + Send),
    ) -> Result<()> {
        runner.run_with_io(
            "psql",
            &[
                Self::conninfo(conn),
                "--no-psqlrc".to_string(),
                "--set".to_string(),
                "ON_ERROR_STOP=1".to_string(),
            ],
            source,
            &mut std::io::sink(),
        )
    }
}
