use std::io::{Read, Write};

use dbkp_tools::error::Result;

use super::{ConnectionInfo, DatabaseAdapter, Runner};

/// MySQL/MariaDB via `mysqldump` / `mysql`.
pub struct MySqlAdapter;

impl MySqlAdapter {
    fn common_args(conn: &ConnectionInfo) -> Vec<String> {
        let mut args = vec![
            format!("--host={}", conn.host.as_deref().unwrap_or("localhost")),
            format!("--port={}", conn.port.unwrap_or(3306)),
        ];
        if let Some(user) = &conn.user {
            args.push(format!("--user={user}"));
        }
        if let Some(password) = &conn.password {
            args.push(format!("--password={password}"));
        }
        args
    }
}

impl DatabaseAdapter for MySqlAdapter {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn test_connection(&self, conn: &ConnectionInfo, runner: &dyn Runner) -> Result<()> {
        let mut args = Self::common_args(conn);
        args.push("--execute=SELECT 1".to_string());
        args.push(conn.dbname.clone());
        runner.run("mysql", &args, &mut std::io::sink())
    }

    fn run_backup(
        &self,
        conn: &ConnectionInfo,
        runner: &dyn Runner,
        sink: &mut dyn Write,
    ) -> Result<()> {
        let mut args = Self::common_args(conn);
        args.push("--single-transaction".to_string());
        args.push("--routines".to_string());
        args.push(conn.dbname.clone());
        runner.run("mysqldump", &args, sink)
    }

    fn run_restore(
        &self,
        conn: &ConnectionInfo,
        runner: &dyn Runner,
        source: &mut (dyn Read + Send),
    ) -> Result<()> {
        let mut args = Self::common_args(conn);
        args.push(conn.dbname.clone());
        runner.run_with_io("mysql", &args, source, &mut std::io::sink())
    }
}
