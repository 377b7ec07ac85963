//! Database engine adapters.
//!
//! An adapter produces a logical dump as a byte stream and applies one
//! back, shelling out to the engine's native tooling through a
//! [`Runner`]. The storage pipeline only ever sees the byte stream.

use std::collections::HashMap;
use std::io::{Read, Write};

use dbkp_tools::error::{Error, Result};
use dbkp_tools::uri::scrub_uri;

mod mysql;
mod postgres;
mod runner;
mod sqlite;

pub use mysql::MySqlAdapter;
pub use postgres::PostgresAdapter;
pub use runner::{DryRunRunner, LocalRunner, Runner};
pub use sqlite::SqliteAdapter;

/// Parsed database connection target.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub engine: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Database name; for sqlite the filesystem path of the database.
    pub dbname: String,
    pub options: HashMap<String, String>,
}

impl ConnectionInfo {
    /// Parse `engine://[user[:pass]@]host[:port]/dbname?opts`.
    ///
    /// For sqlite the whole path is the database file.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let url = url::Url::parse(uri).map_err(|err| {
            Error::Config(format!("invalid database uri '{}' - {err}", scrub_uri(uri)))
        })?;

        let engine = match url.scheme() {
            "postgres" | "postgresql" => "postgres",
            "mysql" | "mariadb" => "mysql",
            "sqlite" | "sqlite3" => "sqlite",
            other => {
                return Err(Error::Config(format!(
                    "unsupported database engine '{other}'"
                )));
            }
        };

        let dbname = if engine == "sqlite" {
            match url.host_str() {
                // sqlite://relative/path parses with a host component
                Some(host) => format!("{host}{}", url.path()),
                None => url.path().to_string(),
            }
        } else {
            url.path().trim_start_matches('/').to_string()
        };
        if dbname.is_empty() {
            return Err(Error::Config(format!(
                "database uri '{}' is missing the database name",
                scrub_uri(uri)
            )));
        }

        Ok(ConnectionInfo {
            engine: engine.to_string(),
            host: url
                .host_str()
                .map(str::to_string)
                .filter(|_| engine != "sqlite"),
            port: url.port(),
            user: match url.username() {
                "" => None,
                user => Some(user.to_string()),
            },
            password: url.password().map(str::to_string),
            dbname,
            options: url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
        })
    }

    /// Display form with the password scrubbed.
    pub fn scrubbed(&self) -> String {
        let mut out = format!("{}://", self.engine);
        if let Some(user) = &self.user {
            out.push_str(user);
            if self.password.is_some() {
                out.push_str(":********");
            }
            out.push('@');
        }
        if let Some(host) = &self.host {
            out.push_str(host);
        }
        if let Some(port) = self.port {
            out.push_str(&format!(":{port}"));
        }
        out.push('/');
        out.push_str(&self.dbname);
        out
    }
}

/// One database engine, defined by the streams it produces and consumes.
pub trait DatabaseAdapter: Send + Sync {
    /// Lowercase engine tag.
    fn name(&self) -> &'static str;

    fn test_connection(&self, conn: &ConnectionInfo, runner: &dyn Runner) -> Result<()>;

    /// Write the logical dump to `sink`.
    fn run_backup(
        &self,
        conn: &ConnectionInfo,
        runner: &dyn Runner,
        sink: &mut dyn Write,
    ) -> Result<()>;

    /// Read a dump from `source` and apply it to the target database.
    fn run_restore(
        &self,
        conn: &ConnectionInfo,
        runner: &dyn Runner,
        source: &mut (dyn Read + Send),
    ) -> Result<()>;
}

/// Look up the adapter for an engine tag.
pub fn adapter_for(engine: &str) -> Result<Box<dyn DatabaseAdapter>> {
    match engine {
        "postgres" | "postgresql" => Ok(Box::new(PostgresAdapter)),
        "mysql" | "mariadb" => Ok(Box::new(MySqlAdapter)),
        "sqlite" | "sqlite3" => Ok(Box::new(SqliteAdapter)),
        other => Err(Error::Config(format!(
            "unknown database engine '{other}' (supported: postgres, mysql, sqlite)"
        ))),
    }
}

/// Map tool stderr to the error taxonomy where the cause is clear.
fn classify_tool_failure(program: &str, stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    if lower.contains("authentication")
        || lower.contains("access denied")
        || lower.contains("password")
    {
        Error::Auth(format!("{program}: {}", stderr.trim()))
    } else if lower.contains("could not connect")
        || lower.contains("connection refused")
        || lower.contains("could not translate host")
        || lower.contains("unknown mysql server host")
        || lower.contains("timeout")
    {
        Error::Connection(format!("{program}: {}", stderr.trim()))
    } else {
        Error::Internal(anyhow::anyhow!("{program} failed: {}", stderr.trim()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_postgres_uri() -> Result<()> {
        let conn =
            ConnectionInfo::from_uri("postgres://admin:pw@db.example:5433/shop?sslmode=require")?;
        assert_eq!(conn.engine, "postgres");
        assert_eq!(conn.host.as_deref(), Some("db.example"));
        assert_eq!(conn.port, Some(5433));
        assert_eq!(conn.user.as_deref(), Some("admin"));
        assert_eq!(conn.password.as_deref(), Some("pw"));
        assert_eq!(conn.dbname, "shop");
        assert_eq!(
            conn.options.get("sslmode").map(String::as_str),
            Some("require")
        );
        assert!(!conn.scrubbed().contains("pw@"));
        Ok(())
    }

    #[test]
    fn parses_sqlite_path() -> Result<()> {
        let conn = ConnectionInfo::from_uri("sqlite:///var/lib/app/data.db")?;
        assert_eq!(conn.engine, "sqlite");
        assert_eq!(conn.dbname, "/var/lib/app/data.db");
        assert!(conn.host.is_none());
        Ok(())
    }

    #[test]
    fn rejects_unknown_engines() {
        assert!(matches!(
            ConnectionInfo::from_uri("oracle://host/db"),
            Err(Error::Config(_))
        ));
        assert!(adapter_for("oracle").is_err());
    }

    #[test]
    fn classification_covers_common_failures() {
        assert!(matches!(
            classify_tool_failure("psql", "FATAL: password authentication failed"),
            Error::Auth(_)
        ));
        assert!(matches!(
            classify_tool_failure("pg_dump", "could not connect to server"),
            Error::Connection(_)
        ));
        assert!(matches!(
            classify_tool_failure("mysqldump", "table is marked as crashed"),
            Error::Internal(_)
        ));
    }
}
