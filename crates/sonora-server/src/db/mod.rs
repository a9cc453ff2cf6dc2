//! SQLite persistence for tasks, addressed by `DB_URL`.

mod tasks;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use rusqlite::Connection;
use tokio::task;
use tracing::info;

pub use tasks::{NewTask, ResultType, Task, TaskCompletion, TaskStatus, TaskStore, TaskType};

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbTarget {
    File(PathBuf),
    Memory,
}

impl DbTarget {
    /// Accepts `sqlite:///relative.db`, `sqlite:////absolute.db`,
    /// `sqlite:///:memory:`, `:memory:` and plain filesystem paths.
    pub fn parse(db_url: &str) -> anyhow::Result<Self> {
        let trimmed = db_url.trim();
        if trimmed.is_empty() {
            return Err(config_error("DB_URL is empty"));
        }

        let location = match trimmed.split_once("://") {
            Some((scheme, rest)) => {
                let scheme = scheme.to_ascii_lowercase();
                if scheme != "sqlite" && !scheme.starts_with("sqlite+") {
                    return Err(config_error(format!(
                        "Unsupported database scheme '{scheme}' in DB_URL; only sqlite is supported"
                    )));
                }
                let rest = rest.split_once('?').map(|(path, _)| path).unwrap_or(rest);
                rest.strip_prefix('/').unwrap_or(rest)
            }
            None => trimmed,
        };

        if location.is_empty() || location == ":memory:" {
            return Ok(Self::Memory);
        }
        Ok(Self::File(PathBuf::from(location)))
    }
}

fn config_error(msg: impl Into<String>) -> anyhow::Error {
    sonora_core::Error::Config(msg.into()).into()
}

#[derive(Clone)]
pub(crate) enum Backend {
    File(PathBuf),
    /// In-memory databases live as long as their single connection.
    Memory(Arc<Mutex<Connection>>),
}

impl Backend {
    pub(crate) async fn run_blocking<F, T>(&self, task_fn: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let backend = self.clone();
        task::spawn_blocking(move || match backend {
            Backend::File(path) => {
                let conn = open_connection(&path)?;
                task_fn(&conn)
            }
            Backend::Memory(conn) => {
                let guard = conn
                    .lock()
                    .map_err(|_| anyhow!("In-memory database lock poisoned"))?;
                task_fn(&guard)
            }
        })
        .await
        .map_err(|err| anyhow!("Task storage worker failed: {err}"))?
    }
}

/// Open the database named by `db_url` and create the schema.
pub async fn init_db(db_url: &str) -> anyhow::Result<TaskStore> {
    let target = DbTarget::parse(db_url)?;

    let backend = match &target {
        DbTarget::File(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
            Backend::File(path.clone())
        }
        DbTarget::Memory => {
            let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
            Backend::Memory(Arc::new(Mutex::new(conn)))
        }
    };

    backend
        .run_blocking(|conn| {
            conn.execute_batch(tasks::SCHEMA)
                .context("Failed to initialize task database schema")
        })
        .await?;

    match &target {
        DbTarget::File(path) => info!("Task database ready at {}", path.display()),
        DbTarget::Memory => info!("Task database ready in memory"),
    }

    Ok(TaskStore::new(backend))
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Unable to open SQLite database at {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(3))
        .context("Failed to configure SQLite busy timeout")?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("Failed to enable SQLite WAL journal mode")?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sqlite_urls() {
        assert_eq!(
            DbTarget::parse("sqlite:///records.db").unwrap(),
            DbTarget::File(PathBuf::from("records.db"))
        );
        assert_eq!(
            DbTarget::parse("sqlite:////var/lib/sonora/records.db").unwrap(),
            DbTarget::File(PathBuf::from("/var/lib/sonora/records.db"))
        );
        assert_eq!(
            DbTarget::parse("sqlite+aiosqlite:///data/tasks.db?timeout=5").unwrap(),
            DbTarget::File(PathBuf::from("data/tasks.db"))
        );
        assert_eq!(DbTarget::parse("sqlite:///:memory:").unwrap(), DbTarget::Memory);
        assert_eq!(DbTarget::parse(":memory:").unwrap(), DbTarget::Memory);
        assert_eq!(
            DbTarget::parse("./local/tasks.sqlite3").unwrap(),
            DbTarget::File(PathBuf::from("./local/tasks.sqlite3"))
        );
    }

    #[test]
    fn rejects_other_schemes() {
        for url in ["postgresql://user:pw@localhost/db", "mysql://localhost/db", "  "] {
            let err = DbTarget::parse(url).unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<sonora_core::Error>(),
                    Some(sonora_core::Error::Config(_))
                ),
                "{url}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn creates_parent_directories() {
        let dir = std::env::temp_dir().join(format!("sonora-db-{}", uuid::Uuid::new_v4()));
        let db_path = dir.join("nested").join("tasks.db");

        init_db(&format!("sqlite:///{}", db_path.display()))
            .await
            .unwrap();

        assert!(db_path.is_file());
        let _ = std::fs::remove_dir_all(dir);
    }
}
