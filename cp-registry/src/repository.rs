use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::record::{from_unix, to_unix, SessionRecord, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("session not found")]
    NotFound,
    #[error("no active session for project")]
    NoActiveSession,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Pushed into the store by `ListWithFilter`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub state: Option<SessionState>,
    pub owner_current_pid: Option<u32>,
    pub include_deleted: bool,
    pub include_archived: bool,
    pub limit: Option<i64>,
}

#[async_trait]
pub trait SessionRepository: Send + Sync + std::fmt::Debug {
    async fn save(&self, record: &mut SessionRecord) -> Result<(), RepositoryError>;
    async fn find_by_guid(&self, project: &str, guid: &str) -> Result<SessionRecord, RepositoryError>;
    async fn find_by_id(&self, id: i64) -> Result<SessionRecord, RepositoryError>;
    async fn get_active_session(&self, project: &str) -> Result<SessionRecord, RepositoryError>;
    async fn delete(&self, project: &str, guid: &str) -> Result<(), RepositoryError>;
    async fn delete_all_for_project(&self, project: &str) -> Result<(), RepositoryError>;
    async fn list_with_filter(&self, project: &str, filter: &ListFilter) -> Result<Vec<SessionRecord>, RepositoryError>;
}

/// SQLite-backed implementation: WAL journal mode, FK
/// enforcement, a 5s busy timeout, a pre-migration backup snapshot, and
/// owner-only (0700) directory permissions where POSIX permissions apply.
#[derive(Debug, Clone)]
pub struct SqliteSessionRepository {
    pool: Pool<Sqlite>,
}

impl SqliteSessionRepository {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("creating database directory {}", dir.display()))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
                        .await
                        .with_context(|| format!("hardening database directory {}", dir.display()))?;
                }
            }
        }

        if path.exists() {
            let backup = backup_path(path);
            tokio::fs::copy(path, &backup)
                .await
                .with_context(|| format!("writing pre-migration backup {}", backup.display()))?;
            info!(backup = %backup.display(), "wrote pre-migration database snapshot");
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("opening session database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running session database migrations")?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}

fn row_to_record(row: SqliteRow) -> Result<SessionRecord> {
    let labels: String = row.try_get("labels")?;
    let state: String = row.try_get("state")?;
    Ok(SessionRecord {
        id: row.try_get("id")?,
        guid: row.try_get("guid")?,
        project: row.try_get("project")?,
        name: row.try_get("name")?,
        template_id: row.try_get("template_id")?,
        epic_id: row.try_get("epic_id")?,
        work_dir: row.try_get::<Option<String>, _>("work_dir")?.map(PathBuf::from),
        labels: serde_json::from_str(&labels).unwrap_or_default(),
        worktree_enabled: row.try_get::<i64, _>("worktree_enabled")? != 0,
        worktree_base_branch: row.try_get("worktree_base_branch")?,
        worktree_branch_name: row.try_get("worktree_branch_name")?,
        worktree_path: row.try_get::<Option<String>, _>("worktree_path")?.map(PathBuf::from),
        worktree_actual_branch: row.try_get("worktree_actual_branch")?,
        session_dir: row.try_get::<Option<String>, _>("session_dir")?.map(PathBuf::from),
        owner_created_pid: row.try_get::<Option<i64>, _>("owner_created_pid")?.map(|v| v as u32),
        owner_current_pid: row.try_get::<Option<i64>, _>("owner_current_pid")?.map(|v| v as u32),
        tokens_used: row.try_get::<i64, _>("tokens_used")? as u64,
        active_workers: row.try_get::<i64, _>("active_workers")? as u32,
        last_heartbeat_at: from_unix(row.try_get("last_heartbeat_at")?),
        last_progress_at: from_unix(row.try_get("last_progress_at")?),
        started_at: from_unix(row.try_get("started_at")?),
        paused_at: from_unix(row.try_get("paused_at")?),
        completed_at: from_unix(row.try_get("completed_at")?),
        archived_at: from_unix(row.try_get("archived_at")?),
        deleted_at: from_unix(row.try_get("deleted_at")?),
        created_at: from_unix(Some(row.try_get("created_at")?)).unwrap(),
        updated_at: from_unix(Some(row.try_get("updated_at")?)).unwrap(),
        state: SessionState::from_db_str(&state).unwrap_or(SessionState::Failed),
    })
}

#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    async fn save(&self, record: &mut SessionRecord) -> Result<(), RepositoryError> {
        let labels = serde_json::to_string(&record.labels).unwrap_or_else(|_| "{}".to_string());

        if record.id == 0 {
            let id = sqlx::query(
                r#"
                INSERT INTO sessions (
                    guid, project, name, template_id, epic_id, work_dir, labels,
                    worktree_enabled, worktree_base_branch, worktree_branch_name,
                    worktree_path, worktree_actual_branch, session_dir,
                    owner_created_pid, owner_current_pid, tokens_used, active_workers,
                    last_heartbeat_at, last_progress_at, started_at, paused_at,
                    completed_at, archived_at, deleted_at, created_at, updated_at, state
                ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
                "#,
            )
            .bind(&record.guid)
            .bind(&record.project)
            .bind(&record.name)
            .bind(&record.template_id)
            .bind(&record.epic_id)
            .bind(record.work_dir.as_ref().map(|p| p.display().to_string()))
            .bind(labels)
            .bind(record.worktree_enabled as i64)
            .bind(&record.worktree_base_branch)
            .bind(&record.worktree_branch_name)
            .bind(record.worktree_path.as_ref().map(|p| p.display().to_string()))
            .bind(&record.worktree_actual_branch)
            .bind(record.session_dir.as_ref().map(|p| p.display().to_string()))
            .bind(record.owner_created_pid.map(|v| v as i64))
            .bind(record.owner_current_pid.map(|v| v as i64))
            .bind(record.tokens_used as i64)
            .bind(record.active_workers as i64)
            .bind(to_unix(record.last_heartbeat_at))
            .bind(to_unix(record.last_progress_at))
            .bind(to_unix(record.started_at))
            .bind(to_unix(record.paused_at))
            .bind(to_unix(record.completed_at))
            .bind(to_unix(record.archived_at))
            .bind(to_unix(record.deleted_at))
            .bind(record.created_at.timestamp())
            .bind(record.updated_at.timestamp())
            .bind(record.state.as_db_str())
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Other(e.into()))?
            .last_insert_rowid();
            record.id = id;
            Ok(())
        } else {
            sqlx::query(
                r#"
                UPDATE sessions SET
                    name = ?, template_id = ?, epic_id = ?, work_dir = ?, labels = ?,
                    worktree_enabled = ?, worktree_base_branch = ?, worktree_branch_name = ?,
                    worktree_path = ?, worktree_actual_branch = ?, session_dir = ?,
                    owner_created_pid = ?, owner_current_pid = ?, tokens_used = ?,
                    active_workers = ?, last_heartbeat_at = ?, last_progress_at = ?,
                    started_at = ?, paused_at = ?, completed_at = ?, archived_at = ?,
                    deleted_at = ?, updated_at = ?, state = ?
                WHERE id = ?
                "#,
            )
            .bind(&record.name)
            .bind(&record.template_id)
            .bind(&record.epic_id)
            .bind(record.work_dir.as_ref().map(|p| p.display().to_string()))
            .bind(labels)
            .bind(record.worktree_enabled as i64)
            .bind(&record.worktree_base_branch)
            .bind(&record.worktree_branch_name)
            .bind(record.worktree_path.as_ref().map(|p| p.display().to_string()))
            .bind(&record.worktree_actual_branch)
            .bind(record.session_dir.as_ref().map(|p| p.display().to_string()))
            .bind(record.owner_created_pid.map(|v| v as i64))
            .bind(record.owner_current_pid.map(|v| v as i64))
            .bind(record.tokens_used as i64)
            .bind(record.active_workers as i64)
            .bind(to_unix(record.last_heartbeat_at))
            .bind(to_unix(record.last_progress_at))
            .bind(to_unix(record.started_at))
            .bind(to_unix(record.paused_at))
            .bind(to_unix(record.completed_at))
            .bind(to_unix(record.archived_at))
            .bind(to_unix(record.deleted_at))
            .bind(record.updated_at.timestamp())
            .bind(record.state.as_db_str())
            .bind(record.id)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Other(e.into()))?;
            Ok(())
        }
    }

    async fn find_by_guid(&self, project: &str, guid: &str) -> Result<SessionRecord, RepositoryError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE project = ? AND guid = ? AND deleted_at IS NULL")
            .bind(project)
            .bind(guid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::Other(e.into()))?;
        match row {
            Some(r) => row_to_record(r).map_err(RepositoryError::Other),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn find_by_id(&self, id: i64) -> Result<SessionRecord, RepositoryError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::Other(e.into()))?;
        match row {
            Some(r) => row_to_record(r).map_err(RepositoryError::Other),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_active_session(&self, project: &str) -> Result<SessionRecord, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM sessions WHERE project = ? AND state = 'running' AND deleted_at IS NULL",
        )
        .bind(project)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryError::Other(e.into()))?;
        match row {
            Some(r) => row_to_record(r).map_err(RepositoryError::Other),
            None => Err(RepositoryError::NoActiveSession),
        }
    }

    async fn delete(&self, project: &str, guid: &str) -> Result<(), RepositoryError> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE sessions SET deleted_at = ?, updated_at = ? WHERE project = ? AND guid = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(project)
        .bind(guid)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Other(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_all_for_project(&self, project: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM sessions WHERE project = ?")
            .bind(project)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Other(e.into()))?;
        Ok(())
    }

    async fn list_with_filter(&self, project: &str, filter: &ListFilter) -> Result<Vec<SessionRecord>, RepositoryError> {
        let mut sql = String::from("SELECT * FROM sessions WHERE project = ?");
        if !filter.include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        if !filter.include_archived {
            sql.push_str(" AND archived_at IS NULL");
        }
        if filter.state.is_some() {
            sql.push_str(" AND state = ?");
        }
        if filter.owner_current_pid.is_some() {
            sql.push_str(" AND owner_current_pid = ?");
        }
        sql.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut query = sqlx::query(&sql).bind(project);
        if let Some(state) = filter.state {
            query = query.bind(state.as_db_str());
        }
        if let Some(pid) = filter.owner_current_pid {
            query = query.bind(pid as i64);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryError::Other(e.into()))?;

        rows.into_iter()
            .map(|r| row_to_record(r).map_err(RepositoryError::Other))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SessionRecord;
    use chrono::Utc;

    fn blank_record(project: &str, guid: &str) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            id: 0,
            guid: guid.to_string(),
            project: project.to_string(),
            name: None,
            template_id: Some("t".to_string()),
            epic_id: None,
            work_dir: None,
            labels: Default::default(),
            worktree_enabled: false,
            worktree_base_branch: None,
            worktree_branch_name: None,
            worktree_path: None,
            worktree_actual_branch: None,
            session_dir: None,
            owner_created_pid: Some(42),
            owner_current_pid: Some(42),
            tokens_used: 0,
            active_workers: 0,
            last_heartbeat_at: Some(now),
            last_progress_at: Some(now),
            started_at: None,
            paused_at: None,
            completed_at: None,
            archived_at: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
            state: SessionState::Pending,
        }
    }

    #[tokio::test]
    async fn save_assigns_id_then_updates_in_place() {
        let repo = SqliteSessionRepository::open_in_memory().await.unwrap();
        let mut record = blank_record("proj-a", "g1");
        repo.save(&mut record).await.unwrap();
        assert_ne!(record.id, 0);

        record.tokens_used = 10;
        repo.save(&mut record).await.unwrap();

        let reloaded = repo.find_by_guid("proj-a", "g1").await.unwrap();
        assert_eq!(reloaded.tokens_used, 10);
    }

    #[tokio::test]
    async fn find_by_guid_excludes_soft_deleted() {
        let repo = SqliteSessionRepository::open_in_memory().await.unwrap();
        let mut record = blank_record("proj-a", "g2");
        repo.save(&mut record).await.unwrap();
        repo.delete("proj-a", "g2").await.unwrap();

        let err = repo.find_by_guid("proj-a", "g2").await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn project_isolation_on_find_and_active_session() {
        let repo = SqliteSessionRepository::open_in_memory().await.unwrap();
        let mut record = blank_record("proj-a", "shared-guid");
        record.state = SessionState::Running;
        repo.save(&mut record).await.unwrap();

        assert!(matches!(
            repo.find_by_guid("proj-b", "shared-guid").await,
            Err(RepositoryError::NotFound)
        ));
        assert!(matches!(
            repo.get_active_session("proj-b").await,
            Err(RepositoryError::NoActiveSession)
        ));
        assert!(repo.get_active_session("proj-a").await.is_ok());
    }

    #[tokio::test]
    async fn list_with_filter_orders_created_at_desc() {
        let repo = SqliteSessionRepository::open_in_memory().await.unwrap();
        for i in 0..3 {
            let mut r = blank_record("proj-a", &format!("g{i}"));
            r.created_at = Utc::now() + chrono::Duration::seconds(i);
            repo.save(&mut r).await.unwrap();
        }
        let rows = repo
            .list_with_filter("proj-a", &ListFilter::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].created_at >= rows[1].created_at);
        assert!(rows[1].created_at >= rows[2].created_at);
    }
}
