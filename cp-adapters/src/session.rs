use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const MESSAGE_LOG: &str = "messages.log";
const MCP_REQUEST_LOG: &str = "mcp_requests.jsonl";
const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Completed,
    Failed,
}

impl SessionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// The JSON metadata sidecar kept alongside a session's message and MCP
/// request logs: when the session was opened, when (and how) it closed,
/// and how many entries its logs hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub workflow_id: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub message_count: u64,
    pub mcp_request_count: u64,
}

impl SessionMetadata {
    fn new(workflow_id: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            opened_at: Utc::now(),
            closed_at: None,
            status: None,
            message_count: 0,
            mcp_request_count: 0,
        }
    }
}

/// A workflow's on-disk session directory: message logs, MCP request logs,
/// the fabric event log, and a metadata document.
#[async_trait]
pub trait Session: Send + Sync + fmt::Debug {
    fn dir(&self) -> &Path;

    /// Wires the session into the workflow's internal event bus so fabric
    /// events and process events get logged.
    async fn attach_v2_event_bus(&self) -> Result<()>;

    async fn attach_mcp_broker(&self) -> Result<()>;

    /// Appends one entry to the session's message log.
    async fn log_message(&self, role: &str, content: &str) -> Result<()>;

    /// Appends one entry to the session's MCP request log.
    async fn log_mcp_request(&self, method: &str, params: &serde_json::Value) -> Result<()>;

    /// Flushes and closes the session's logs, recording the final status.
    async fn close(&self, status: SessionStatus) -> Result<()>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync + fmt::Debug {
    /// Creates a brand-new session directory for `workflow_id` under `work_dir`.
    async fn create(&self, workflow_id: &str, work_dir: &Path) -> Result<Box<dyn Session>>;

    /// Reopens an existing session directory for a cold resume.
    async fn reopen(&self, workflow_id: &str, dir: &Path) -> Result<Box<dyn Session>>;
}

/// Filesystem-backed session factory. Owner-only directory permissions are
/// applied where the platform supports them, matching the session
/// repository's own directory hardening.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSessionFactory;

#[derive(Debug)]
pub struct FsSession {
    dir: PathBuf,
}

impl FsSession {
    fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    async fn append_line(&self, file_name: &str, line: &str) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file_name))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    async fn read_metadata(&self) -> Result<SessionMetadata> {
        let raw = tokio::fs::read(self.dir.join(METADATA_FILE)).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn write_metadata(&self, metadata: &SessionMetadata) -> Result<()> {
        let raw = serde_json::to_vec_pretty(metadata)?;
        tokio::fs::write(self.dir.join(METADATA_FILE), raw).await?;
        Ok(())
    }

    /// Metadata predates this session object if `reopen` points at a
    /// directory written before the sidecar existed; fall back to a fresh
    /// record rather than failing the reopen over it.
    async fn metadata_or_init(&self, workflow_id: &str) -> SessionMetadata {
        self.read_metadata()
            .await
            .unwrap_or_else(|_| SessionMetadata::new(workflow_id))
    }
}

#[async_trait]
impl Session for FsSession {
    fn dir(&self) -> &Path {
        &self.dir
    }

    async fn attach_v2_event_bus(&self) -> Result<()> {
        Ok(())
    }

    async fn attach_mcp_broker(&self) -> Result<()> {
        Ok(())
    }

    async fn log_message(&self, role: &str, content: &str) -> Result<()> {
        let line = serde_json::json!({ "at": Utc::now(), "role": role, "content": content }).to_string();
        self.append_line(MESSAGE_LOG, &line).await?;

        let mut metadata = self.metadata_or_init("").await;
        metadata.message_count += 1;
        self.write_metadata(&metadata).await
    }

    async fn log_mcp_request(&self, method: &str, params: &serde_json::Value) -> Result<()> {
        let line = serde_json::json!({ "at": Utc::now(), "method": method, "params": params }).to_string();
        self.append_line(MCP_REQUEST_LOG, &line).await?;

        let mut metadata = self.metadata_or_init("").await;
        metadata.mcp_request_count += 1;
        self.write_metadata(&metadata).await
    }

    async fn close(&self, status: SessionStatus) -> Result<()> {
        let mut metadata = self.metadata_or_init("").await;
        metadata.closed_at = Some(Utc::now());
        metadata.status = Some(status.as_str().to_string());
        self.write_metadata(&metadata).await
    }
}

#[async_trait]
impl SessionFactory for FsSessionFactory {
    async fn create(&self, workflow_id: &str, work_dir: &Path) -> Result<Box<dyn Session>> {
        let dir = work_dir.join(".sessions").join(workflow_id);
        tokio::fs::create_dir_all(&dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            tokio::fs::set_permissions(&dir, perms).await?;
        }

        tokio::fs::File::create(dir.join(MESSAGE_LOG)).await?;
        tokio::fs::File::create(dir.join(MCP_REQUEST_LOG)).await?;

        let session = FsSession::new(dir);
        session.write_metadata(&SessionMetadata::new(workflow_id)).await?;
        Ok(Box::new(session))
    }

    async fn reopen(&self, workflow_id: &str, dir: &Path) -> Result<Box<dyn Session>> {
        if !dir.exists() {
            anyhow::bail!("session directory {} does not exist", dir.display());
        }
        let session = FsSession::new(dir.to_path_buf());
        if session.read_metadata().await.is_err() {
            session.write_metadata(&SessionMetadata::new(workflow_id)).await?;
        }
        Ok(Box::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_writes_logs_and_metadata_sidecar() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = FsSessionFactory;
        let session = factory.create("wf-1", tmp.path()).await.unwrap();

        let dir = session.dir().to_path_buf();
        assert!(dir.join(MESSAGE_LOG).exists());
        assert!(dir.join(MCP_REQUEST_LOG).exists());
        let metadata: SessionMetadata =
            serde_json::from_slice(&tokio::fs::read(dir.join(METADATA_FILE)).await.unwrap()).unwrap();
        assert_eq!(metadata.workflow_id, "wf-1");
        assert!(metadata.closed_at.is_none());
    }

    #[tokio::test]
    async fn log_message_appends_and_bumps_metadata_count() {
        let tmp = tempfile::tempdir().unwrap();
        let session = FsSessionFactory.create("wf-2", tmp.path()).await.unwrap();

        session.log_message("coordinator", "hello").await.unwrap();
        session.log_message("worker", "ack").await.unwrap();

        let log = tokio::fs::read_to_string(session.dir().join(MESSAGE_LOG)).await.unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("hello"));

        let metadata: SessionMetadata =
            serde_json::from_slice(&tokio::fs::read(session.dir().join(METADATA_FILE)).await.unwrap()).unwrap();
        assert_eq!(metadata.message_count, 2);
    }

    #[tokio::test]
    async fn log_mcp_request_appends_and_bumps_metadata_count() {
        let tmp = tempfile::tempdir().unwrap();
        let session = FsSessionFactory.create("wf-3", tmp.path()).await.unwrap();

        session
            .log_mcp_request("tools/call", &serde_json::json!({ "name": "run" }))
            .await
            .unwrap();

        let log = tokio::fs::read_to_string(session.dir().join(MCP_REQUEST_LOG)).await.unwrap();
        assert_eq!(log.lines().count(), 1);

        let metadata: SessionMetadata =
            serde_json::from_slice(&tokio::fs::read(session.dir().join(METADATA_FILE)).await.unwrap()).unwrap();
        assert_eq!(metadata.mcp_request_count, 1);
    }

    #[tokio::test]
    async fn close_records_final_status_in_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let session = FsSessionFactory.create("wf-4", tmp.path()).await.unwrap();

        session.close(SessionStatus::Failed).await.unwrap();

        let metadata: SessionMetadata =
            serde_json::from_slice(&tokio::fs::read(session.dir().join(METADATA_FILE)).await.unwrap()).unwrap();
        assert_eq!(metadata.status.as_deref(), Some("failed"));
        assert!(metadata.closed_at.is_some());
    }

    #[tokio::test]
    async fn reopen_preserves_existing_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = FsSessionFactory;
        let session = factory.create("wf-5", tmp.path()).await.unwrap();
        session.log_message("coordinator", "first").await.unwrap();
        let dir = session.dir().to_path_buf();

        let reopened = factory.reopen("wf-5", &dir).await.unwrap();
        let metadata: SessionMetadata =
            serde_json::from_slice(&tokio::fs::read(reopened.dir().join(METADATA_FILE)).await.unwrap()).unwrap();
        assert_eq!(metadata.workflow_id, "wf-5");
        assert_eq!(metadata.message_count, 1);
    }

    #[tokio::test]
    async fn reopen_missing_directory_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("does-not-exist");
        let err = FsSessionFactory.reopen("wf-6", &missing).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
