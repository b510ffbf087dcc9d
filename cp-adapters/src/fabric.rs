use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

/// The mention-oriented broker agents post to: a message broadcast between
/// agents through a separate mention-oriented broker. Its wire format and
/// addressing scheme are an external collaborator's
/// concern; the supervisor only needs to start it once per
/// workflow and stop it on shutdown.
#[async_trait]
pub trait FabricBroker: Send + Sync + fmt::Debug {
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Appends every fabric post to the session's fabric event log; `close`
/// flushes and closes that log ("close fabric logger
/// (flushes logs)").
#[async_trait]
pub trait FabricLogger: Send + Sync + fmt::Debug {
    async fn log(&self, text: &str) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait FabricFactory: Send + Sync + fmt::Debug {
    async fn build(&self, session_dir: &Path) -> anyhow::Result<(Box<dyn FabricBroker>, Box<dyn FabricLogger>)>;
}

/// In-process broker: posting is a no-op beyond bookkeeping, since the
/// actual mention fan-out in this workspace happens through the workflow's
/// own event bus (the supervisor's fabric pipeline forwards every post
/// there through its own forwarder handler).
#[derive(Debug, Default)]
pub struct InProcessFabricBroker {
    started: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl FabricBroker for InProcessFabricBroker {
    async fn start(&self) -> anyhow::Result<()> {
        self.started.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.started.store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FileFabricLogger {
    path: PathBuf,
}

impl FileFabricLogger {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl FabricLogger for FileFabricLogger {
    async fn log(&self, text: &str) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsFabricFactory;

#[async_trait]
impl FabricFactory for FsFabricFactory {
    async fn build(&self, session_dir: &Path) -> anyhow::Result<(Box<dyn FabricBroker>, Box<dyn FabricLogger>)> {
        let broker = InProcessFabricBroker::default();
        broker.start().await?;
        let logger = FileFabricLogger::new(session_dir.join("fabric.log"));
        Ok((Box::new(broker), Box::new(logger)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broker_start_stop_round_trips() {
        let broker = InProcessFabricBroker::default();
        broker.start().await.unwrap();
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn logger_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = FileFabricLogger::new(dir.path().join("fabric.log"));
        logger.log("hello").await.unwrap();
        logger.log("world").await.unwrap();
        logger.close().await.unwrap();
        let contents = tokio::fs::read_to_string(dir.path().join("fabric.log")).await.unwrap();
        assert_eq!(contents, "hello\nworld\n");
    }
}
