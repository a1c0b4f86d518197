//! Worker agent operating on the local filesystem and process table.
//!
//! Used when the router and the orchestrator share a host, and by the tests.
//! The data router writes `*.graw` files into `data_dir`; organizing a run
//! moves them into `data_dir/EXPERIMENT/run_NNNN`.

use super::{run_dir_name, HostProcess, WorkerAgent, WorkerProvider};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::{ProcessesToUpdate, System};
use tokio::fs;
use tracing::{debug, info};

/// Default extension of data files written by the router.
pub const DATA_FILE_EXTENSION: &str = "graw";

/// Expand a leading `~` to the current user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(path),
        },
        None => PathBuf::from(path),
    }
}

/// [`WorkerAgent`] backed by `tokio::fs` and `sysinfo`.
#[derive(Clone, Debug)]
pub struct LocalWorkerAgent {
    data_dir: PathBuf,
    extension: String,
}

impl LocalWorkerAgent {
    /// Agent whose router writes into `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            extension: DATA_FILE_EXTENSION.to_string(),
        }
    }

    /// Override the data file extension (without the dot).
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Directory the router writes into.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Full path of a run directory.
    pub fn run_dir(&self, experiment_name: &str, run_number: u32) -> PathBuf {
        self.data_dir
            .join(experiment_name)
            .join(run_dir_name(run_number))
    }

    async fn staged_files(&self) -> AppResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_data = path
                .extension()
                .is_some_and(|ext| ext == self.extension.as_str());
            if is_data && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl WorkerAgent for LocalWorkerAgent {
    async fn organize_files(&self, experiment_name: &str, run_number: u32) -> AppResult<()> {
        let run_dir = self.run_dir(experiment_name, run_number);
        let files = self.staged_files().await?;
        fs::create_dir_all(&run_dir).await?;
        for src in &files {
            if let Some(name) = src.file_name() {
                fs::rename(src, run_dir.join(name)).await?;
            }
        }
        info!(
            run_dir = %run_dir.display(),
            count = files.len(),
            "Moved data files into run directory"
        );
        Ok(())
    }

    async fn backup_config_files(
        &self,
        experiment_name: &str,
        run_number: u32,
        source_paths: &[String],
        dest_root: &str,
    ) -> AppResult<()> {
        let dest = expand_home(dest_root)
            .join(experiment_name)
            .join(run_dir_name(run_number));
        fs::create_dir_all(&dest).await?;
        for source in source_paths {
            let source = expand_home(source);
            let name = source.file_name().ok_or_else(|| {
                DaqError::Configuration(format!("'{}' is not a file path", source.display()))
            })?;
            fs::copy(&source, dest.join(name)).await?;
        }
        debug!(dest = %dest.display(), count = source_paths.len(), "Backed up config files");
        Ok(())
    }

    async fn check_status(&self, process: HostProcess) -> AppResult<bool> {
        let name = process.process_name();
        tokio::task::spawn_blocking(move || {
            let mut system = System::new();
            system.refresh_processes(ProcessesToUpdate::All, true);
            system
                .processes()
                .values()
                .any(|p| p.name().to_string_lossy().contains(name))
        })
        .await
        .map_err(|e| DaqError::Remote(format!("process check failed: {e}")))
    }

    async fn staging_dir_is_clean(&self) -> AppResult<bool> {
        Ok(self.staged_files().await?.is_empty())
    }

    async fn tail_file(&self, path: &str, lines: usize) -> AppResult<String> {
        let content = fs::read_to_string(expand_home(path)).await?;
        let all: Vec<&str> = content.lines().collect();
        Ok(all[all.len().saturating_sub(lines)..].join("\n"))
    }
}

/// Every host maps to the same local agent.
#[derive(Clone, Debug)]
pub struct LocalWorkerProvider {
    agent: Arc<LocalWorkerAgent>,
}

impl LocalWorkerProvider {
    /// Provider serving `agent` for every host.
    pub fn new(agent: LocalWorkerAgent) -> Self {
        Self {
            agent: Arc::new(agent),
        }
    }
}

impl WorkerProvider for LocalWorkerProvider {
    fn agent_for(&self, _host: IpAddr) -> AppResult<Arc<dyn WorkerAgent>> {
        Ok(self.agent.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_organize_moves_only_data_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("CoBo_0.graw"), b"data").unwrap();
        std::fs::write(dir.path().join("CoBo_1.graw"), b"data").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

        let agent = LocalWorkerAgent::new(dir.path());
        assert!(!agent.staging_dir_is_clean().await.unwrap());

        agent.organize_files("e15503", 3).await.unwrap();

        let run_dir = dir.path().join("e15503").join("run_0003");
        assert!(run_dir.join("CoBo_0.graw").exists());
        assert!(run_dir.join("CoBo_1.graw").exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(agent.staging_dir_is_clean().await.unwrap());
    }

    #[tokio::test]
    async fn test_backup_copies_into_run_directory() {
        let src = tempdir().unwrap();
        let dest = tempdir().unwrap();
        let describe = src.path().join("describe-cobo.xcfg");
        std::fs::write(&describe, b"<describe/>").unwrap();

        let agent = LocalWorkerAgent::new(src.path());
        agent
            .backup_config_files(
                "e15503",
                0,
                &[describe.display().to_string()],
                &dest.path().display().to_string(),
            )
            .await
            .unwrap();

        let copied = dest.path().join("e15503/run_0000/describe-cobo.xcfg");
        assert_eq!(std::fs::read(copied).unwrap(), b"<describe/>");
        assert!(describe.exists());
    }

    #[tokio::test]
    async fn test_tail_file() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("ecc.log");
        std::fs::write(&log, "one\ntwo\nthree\nfour\n").unwrap();

        let agent = LocalWorkerAgent::new(dir.path());
        let path = log.display().to_string();
        assert_eq!(agent.tail_file(&path, 2).await.unwrap(), "three\nfour");
        assert_eq!(agent.tail_file(&path, 10).await.unwrap(), "one\ntwo\nthree\nfour");
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/configs"), home.join("configs"));
        }
    }
}
