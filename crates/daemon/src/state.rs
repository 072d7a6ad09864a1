//! On-disk layout of the agent's config directory.

use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::database::Database;
use crate::error::EngineError;

pub const APP_NAME: &str = "loft";
pub const DB_FILE_NAME: &str = "loft.db";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const LOG_FILE_NAME: &str = "agent.log";
pub const CACHE_DIR_NAME: &str = "cache";
pub const RCLONE_CONFIG_FILE_NAME: &str = "rclone.conf";

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("cannot determine a config directory; pass --config-dir")]
    NoConfigDir,
    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Paths derived from the config directory.
#[derive(Debug, Clone)]
pub struct AppState {
    pub config_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub log_path: PathBuf,
    pub cache_root: PathBuf,
    pub rclone_config_path: PathBuf,
}

impl AppState {
    /// Resolve the layout, creating the directory if needed.
    ///
    /// Defaults to `$XDG_CONFIG_HOME/loft` (or the platform equivalent).
    pub fn resolve(config_dir: Option<PathBuf>) -> Result<Self, StateError> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => dirs::config_dir()
                .ok_or(StateError::NoConfigDir)?
                .join(APP_NAME),
        };
        Self::at(config_dir)
    }

    pub fn at(config_dir: PathBuf) -> Result<Self, StateError> {
        let cache_root = config_dir.join(CACHE_DIR_NAME);
        std::fs::create_dir_all(&cache_root).map_err(|source| StateError::Io {
            path: cache_root.clone(),
            source,
        })?;

        Ok(Self {
            db_path: config_dir.join(DB_FILE_NAME),
            config_path: config_dir.join(CONFIG_FILE_NAME),
            log_path: config_dir.join(LOG_FILE_NAME),
            rclone_config_path: config_dir.join(RCLONE_CONFIG_FILE_NAME),
            cache_root,
            config_dir,
        })
    }

    /// Cache directory backing the mount of `rule_id`.
    pub fn cache_dir(&self, rule_id: &Uuid) -> PathBuf {
        self.cache_root.join(rule_id.to_string())
    }

    /// Open the metadata store; anything short of a healthy file is `StoreCorruption`.
    pub async fn open_database(&self) -> Result<Database, EngineError> {
        Database::new(&self.db_path)
            .await
            .map_err(|e| EngineError::StoreCorruption(e.to_string()))
    }

    /// Move an unreadable store aside and open a fresh one.
    ///
    /// The old files are kept next to it with a `.corrupt-<unix time>`
    /// suffix. Every rule needs a rebuild afterwards.
    pub async fn reset_database(&self) -> Result<Database, EngineError> {
        let stamp = time::OffsetDateTime::now_utc().unix_timestamp();
        for suffix in ["", "-wal", "-shm"] {
            let mut name = self.db_path.clone().into_os_string();
            name.push(suffix);
            let path = PathBuf::from(name);
            if path.exists() {
                let mut aside = path.clone().into_os_string();
                aside.push(format!(".corrupt-{stamp}"));
                std::fs::rename(&path, PathBuf::from(aside))?;
            }
        }
        warn!(path = %self.db_path.display(), "moved unreadable metadata store aside");
        self.open_database().await
    }

    /// The config saved by the last import, if any.
    pub fn saved_config(&self) -> Result<Option<AgentConfig>, EngineError> {
        if !self.config_path.exists() {
            return Ok(None);
        }
        AgentConfig::load(&self.config_path).map(Some)
    }

    pub fn save_config(&self, config: &AgentConfig) -> Result<(), EngineError> {
        config.save(&self.config_path)
    }

    /// Write the rclone remotes of `config` to the agent's rclone config.
    ///
    /// Returns the file to hand to rclone, or `None` when the config
    /// declares no remotes (a stale file is removed).
    pub fn write_rclone_config(
        &self,
        config: &AgentConfig,
    ) -> Result<Option<PathBuf>, EngineError> {
        if config.rclone.is_empty() {
            match std::fs::remove_file(&self.rclone_config_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(None);
        }
        std::fs::write(
            &self.rclone_config_path,
            object_store::render_config(&config.rclone),
        )?;
        Ok(Some(self.rclone_config_path.clone()))
    }

    /// The rclone config written by the last import or run, if any.
    pub fn rclone_config(&self) -> Option<&Path> {
        self.rclone_config_path
            .exists()
            .then_some(self.rclone_config_path.as_path())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::at(dir.path().join("agent")).unwrap();

        assert!(state.cache_root.is_dir());
        assert_eq!(state.db_path, dir.path().join("agent").join(DB_FILE_NAME));
        let id = Uuid::new_v4();
        assert_eq!(state.cache_dir(&id), state.cache_root.join(id.to_string()));
        assert!(state.saved_config().unwrap().is_none());
        assert!(state.rclone_config().is_none());
    }

    #[test]
    fn test_rclone_config_follows_the_agent_config() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::at(dir.path().to_path_buf()).unwrap();

        let mut config = AgentConfig::default();
        config.rclone.insert(
            "minio".to_string(),
            [("type".to_string(), "s3".to_string())].into(),
        );
        let written = state.write_rclone_config(&config).unwrap().unwrap();
        assert_eq!(written, dir.path().join(RCLONE_CONFIG_FILE_NAME));
        assert_eq!(state.rclone_config(), Some(written.as_path()));
        assert_eq!(
            std::fs::read_to_string(&written).unwrap(),
            "[minio]\ntype = s3\n"
        );

        config.rclone.clear();
        assert!(state.write_rclone_config(&config).unwrap().is_none());
        assert!(state.rclone_config().is_none());
    }
}
