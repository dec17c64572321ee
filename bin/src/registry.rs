use std::path::PathBuf;

use async_trait::async_trait;
use config::NodeConfig;
use lease_coordination::{CoordinationError, CoordinationResult, SessionId, SessionRegistry};

/// Session set read from the `sessions` list of the node config file. The
/// file is re-read on every sync, so sessions can be added or removed
/// without a restart.
#[derive(Debug, Clone)]
pub struct ConfigFileRegistry {
    path: PathBuf,
}

impl ConfigFileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SessionRegistry for ConfigFileRegistry {
    async fn list(&self) -> CoordinationResult<Vec<SessionId>> {
        let input = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            CoordinationError::Config(format!(
                "failed to read sessions from {}: {err}",
                self.path.display()
            ))
        })?;
        let cfg = NodeConfig::new(input).map_err(|err| {
            CoordinationError::Config(format!(
                "failed to parse sessions from {}: {err:#}",
                self.path.display()
            ))
        })?;
        Ok(cfg
            .sessions()
            .iter()
            .map(|s| SessionId::new(s.as_str()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_sessions_each_time() {
        let path = std::env::temp_dir().join(format!(
            "pollkeeper-registry-{}.yaml",
            std::process::id()
        ));
        tokio::fs::write(&path, "sessions: [sess-1, sess-2]\n")
            .await
            .unwrap();
        let registry = ConfigFileRegistry::new(&path);
        assert_eq!(
            registry.list().await.unwrap(),
            vec![SessionId::from("sess-1"), SessionId::from("sess-2")]
        );

        tokio::fs::write(&path, "sessions: [sess-3]\n").await.unwrap();
        assert_eq!(registry.list().await.unwrap(), vec![SessionId::from("sess-3")]);
        tokio::fs::remove_file(&path).await.unwrap();

        let err = registry.list().await.unwrap_err();
        assert!(matches!(err, CoordinationError::Config(_)));
    }
}
