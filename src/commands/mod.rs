mod config_cmd;
mod meal;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use meal::{MealCommand, MealSubcommand};
pub use sync_cmd::{auto_sync, SyncCommand};

use chrono::NaiveDate;
use clap::ValueEnum;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use mealsync_core::{MealQueue, MealRepository, PassReport, RemoteWritePort, SyncEngine};

use crate::config::Config;
use crate::remote::{HttpRemote, Unconfigured};

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

pub fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| format!("Invalid date format '{}'. Use YYYY-MM-DD.", value))
}

/// Queue, engine and remote wired together for one CLI invocation.
///
/// The connectivity signal is driven by explicit probes rather than a
/// background monitor, so a command runs at most the passes it asks for.
pub struct Session {
    pub repo: MealRepository,
    remote: Option<HttpRemote>,
    online: watch::Sender<bool>,
}

impl Session {
    pub async fn open(config: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        let queue = MealQueue::open(&config.database_path.value).await?;

        let remote = if config.sync.is_configured() {
            Some(HttpRemote::from_config(&config.sync)?)
        } else {
            None
        };
        let port: Arc<dyn RemoteWritePort> = match &remote {
            Some(remote) => Arc::new(remote.clone()),
            None => Arc::new(Unconfigured),
        };

        let (online, connectivity) = watch::channel(false);
        let engine = SyncEngine::new(
            queue.clone(),
            port,
            connectivity,
            config.sync.retry_policy(),
        );

        Ok(Self {
            repo: MealRepository::new(queue, engine),
            remote,
            online,
        })
    }

    pub fn remote(&self) -> Option<&HttpRemote> {
        self.remote.as_ref()
    }

    /// Checks the server and feeds the result to the engine.
    pub async fn probe(&self) -> bool {
        let online = match &self.remote {
            Some(remote) => remote.check_health().await,
            None => false,
        };
        self.online.send_replace(online);
        online
    }

    /// One inline pass, if the server is reachable. `None` when offline.
    pub async fn sync_once(&self) -> Result<Option<PassReport>, Box<dyn std::error::Error>> {
        if !self.probe().await {
            debug!("Server unreachable, not syncing");
            return Ok(None);
        }
        let engine = self.repo.engine();
        engine.recover().await?;
        Ok(engine.sync_now().await?)
    }

    pub async fn close(self) {
        self.repo.engine().shutdown();
        self.repo.queue().close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date("2025-03-14").unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
        );
        assert!(parse_date("14/03/2025")
            .unwrap_err()
            .contains("Use YYYY-MM-DD"));
    }

    #[tokio::test]
    async fn test_session_without_server_stays_offline() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "database_path: meals.db\n").unwrap();
        let config = Config::load(Some(config_path)).unwrap();

        let session = Session::open(&config).await.unwrap();
        assert!(session.remote().is_none());
        assert!(!session.probe().await);
        assert!(session.sync_once().await.unwrap().is_none());
        session.close().await;

        assert!(temp_dir.path().join("meals.db").exists());
    }
}
