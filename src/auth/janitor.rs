use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::db::store::SessionStore;
use crate::error::AuthError;

/// Sweeps expired session rows.
#[derive(Clone)]
pub struct SessionJanitor {
    sessions: Arc<dyn SessionStore>,
}

impl SessionJanitor {
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self { sessions }
    }

    /// Deletes every session that expired before now. Rows already removed by
    /// a concurrent authentication check are simply not counted.
    pub async fn cleanup_expired(&self) -> Result<u64, AuthError> {
        Ok(self.sessions.delete_expired_sessions(Utc::now()).await?)
    }

    /// Runs `cleanup_expired` every `interval` until the handle is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match self.cleanup_expired().await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "Expired sessions cleaned up"),
                    Err(e) => error!("Session cleanup failed: {}", e),
                }
            }
        })
    }
}
