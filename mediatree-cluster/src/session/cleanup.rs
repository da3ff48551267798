//! Idle session and path reclamation
//!
//! Media nodes score `inactive_sessions` and `inactive_paths` with the time
//! they went idle. Anything idle for longer than the configured threshold is
//! torn down here. This is also the backstop for state left behind by
//! failed or interrupted operations.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mediatree_core::config::SessionConfig;
use mediatree_core::models::now_millis;
use mediatree_core::store::keys::parse_inactive_path_member;
use mediatree_core::MeshState;

use super::manager::SessionManager;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub sessions_destroyed: usize,
    pub paths_destroyed: usize,
    pub failures: usize,
}

#[derive(Clone)]
pub struct CleanupJob {
    mesh: MeshState,
    sessions: Arc<SessionManager>,
    config: SessionConfig,
    cancel_token: CancellationToken,
}

impl CleanupJob {
    #[must_use]
    pub fn new(
        mesh: MeshState,
        sessions: Arc<SessionManager>,
        config: SessionConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            mesh,
            sessions,
            config,
            cancel_token,
        }
    }

    pub fn start(&self) -> JoinHandle<()> {
        let job = self.clone();
        let cancel_token = self.cancel_token.clone();
        let pass_timeout = Duration::from_secs(self.config.cleanup_timeout_seconds);
        let mut timer = interval(self.config.cleanup_interval());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        info!("Session cleanup shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        match tokio::time::timeout(pass_timeout, job.sweep(now_millis())).await {
                            Ok(stats) if stats != CleanupStats::default() => {
                                info!(
                                    sessions = stats.sessions_destroyed,
                                    paths = stats.paths_destroyed,
                                    failures = stats.failures,
                                    "Cleanup pass finished"
                                );
                            }
                            Ok(_) => debug!("Cleanup pass found nothing idle"),
                            Err(_) => warn!(timeout_secs = pass_timeout.as_secs(), "Cleanup pass timed out"),
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    /// One pass over both activity sets as of `now_ms`
    pub async fn sweep(&self, now_ms: i64) -> CleanupStats {
        let mut stats = CleanupStats::default();
        self.sweep_sessions(now_ms, &mut stats).await;
        self.sweep_paths(now_ms, &mut stats).await;
        stats
    }

    async fn sweep_sessions(&self, now_ms: i64, stats: &mut CleanupStats) {
        let cutoff = now_ms - secs_to_millis(self.config.session_idle_seconds);
        let idle = match self.mesh.idle_sessions(cutoff).await {
            Ok(idle) => idle,
            Err(e) => {
                warn!(error = %e, "Failed to read idle sessions");
                stats.failures += 1;
                return;
            }
        };

        for session_id in idle {
            match self.sessions.destroy_session_complete(&session_id).await {
                Ok(()) => stats.sessions_destroyed += 1,
                Err(e) if e.is_not_found() => {
                    debug!(session_id = %session_id, "Idle session already gone");
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Failed to destroy idle session");
                    stats.failures += 1;
                    continue;
                }
            }
            if let Err(e) = self.mesh.clear_session_idle(&session_id).await {
                warn!(session_id = %session_id, error = %e, "Failed to clear idle marker");
            }
        }
    }

    async fn sweep_paths(&self, now_ms: i64, stats: &mut CleanupStats) {
        let cutoff = now_ms - secs_to_millis(self.config.path_idle_seconds);
        let idle = match self.mesh.idle_paths(cutoff).await {
            Ok(idle) => idle,
            Err(e) => {
                warn!(error = %e, "Failed to read idle paths");
                stats.failures += 1;
                return;
            }
        };

        for member in idle {
            match parse_inactive_path_member(&member) {
                Some((egress_id, session_id)) => {
                    match self.sessions.destroy_session_path(session_id, egress_id).await {
                        Ok(()) => stats.paths_destroyed += 1,
                        Err(e) if e.is_not_found() => {
                            debug!(member = %member, "Idle path already gone");
                        }
                        Err(e) => {
                            warn!(member = %member, error = %e, "Failed to destroy idle path");
                            stats.failures += 1;
                            continue;
                        }
                    }
                }
                None => warn!(member = %member, "Malformed inactive path entry"),
            }
            if let Err(e) = self.mesh.clear_path_idle(&member).await {
                warn!(member = %member, error = %e, "Failed to clear idle marker");
            }
        }
    }
}

fn secs_to_millis(seconds: u64) -> i64 {
    i64::try_from(seconds.saturating_mul(1000)).unwrap_or(i64::MAX)
}
