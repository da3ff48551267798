//! Session lifecycle
//!
//! A session is admitted dormant on an injection, gains one path per egress
//! as viewers arrive and is torn down path by path. Operations on the same
//! session id are serialised in process; across replicas the store is the
//! only coordination and the cleanup job reclaims what races leave behind.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use mediatree_core::models::{
    now_millis, NodeKind, SessionDetail, SessionInfo, SessionRecord, ViewerInfo,
};
use mediatree_core::{Error, MeshState, Result};

use super::injection_api::{CreateSessionRequest, InjectionApi};
use super::routing::{destroyed, provision_path, reclaim_hops, teardown_path};
use crate::path::PathBuilder;
use crate::selector::NodeSelector;

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Exclusive hold on one session id
///
/// Dropping it releases the lock and removes the map entry unless another
/// caller has cloned it in the meantime.
struct SessionGuard<'a> {
    locks: &'a LockMap,
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct SessionManager {
    mesh: MeshState,
    selector: Arc<NodeSelector>,
    paths: PathBuilder,
    injection_api: Arc<dyn InjectionApi>,
    locks: LockMap,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        mesh: MeshState,
        selector: Arc<NodeSelector>,
        paths: PathBuilder,
        injection_api: Arc<dyn InjectionApi>,
    ) -> Self {
        Self {
            mesh,
            selector,
            paths,
            injection_api,
            locks: DashMap::new(),
        }
    }

    async fn lock_session(&self, session_id: &str) -> SessionGuard<'_> {
        let lock = self
            .locks
            .entry(session_id.to_string())
            .or_default()
            .value()
            .clone();
        let guard = lock.lock_owned().await;
        SessionGuard {
            locks: &self.locks,
            session_id: session_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Admit a session on an injection without any downstream path
    pub async fn create_session(&self, session_id: &str) -> Result<SessionInfo> {
        if session_id.is_empty() || session_id.contains(':') || session_id.contains(',') {
            return Err(Error::InvalidInput(format!(
                "invalid session id '{session_id}'"
            )));
        }

        let _guard = self.lock_session(session_id).await;

        if self.mesh.session_exists(session_id).await? {
            return Err(Error::AlreadyExists(format!("session {session_id}")));
        }

        let injection_id = self.selector.select_injection().await?;
        match self.admit(session_id, &injection_id).await {
            Ok(info) => Ok(info),
            Err(e) => {
                if let Err(release) = self.selector.release_injection(&injection_id).await {
                    warn!(injection_id = %injection_id, error = %release, "Failed to release admission slot");
                }
                Err(e)
            }
        }
    }

    async fn admit(&self, session_id: &str, injection_id: &str) -> Result<SessionInfo> {
        let injection = self.mesh.load_node(injection_id).await?;
        let relay_root_id = self
            .mesh
            .children(injection_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::TopologyBroken(format!("injection {injection_id} has no relay root"))
            })?;

        let (audio_ssrc, video_ssrc) = self.mesh.next_ssrc_pair().await?;
        let room_id = self.mesh.next_room_id().await?;
        let record = SessionRecord {
            session_id: session_id.to_string(),
            injection_node_id: injection_id.to_string(),
            relay_root_id,
            audio_ssrc,
            video_ssrc,
            room_id,
            active: true,
            created_at: now_millis(),
        };
        self.mesh.insert_session(&record).await?;

        let request = CreateSessionRequest {
            session_id: session_id.to_string(),
            room_id,
            audio_ssrc,
            video_ssrc,
        };
        let response = match self.injection_api.create_session(&injection, &request).await {
            Ok(response) => response,
            Err(e) => {
                if let Err(rollback) = self.mesh.remove_session(&record).await {
                    warn!(session_id = %session_id, error = %rollback, "Failed to roll back session record");
                }
                return Err(e);
            }
        };

        info!(
            session_id = %session_id,
            injection_id = %injection_id,
            room_id,
            audio_ssrc,
            video_ssrc,
            "Session created"
        );

        Ok(SessionInfo {
            session_id: record.session_id,
            injection_node_id: record.injection_node_id,
            relay_root_id: record.relay_root_id,
            audio_ssrc,
            video_ssrc,
            room_id,
            whip_endpoint: format!("{}{}", injection.internal_api_base(), response.endpoint),
            active: true,
            created_at: record.created_at,
        })
    }

    /// Place a viewer, reusing a serving egress whenever one has room
    pub async fn provision_viewer(&self, session_id: &str) -> Result<ViewerInfo> {
        let _guard = self.lock_session(session_id).await;

        let record = self
            .mesh
            .load_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        for egress_id in self.mesh.session_egresses(session_id).await? {
            if !self.selector.can_accept_viewer(&egress_id).await {
                continue;
            }
            let Some(path) = self.mesh.load_path(session_id, &egress_id).await? else {
                warn!(session_id = %session_id, egress_id = %egress_id, "Serving egress has no stored path");
                continue;
            };
            let egress = self.mesh.load_node(&egress_id).await?;

            info!(session_id = %session_id, egress_id = %egress_id, "Reusing serving egress");
            return Ok(ViewerInfo {
                session_id: session_id.to_string(),
                egress_node_id: egress_id,
                egress_port: egress.external_api_port,
                whep_endpoint: egress.whep_endpoint(session_id),
                path,
                reused: true,
            });
        }

        let egress_id = self.selector.select_egress_for_session(&record).await?;
        let path = self
            .paths
            .build(&record.injection_node_id, &record.relay_root_id, &egress_id)
            .await?;
        let egress = self.mesh.load_node(&egress_id).await?;

        provision_path(&self.mesh, &record, &path).await?;

        self.mesh.add_session_egress(session_id, &egress_id).await?;
        self.mesh.save_path(session_id, &egress_id, &path).await?;
        self.mesh
            .adjust_used_slots(NodeKind::Egress, &egress_id, 1.0)
            .await?;

        info!(
            session_id = %session_id,
            egress_id = %egress_id,
            path = %path.join(" -> "),
            "Viewer path provisioned"
        );

        Ok(ViewerInfo {
            session_id: session_id.to_string(),
            egress_port: egress.external_api_port,
            whep_endpoint: egress.whep_endpoint(session_id),
            egress_node_id: egress_id,
            path,
            reused: false,
        })
    }

    /// Remove one egress's branch of the session
    pub async fn destroy_session_path(&self, session_id: &str, egress_id: &str) -> Result<()> {
        let _guard = self.lock_session(session_id).await;
        self.destroy_path_locked(session_id, egress_id).await
    }

    async fn destroy_path_locked(&self, session_id: &str, egress_id: &str) -> Result<()> {
        teardown_path(&self.mesh, session_id, egress_id).await?;

        if let Err(e) = self
            .mesh
            .adjust_used_slots(NodeKind::Egress, egress_id, -1.0)
            .await
        {
            warn!(egress_id = %egress_id, error = %e, "Failed to decrement egress load");
        }
        info!(session_id = %session_id, egress_id = %egress_id, "Viewer path destroyed");
        Ok(())
    }

    /// Tear down every path, then the session itself
    pub async fn destroy_session_complete(&self, session_id: &str) -> Result<()> {
        let _guard = self.lock_session(session_id).await;

        let record = self
            .mesh
            .load_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        let egresses = self
            .mesh
            .session_egresses(session_id)
            .await
            .unwrap_or_else(|e| {
                warn!(session_id = %session_id, error = %e, "Failed to list session egresses");
                Vec::new()
            });
        for egress_id in &egresses {
            match self.destroy_path_locked(session_id, egress_id).await {
                Ok(()) => {}
                Err(Error::NotFound(_)) => {
                    // Index entry without a path; drop the dangling references
                    if let Err(e) = self.mesh.remove_session_egress(session_id, egress_id).await {
                        warn!(session_id = %session_id, egress_id = %egress_id, error = %e, "Failed to unlink egress without path");
                    }
                    if let Err(e) = self.mesh.remove_node_session(egress_id, session_id).await {
                        warn!(session_id = %session_id, egress_id = %egress_id, error = %e, "Failed to untrack egress without path");
                    }
                }
                Err(e) => {
                    warn!(session_id = %session_id, egress_id = %egress_id, error = %e, "Failed to destroy path");
                }
            }
        }

        match reclaim_hops(&self.mesh, session_id).await {
            Ok(hops) if !hops.is_empty() => {
                warn!(session_id = %session_id, hops = ?hops, "Reclaimed hops left by an incomplete path");
            }
            Ok(_) => {}
            Err(e) => warn!(session_id = %session_id, error = %e, "Failed to list session hops"),
        }

        let injection_id = record.injection_node_id.as_str();
        if let Err(e) = self
            .mesh
            .publish_session(injection_id, &destroyed(session_id))
            .await
        {
            warn!(injection_id = %injection_id, error = %e, "Failed to publish session-destroyed");
        }
        self.mesh.remove_session(&record).await?;

        if let Err(e) = self.selector.release_injection(injection_id).await {
            warn!(injection_id = %injection_id, error = %e, "Failed to release admission slot");
        }
        match self.mesh.find_node(injection_id).await {
            Ok(Some(injection)) => {
                if let Err(e) = self
                    .injection_api
                    .destroy_session(&injection, session_id)
                    .await
                {
                    warn!(injection_id = %injection_id, error = %e, "Injection did not acknowledge session destroy");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(injection_id = %injection_id, error = %e, "Failed to load injection"),
        }

        info!(session_id = %session_id, paths = egresses.len(), "Session destroyed");
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionDetail> {
        let session = self
            .mesh
            .load_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        let egresses = self.mesh.session_egresses(session_id).await?;
        Ok(SessionDetail { session, egresses })
    }

    /// Every indexed session; index entries without a record are skipped
    pub async fn list_sessions(&self) -> Result<Vec<SessionDetail>> {
        let mut sessions = Vec::new();
        for session_id in self.mesh.list_sessions().await? {
            match self.get_session(&session_id).await {
                Ok(detail) => sessions.push(detail),
                Err(Error::NotFound(_)) => {
                    warn!(session_id = %session_id, "Indexed session has no record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::LoadCalculator;
    use crate::session::injection_api::{CreateSessionResponse, MockInjectionApi};
    use crate::testing::{add_child, add_injection, mesh, record, single_branch};
    use mediatree_core::config::LoadConfig;
    use mediatree_core::models::MetricKind;
    use mediatree_core::store::MemoryStateStore;
    use serde_json::Value;

    fn accepting_api() -> MockInjectionApi {
        let mut api = MockInjectionApi::new();
        api.expect_create_session().returning(|_, request| {
            Ok(CreateSessionResponse {
                session_id: request.session_id.clone(),
                endpoint: format!("/whip/endpoint/{}", request.session_id),
                room_id: request.room_id,
                audio_ssrc: request.audio_ssrc,
                video_ssrc: request.video_ssrc,
                recipients: Vec::new(),
            })
        });
        api.expect_destroy_session().returning(|_, _| Ok(()));
        api
    }

    fn manager_with(mesh: &MeshState, api: MockInjectionApi) -> SessionManager {
        let paths = PathBuilder::new(mesh.clone(), 10);
        let selector = NodeSelector::new(
            mesh.clone(),
            LoadCalculator::new(mesh.clone(), LoadConfig::default()),
            paths.clone(),
        );
        SessionManager::new(mesh.clone(), Arc::new(selector), paths, Arc::new(api))
    }

    fn manager(mesh: &MeshState) -> SessionManager {
        manager_with(mesh, accepting_api())
    }

    fn events_on(store: &MemoryStateStore, node_id: &str) -> Vec<Value> {
        store
            .published_on(&format!("sessions:{node_id}"))
            .iter()
            .map(|payload| serde_json::from_str(payload).unwrap())
            .collect()
    }

    fn kinds_on(store: &MemoryStateStore, node_id: &str) -> Vec<String> {
        events_on(store, node_id)
            .iter()
            .map(|event| event["type"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_s1_admission_and_first_viewer() {
        let (mesh, store) = mesh();
        single_branch(&mesh).await;
        let sessions = manager(&mesh);

        let info = sessions.create_session("sess-A").await.unwrap();
        assert_eq!(info.injection_node_id, "inj-1");
        assert_eq!(info.relay_root_id, "relay-root-1");
        assert_eq!((info.audio_ssrc, info.video_ssrc, info.room_id), (10000, 10001, 1000));
        assert_eq!(info.whip_endpoint, "http://inj-1:7070/whip/endpoint/sess-A");
        assert!(mesh.session_exists("sess-A").await.unwrap());
        assert!(mesh.node_serves("inj-1", "sess-A").await.unwrap());
        assert_eq!(mesh.used_slots(NodeKind::Injection, "inj-1").await.unwrap(), 1.0);
        // Dormant: nothing downstream yet
        assert!(store.published().is_empty());

        let viewer = sessions.provision_viewer("sess-A").await.unwrap();
        assert!(!viewer.reused);
        assert_eq!(viewer.egress_node_id, "eg-1");
        assert_eq!(viewer.path, vec!["inj-1", "relay-root-1", "eg-1"]);

        let root_events = events_on(&store, "relay-root-1");
        assert_eq!(root_events.len(), 1);
        assert_eq!(root_events[0]["type"], "session-created");
        assert_eq!(root_events[0]["routes"][0]["targetId"], "eg-1");
        assert_eq!(root_events[0]["audioSsrc"], 10000);

        let egress_events = events_on(&store, "eg-1");
        assert_eq!(egress_events.len(), 1);
        assert!(egress_events[0]["routes"].is_null());

        assert_eq!(mesh.routes("sess-A", "relay-root-1").await.unwrap(), vec!["eg-1"]);
        assert_eq!(mesh.session_egresses("sess-A").await.unwrap(), vec!["eg-1"]);
        assert_eq!(mesh.used_slots(NodeKind::Egress, "eg-1").await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_s2_multicast_reuse() {
        let (mesh, store) = mesh();
        single_branch(&mesh).await;
        let sessions = manager(&mesh);
        sessions.create_session("sess-A").await.unwrap();
        let first = sessions.provision_viewer("sess-A").await.unwrap();
        store.clear_published();

        let second = sessions.provision_viewer("sess-A").await.unwrap();
        assert!(second.reused);
        assert_eq!(second.egress_node_id, "eg-1");
        assert_eq!(second.path, first.path);
        assert_eq!(second.whep_endpoint, first.whep_endpoint);
        assert!(store.published().is_empty());
    }

    #[tokio::test]
    async fn test_s3_s4_s5_split_and_backtrack() {
        let (mesh, store) = mesh();
        single_branch(&mesh).await;
        let sessions = manager(&mesh);
        sessions.create_session("sess-A").await.unwrap();
        sessions.provision_viewer("sess-A").await.unwrap();

        // eg-1 is full, eg-2 joins under the same root
        add_child(&mesh, "relay-root-1", "eg-2", NodeKind::Egress).await;
        record(&mesh, "eg-1", MetricKind::JanusStreaming, &[("janusTotalViewers", 10.0)]).await;
        store.clear_published();

        // S3
        let viewer = sessions.provision_viewer("sess-A").await.unwrap();
        assert!(!viewer.reused);
        assert_eq!(viewer.path, vec!["inj-1", "relay-root-1", "eg-2"]);
        let root_events = events_on(&store, "relay-root-1");
        assert_eq!(root_events.len(), 1);
        assert_eq!(root_events[0]["type"], "route-added");
        assert_eq!(root_events[0]["targetId"], "eg-2");
        assert_eq!(kinds_on(&store, "eg-2"), vec!["session-created"]);
        assert_eq!(
            mesh.routes("sess-A", "relay-root-1").await.unwrap(),
            vec!["eg-1", "eg-2"]
        );
        store.clear_published();

        // S4
        sessions.destroy_session_path("sess-A", "eg-1").await.unwrap();
        assert_eq!(kinds_on(&store, "eg-1"), vec!["session-destroyed"]);
        let root_events = events_on(&store, "relay-root-1");
        assert_eq!(root_events.len(), 1);
        assert_eq!(root_events[0]["type"], "route-removed");
        assert_eq!(root_events[0]["targetId"], "eg-1");
        assert!(mesh.node_serves("relay-root-1", "sess-A").await.unwrap());
        assert_eq!(mesh.used_slots(NodeKind::Egress, "eg-1").await.unwrap(), 0.0);
        store.clear_published();

        // S5
        sessions.destroy_session_path("sess-A", "eg-2").await.unwrap();
        assert_eq!(kinds_on(&store, "eg-2"), vec!["session-destroyed"]);
        assert_eq!(kinds_on(&store, "relay-root-1"), vec!["session-destroyed"]);
        assert!(!mesh.node_serves("relay-root-1", "sess-A").await.unwrap());

        sessions.destroy_session_complete("sess-A").await.unwrap();
        assert_eq!(kinds_on(&store, "inj-1"), vec!["session-destroyed"]);
        assert!(!mesh.session_exists("sess-A").await.unwrap());
    }

    #[tokio::test]
    async fn test_round_trip_leaves_no_session_keys() {
        let (mesh, store) = mesh();
        single_branch(&mesh).await;
        add_child(&mesh, "relay-root-1", "relay-1", NodeKind::Relay).await;
        add_child(&mesh, "relay-1", "eg-2", NodeKind::Egress).await;
        let sessions = manager(&mesh);

        sessions.create_session("sess-A").await.unwrap();
        sessions.provision_viewer("sess-A").await.unwrap();
        record(&mesh, "eg-1", MetricKind::JanusStreaming, &[("janusTotalViewers", 10.0)]).await;
        let deep = sessions.provision_viewer("sess-A").await.unwrap();
        assert_eq!(deep.path, vec!["inj-1", "relay-root-1", "relay-1", "eg-2"]);

        sessions.destroy_session_complete("sess-A").await.unwrap();

        let leftovers: Vec<String> = store
            .keys()
            .into_iter()
            .filter(|k| {
                k.starts_with("session:")
                    || k == "sessions:all"
                    || k.starts_with("routes:")
                    || k.starts_with("path:")
                    || (k.starts_with("node:") && k.ends_with(":sessions"))
            })
            .collect();
        assert!(leftovers.is_empty(), "leftover keys: {leftovers:?}");
        assert_eq!(mesh.used_slots(NodeKind::Injection, "inj-1").await.unwrap(), 0.0);
        assert_eq!(mesh.used_slots(NodeKind::Egress, "eg-2").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_destroy_path_twice_is_not_found() {
        let (mesh, _) = mesh();
        single_branch(&mesh).await;
        let sessions = manager(&mesh);
        sessions.create_session("sess-A").await.unwrap();
        sessions.provision_viewer("sess-A").await.unwrap();

        sessions.destroy_session_path("sess-A", "eg-1").await.unwrap();
        assert!(sessions
            .destroy_session_path("sess-A", "eg-1")
            .await
            .unwrap_err()
            .is_not_found());
        // The session itself is untouched
        assert!(sessions.get_session("sess-A").await.unwrap().egresses.is_empty());
        assert_eq!(mesh.used_slots(NodeKind::Egress, "eg-1").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_path_without_relays_publishes_only_to_egress() {
        let (mesh, store) = mesh();
        add_injection(&mesh, "inj-1", "relay-root-1").await;
        let session = SessionRecord {
            session_id: "sess-A".to_string(),
            injection_node_id: "inj-1".to_string(),
            relay_root_id: "relay-root-1".to_string(),
            audio_ssrc: 10000,
            video_ssrc: 10001,
            room_id: 1000,
            active: true,
            created_at: 1,
        };
        crate::testing::add_node(&mesh, "eg-1", NodeKind::Egress).await;

        let path = vec!["inj-1".to_string(), "eg-1".to_string()];
        provision_path(&mesh, &session, &path).await.unwrap();

        let published = store.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "sessions:eg-1");
        assert!(mesh.node_serves("eg-1", "sess-A").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_session_is_rejected() {
        let (mesh, _) = mesh();
        single_branch(&mesh).await;
        let sessions = manager(&mesh);
        sessions.create_session("sess-A").await.unwrap();

        assert!(matches!(
            sessions.create_session("sess-A").await,
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            sessions.create_session("bad:id").await,
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(mesh.used_slots(NodeKind::Injection, "inj-1").await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_rejected_admission_rolls_back() {
        let (mesh, _) = mesh();
        single_branch(&mesh).await;
        let mut api = MockInjectionApi::new();
        api.expect_create_session()
            .times(1)
            .returning(|_, _| Err(Error::Protocol("injection answered 500".to_string())));
        let sessions = manager_with(&mesh, api);

        assert!(matches!(
            sessions.create_session("sess-A").await,
            Err(Error::Protocol(_))
        ));
        assert!(!mesh.session_exists("sess-A").await.unwrap());
        assert!(mesh.load_session("sess-A").await.unwrap().is_none());
        assert!(!mesh.node_serves("inj-1", "sess-A").await.unwrap());
        assert_eq!(mesh.used_slots(NodeKind::Injection, "inj-1").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_injection_without_root_releases_slot() {
        let (mesh, _) = mesh();
        crate::testing::add_node(&mesh, "inj-1", NodeKind::Injection).await;
        // Healthy by metrics, but the topology is broken
        let mut api = MockInjectionApi::new();
        api.expect_create_session().never();
        let paths = PathBuilder::new(mesh.clone(), 10);
        let loads = LoadCalculator::new(
            mesh.clone(),
            LoadConfig {
                health_limit: 101.0,
                ..LoadConfig::default()
            },
        );
        let selector = NodeSelector::new(mesh.clone(), loads, paths.clone());
        let sessions = SessionManager::new(mesh.clone(), Arc::new(selector), paths, Arc::new(api));

        assert!(matches!(
            sessions.create_session("sess-A").await,
            Err(Error::TopologyBroken(_))
        ));
        assert_eq!(mesh.used_slots(NodeKind::Injection, "inj-1").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_viewer_for_unknown_session() {
        let (mesh, _) = mesh();
        single_branch(&mesh).await;
        assert!(manager(&mesh)
            .provision_viewer("missing")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_failed_publish_aborts_provisioning() {
        let (mesh, store) = mesh();
        single_branch(&mesh).await;
        let sessions = manager(&mesh);
        sessions.create_session("sess-A").await.unwrap();
        store.fail_publish_on("sessions:eg-1");

        assert!(sessions.provision_viewer("sess-A").await.is_err());
        assert!(mesh.session_egresses("sess-A").await.unwrap().is_empty());
        assert!(mesh.load_path("sess-A", "eg-1").await.unwrap().is_none());
        // The root publish already happened and is left for teardown
        assert!(mesh.node_serves("relay-root-1", "sess-A").await.unwrap());
        assert_eq!(
            mesh.session_hops("sess-A").await.unwrap(),
            vec!["eg-1", "relay-root-1"]
        );
    }

    #[tokio::test]
    async fn test_destroy_reclaims_half_provisioned_path() {
        let (mesh, store) = mesh();
        single_branch(&mesh).await;
        let sessions = manager(&mesh);
        sessions.create_session("sess-A").await.unwrap();
        store.fail_publish_on("sessions:eg-1");
        assert!(sessions.provision_viewer("sess-A").await.is_err());
        store.clear_published();

        sessions.destroy_session_complete("sess-A").await.unwrap();

        assert_eq!(kinds_on(&store, "relay-root-1"), vec!["session-destroyed"]);
        assert!(!mesh.node_serves("relay-root-1", "sess-A").await.unwrap());
        assert!(mesh.routes("sess-A", "relay-root-1").await.unwrap().is_empty());
        let leftovers: Vec<String> = store
            .keys()
            .into_iter()
            .filter(|k| {
                k.starts_with("session:")
                    || k.starts_with("routes:")
                    || (k.starts_with("node:") && k.ends_with(":sessions"))
            })
            .collect();
        assert!(leftovers.is_empty(), "leftover keys: {leftovers:?}");
    }

    #[tokio::test]
    async fn test_destroy_drops_egress_without_path() {
        let (mesh, _) = mesh();
        single_branch(&mesh).await;
        let sessions = manager(&mesh);
        sessions.create_session("sess-A").await.unwrap();
        mesh.add_session_egress("sess-A", "eg-1").await.unwrap();
        mesh.add_node_session("eg-1", "sess-A").await.unwrap();

        sessions.destroy_session_complete("sess-A").await.unwrap();
        assert!(mesh.session_egresses("sess-A").await.unwrap().is_empty());
        assert!(!mesh.node_serves("eg-1", "sess-A").await.unwrap());
        assert!(!mesh.session_exists("sess-A").await.unwrap());
    }

    #[tokio::test]
    async fn test_session_locks_do_not_accumulate() {
        let (mesh, _) = mesh();
        single_branch(&mesh).await;
        let sessions = manager(&mesh);

        for i in 0..200 {
            assert!(sessions
                .provision_viewer(&format!("missing-{i}"))
                .await
                .unwrap_err()
                .is_not_found());
            assert!(sessions
                .destroy_session_path(&format!("gone-{i}"), "eg-1")
                .await
                .unwrap_err()
                .is_not_found());
        }
        sessions.create_session("sess-A").await.unwrap();
        sessions.provision_viewer("sess-A").await.unwrap();
        sessions.destroy_session_complete("sess-A").await.unwrap();

        assert!(sessions.locks.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_keeps_session_lock_alive() {
        let (mesh, _) = mesh();
        single_branch(&mesh).await;
        let sessions = Arc::new(manager(&mesh));

        let held = sessions.lock_session("sess-A").await;
        let waiter = {
            let sessions = sessions.clone();
            tokio::spawn(async move {
                let _guard = sessions.lock_session("sess-A").await;
            })
        };
        // Map, held guard and the parked waiter
        while Arc::strong_count(sessions.locks.get("sess-A").unwrap().value()) < 3 {
            tokio::task::yield_now().await;
        }

        drop(held);
        assert!(sessions.locks.contains_key("sess-A"));
        waiter.await.unwrap();
        assert!(sessions.locks.is_empty());
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let (mesh, _) = mesh();
        single_branch(&mesh).await;
        let sessions = manager(&mesh);
        sessions.create_session("sess-B").await.unwrap();
        sessions.create_session("sess-A").await.unwrap();
        sessions.provision_viewer("sess-A").await.unwrap();

        let listed = sessions.list_sessions().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].session.session_id, "sess-A");
        assert_eq!(listed[0].egresses, vec!["eg-1"]);
        assert!(listed[1].egresses.is_empty());
    }
}
