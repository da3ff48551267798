//! Per-hop forwarding setup and backtracking teardown
//!
//! Relays are configured root-first so a relay never forwards before its
//! downstream is listening. Teardown walks the other way and stops at the
//! first relay that still forwards the session somewhere else.

use tracing::{debug, warn};

use mediatree_core::models::{RouteTarget, SessionEvent, SessionRecord};
use mediatree_core::{Error, MeshState, Result};

use crate::path::{extract_relay_nodes, next_hop};

/// Configure every hop of `path` for the session
///
/// The first failure aborts. Every node is recorded as a hop of the session
/// before it is told anything, so whatever a failed run leaves behind is
/// found again by [`reclaim_hops`].
pub async fn provision_path(mesh: &MeshState, session: &SessionRecord, path: &[String]) -> Result<()> {
    let session_id = session.session_id.as_str();

    for relay_id in extract_relay_nodes(path) {
        let target_id = next_hop(path, relay_id)
            .ok_or_else(|| Error::TopologyBroken(format!("{relay_id} has no next hop")))?;
        let target = mesh.load_node(target_id).await?;
        mesh.track_session_hop(session_id, relay_id).await?;

        if mesh.node_serves(relay_id, session_id).await? {
            let event = SessionEvent::RouteAdded {
                session_id: session_id.to_string(),
                target_id: target_id.to_string(),
            };
            mesh.publish_session(relay_id, &event).await?;
            debug!(relay_id = %relay_id, target_id = %target_id, "Added branch to forwarding relay");
        } else {
            let event = SessionEvent::SessionCreated {
                session_id: session_id.to_string(),
                audio_ssrc: session.audio_ssrc,
                video_ssrc: session.video_ssrc,
                routes: Some(vec![RouteTarget {
                    target_id: target_id.to_string(),
                    host: target.internal_host.clone(),
                    audio_port: target.internal_rtp_audio,
                    video_port: target.internal_rtp_video,
                }]),
            };
            mesh.publish_session(relay_id, &event).await?;
            mesh.add_node_session(relay_id, session_id).await?;
            debug!(relay_id = %relay_id, target_id = %target_id, "Started forwarding on relay");
        }

        mesh.add_route(session_id, relay_id, target_id).await?;
    }

    let egress_id = path
        .last()
        .ok_or_else(|| Error::TopologyBroken("empty path".to_string()))?;
    let event = SessionEvent::SessionCreated {
        session_id: session_id.to_string(),
        audio_ssrc: session.audio_ssrc,
        video_ssrc: session.video_ssrc,
        routes: None,
    };
    mesh.track_session_hop(session_id, egress_id).await?;
    mesh.publish_session(egress_id, &event).await?;
    mesh.add_node_session(egress_id, session_id).await?;
    Ok(())
}

/// Remove one egress's branch, releasing relays no other branch needs
///
/// Only a missing path is an error. Every other failure is logged and the
/// walk carries on.
pub async fn teardown_path(mesh: &MeshState, session_id: &str, egress_id: &str) -> Result<()> {
    let path = mesh
        .load_path(session_id, egress_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("path {session_id}:{egress_id}")))?;

    soft(
        mesh.remove_node_session(egress_id, session_id).await,
        "untrack egress session",
        egress_id,
    );
    soft(
        mesh.publish_session(egress_id, &destroyed(session_id)).await,
        "publish session-destroyed",
        egress_id,
    );
    soft(
        mesh.remove_session_egress(session_id, egress_id).await,
        "unlink egress from session",
        egress_id,
    );
    soft(
        mesh.delete_path(session_id, egress_id).await,
        "delete path",
        egress_id,
    );
    soft(
        mesh.untrack_session_hop(session_id, egress_id).await,
        "untrack hop",
        egress_id,
    );

    let mut target = egress_id.to_string();
    for relay_id in extract_relay_nodes(&path).iter().rev() {
        soft(
            mesh.remove_route(session_id, relay_id, &target).await,
            "remove route",
            relay_id,
        );

        let remaining = match mesh.route_count(session_id, relay_id).await {
            Ok(remaining) => remaining,
            Err(e) => {
                warn!(relay_id = %relay_id, session_id = %session_id, error = %e,
                    "Cannot count remaining routes, leaving relay in place");
                break;
            }
        };

        if remaining > 0 {
            let event = SessionEvent::RouteRemoved {
                session_id: session_id.to_string(),
                target_id: target.clone(),
            };
            soft(
                mesh.publish_session(relay_id, &event).await,
                "publish route-removed",
                relay_id,
            );
            debug!(relay_id = %relay_id, remaining, "Relay still shared, stopping teardown");
            break;
        }

        soft(
            mesh.publish_session(relay_id, &destroyed(session_id)).await,
            "publish session-destroyed",
            relay_id,
        );
        soft(
            mesh.remove_node_session(relay_id, session_id).await,
            "untrack relay session",
            relay_id,
        );
        soft(
            mesh.untrack_session_hop(session_id, relay_id).await,
            "untrack hop",
            relay_id,
        );
        target.clone_from(relay_id);
    }

    Ok(())
}

/// Stop the session on every hop still recorded for it
///
/// Meant for after every path is gone: a hop left at that point belongs to
/// a provisioning run that failed half way or a teardown that stopped early.
/// Returns the hops that were reclaimed.
pub async fn reclaim_hops(mesh: &MeshState, session_id: &str) -> Result<Vec<String>> {
    let hops = mesh.session_hops(session_id).await?;

    for node_id in &hops {
        soft(
            mesh.publish_session(node_id, &destroyed(session_id)).await,
            "publish session-destroyed",
            node_id,
        );
        soft(
            mesh.remove_node_session(node_id, session_id).await,
            "untrack node session",
            node_id,
        );
        soft(
            mesh.clear_routes(session_id, node_id).await,
            "clear routes",
            node_id,
        );
        soft(
            mesh.untrack_session_hop(session_id, node_id).await,
            "untrack hop",
            node_id,
        );
        debug!(node_id = %node_id, session_id = %session_id, "Reclaimed leftover hop");
    }

    Ok(hops)
}

pub fn destroyed(session_id: &str) -> SessionEvent {
    SessionEvent::SessionDestroyed {
        session_id: session_id.to_string(),
    }
}

fn soft<T>(result: Result<T>, step: &str, node_id: &str) {
    if let Err(e) = result {
        warn!(node_id = %node_id, step, error = %e, "Teardown step failed");
    }
}
