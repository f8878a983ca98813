//! Node phase transitions and health bookkeeping.
//!
//! Every phase write funnels through [`set_node_phase`] so the progression
//! guard and the health invariants hold everywhere: `healthy` is true iff
//! the phase is `Ready`, and `phase_transition_time` moves iff the phase
//! does.

use chrono::{DateTime, Utc};

use crate::crd::{NodePhase, NodeStatus};

/// Whether a phase write from `current` to `new` is permitted.
///
/// Backward transitions on the provisioning axis are forbidden; a node that
/// reached `WaitingForK8s` is never dragged back to `CreatingServer` by a
/// transient query failure. Exceptions:
///
/// * `Ready` and `Failed` are always reachable.
/// * The decommission chain (`Draining` → `RemovingFromEtcd` →
///   `DeletingServer`) can be entered from anywhere and only moves forward.
/// * `Unhealthy` is only the demotion of a previously `Ready` node.
#[must_use]
pub fn should_update_phase(current: NodePhase, new: NodePhase) -> bool {
    if current == new {
        return false;
    }
    if matches!(new, NodePhase::Ready | NodePhase::Failed) {
        return true;
    }

    match (current.decommission_index(), new.decommission_index()) {
        (Some(c), Some(n)) => return n > c,
        (Some(_), None) => return false,
        (None, Some(_)) => return true,
        (None, None) => {}
    }

    if new == NodePhase::Unhealthy {
        return current == NodePhase::Ready;
    }
    if matches!(current, NodePhase::Unhealthy | NodePhase::Failed) {
        return false;
    }

    match (current.provisioning_index(), new.provisioning_index()) {
        (Some(c), Some(n)) => n > c,
        _ => false,
    }
}

/// Apply a phase transition if the guard allows it. Returns whether the
/// phase actually changed.
pub fn set_node_phase(
    node: &mut NodeStatus,
    new: NodePhase,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> bool {
    if !should_update_phase(node.phase, new) {
        return false;
    }

    node.phase = new;
    node.phase_reason = reason.map(String::from);
    node.phase_transition_time = Some(now);
    refresh_health(node, now);
    true
}

/// Recompute `healthy` / `unhealthySince` from the current phase.
pub fn refresh_health(node: &mut NodeStatus, now: DateTime<Utc>) {
    node.healthy = node.phase == NodePhase::Ready;
    if node.healthy {
        node.unhealthy_since = None;
        node.unhealthy_reason = None;
    } else if node.unhealthy_since.is_none() {
        node.unhealthy_since = Some(now);
    }
}

/// Seconds a node has been unhealthy, or 0 while healthy.
#[must_use]
pub fn unhealthy_seconds(node: &NodeStatus, now: DateTime<Utc>) -> i64 {
    node.unhealthy_since
        .map_or(0, |since| (now - since).num_seconds())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NodeRole;

    const PROVISIONING_CHAIN: [NodePhase; 8] = [
        NodePhase::CreatingServer,
        NodePhase::WaitingForIP,
        NodePhase::WaitingForTalosAPI,
        NodePhase::ApplyingTalosConfig,
        NodePhase::RebootingWithConfig,
        NodePhase::WaitingForK8s,
        NodePhase::NodeInitializing,
        NodePhase::Ready,
    ];

    #[test]
    fn test_forward_transitions_allowed() {
        for pair in PROVISIONING_CHAIN.windows(2) {
            assert!(
                should_update_phase(pair[0], pair[1]),
                "{} -> {} must be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_backward_transitions_forbidden_for_every_pair() {
        for (i, &ahead) in PROVISIONING_CHAIN.iter().enumerate() {
            for &behind in &PROVISIONING_CHAIN[..i] {
                if behind == NodePhase::Ready {
                    continue;
                }
                assert!(
                    !should_update_phase(ahead, behind),
                    "{ahead} -> {behind} must be forbidden"
                );
            }
        }
    }

    #[test]
    fn test_ready_and_failed_always_reachable() {
        for &phase in &PROVISIONING_CHAIN {
            if phase != NodePhase::Ready {
                assert!(should_update_phase(phase, NodePhase::Ready));
            }
            assert!(should_update_phase(phase, NodePhase::Failed));
        }
        assert!(should_update_phase(NodePhase::Draining, NodePhase::Failed));
        assert!(should_update_phase(NodePhase::Unhealthy, NodePhase::Ready));
    }

    #[test]
    fn test_decommission_chain_forward_only() {
        assert!(should_update_phase(
            NodePhase::Draining,
            NodePhase::RemovingFromEtcd
        ));
        assert!(should_update_phase(
            NodePhase::RemovingFromEtcd,
            NodePhase::DeletingServer
        ));
        assert!(!should_update_phase(
            NodePhase::DeletingServer,
            NodePhase::Draining
        ));
        assert!(!should_update_phase(
            NodePhase::RemovingFromEtcd,
            NodePhase::Draining
        ));
        // Entering decommission from the provisioning chain is allowed.
        assert!(should_update_phase(NodePhase::Ready, NodePhase::Draining));
        assert!(should_update_phase(
            NodePhase::Unhealthy,
            NodePhase::DeletingServer
        ));
        // Leaving it for anything but Ready/Failed is not.
        assert!(!should_update_phase(
            NodePhase::Draining,
            NodePhase::WaitingForK8s
        ));
    }

    #[test]
    fn test_unhealthy_only_demotes_ready() {
        assert!(should_update_phase(NodePhase::Ready, NodePhase::Unhealthy));
        assert!(!should_update_phase(
            NodePhase::WaitingForK8s,
            NodePhase::Unhealthy
        ));
        assert!(!should_update_phase(
            NodePhase::CreatingServer,
            NodePhase::Unhealthy
        ));
    }

    #[test]
    fn test_same_phase_is_a_no_op() {
        let now = Utc::now();
        let mut node = NodeStatus::new("n", NodeRole::Worker, now);
        let t0 = node.phase_transition_time;

        assert!(!set_node_phase(
            &mut node,
            NodePhase::CreatingServer,
            None,
            now + chrono::Duration::seconds(60)
        ));
        assert_eq!(node.phase_transition_time, t0, "transition time must not move");
    }

    #[test]
    fn test_transition_time_moves_with_phase() {
        let t0 = Utc::now();
        let mut node = NodeStatus::new("n", NodeRole::Worker, t0);
        let t1 = t0 + chrono::Duration::seconds(60);

        assert!(set_node_phase(&mut node, NodePhase::WaitingForIP, None, t1));
        assert_eq!(node.phase_transition_time, Some(t1));
    }

    #[test]
    fn test_healthy_iff_ready() {
        let now = Utc::now();
        let mut node = NodeStatus::new("n", NodeRole::Worker, now);
        assert!(!node.healthy);

        for &phase in &PROVISIONING_CHAIN[1..] {
            set_node_phase(&mut node, phase, None, now);
            assert_eq!(node.healthy, phase == NodePhase::Ready);
        }

        // Demotion clears healthy and stamps unhealthy_since.
        let later = now + chrono::Duration::seconds(30);
        set_node_phase(&mut node, NodePhase::Unhealthy, Some("node lost"), later);
        assert!(!node.healthy);
        assert_eq!(node.unhealthy_since, Some(later));

        // Recovery clears the unhealthy bookkeeping.
        set_node_phase(&mut node, NodePhase::Ready, None, later);
        assert!(node.healthy);
        assert!(node.unhealthy_since.is_none());
    }

    #[test]
    fn test_unhealthy_since_not_reset_while_unhealthy() {
        let now = Utc::now();
        let mut node = NodeStatus::new("n", NodeRole::Worker, now);
        set_node_phase(&mut node, NodePhase::Ready, None, now);

        let t1 = now + chrono::Duration::seconds(10);
        set_node_phase(&mut node, NodePhase::Unhealthy, None, t1);
        let t2 = now + chrono::Duration::seconds(90);
        refresh_health(&mut node, t2);
        assert_eq!(node.unhealthy_since, Some(t1));
        assert_eq!(unhealthy_seconds(&node, t2), 80);
    }
}
