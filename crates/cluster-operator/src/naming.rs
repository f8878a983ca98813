//! Server naming, size normalization and label helpers.

use std::collections::BTreeMap;

use rand::Rng;

use crate::crd::NodeRole;

/// Value of the `managed-by` label on every server the engine creates.
pub const MANAGED_BY: &str = "talos-cloud-operator";

/// Alphabet for name suffixes; lowercase alphanumerics keep the result a
/// valid hostname and Kubernetes node name.
const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of the random name suffix.
const SUFFIX_LEN: usize = 5;

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

/// Generate a control plane server name: `<cluster>-cp-<suffix>`.
#[must_use]
pub fn control_plane(cluster: &str) -> String {
    format!("{cluster}-cp-{}", random_suffix())
}

/// Generate a worker server name: `<cluster>-worker-<suffix>`.
#[must_use]
pub fn worker(cluster: &str) -> String {
    format!("{cluster}-worker-{}", random_suffix())
}

/// Generate a server name for a role.
#[must_use]
pub fn for_role(cluster: &str, role: NodeRole) -> String {
    match role {
        NodeRole::ControlPlane => control_plane(cluster),
        NodeRole::Worker => worker(cluster),
    }
}

/// Generate a replacement server name for a role given by its label value.
/// Roles beyond the two known ones fall back to their first two characters;
/// no such role exists today, the branch is kept for forward compatibility.
#[must_use]
pub fn replacement_server_name(cluster: &str, role: &str) -> String {
    let short = match role {
        "control-plane" => "cp",
        "worker" => "worker",
        other => &other[..other.len().min(2)],
    };
    format!("{cluster}-{short}-{}", random_suffix())
}

/// Name for the per-batch ephemeral SSH key.
#[must_use]
pub fn ephemeral_key_name(cluster: &str, role: NodeRole, unix_ts: i64) -> String {
    format!("ephemeral-{cluster}-{}-{unix_ts}", role.as_str())
}

/// Labels attached to every server the engine creates.
#[must_use]
pub fn server_labels(cluster: &str, role: NodeRole) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("cluster".to_string(), cluster.to_string()),
        ("role".to_string(), role.as_str().to_string()),
        ("pool".to_string(), format!("{cluster}-{}", role.as_str())),
        ("managed-by".to_string(), MANAGED_BY.to_string()),
    ])
}

/// Label selector matching every server of a cluster.
#[must_use]
pub fn cluster_selector(cluster: &str) -> String {
    format!("cluster={cluster},managed-by={MANAGED_BY}")
}

/// Normalize a friendly server size to a provider type name. Anything not
/// in the table passes through untouched, so spec authors can use provider
/// type names directly.
#[must_use]
pub fn normalize_server_type(size: &str) -> &str {
    match size {
        "small" => "cpx21",
        "medium" => "cpx31",
        "large" => "cpx41",
        "xlarge" => "cpx51",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_shapes() {
        let cp = control_plane("demo");
        assert!(cp.starts_with("demo-cp-"));
        assert_eq!(cp.len(), "demo-cp-".len() + SUFFIX_LEN);

        let w = worker("demo");
        assert!(w.starts_with("demo-worker-"));
    }

    #[test]
    fn test_suffix_alphabet() {
        for _ in 0..50 {
            let name = control_plane("x");
            let suffix = name.rsplit('-').next().unwrap();
            assert!(suffix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_replacement_name_known_roles() {
        assert!(replacement_server_name("demo", "control-plane").starts_with("demo-cp-"));
        assert!(replacement_server_name("demo", "worker").starts_with("demo-worker-"));
    }

    #[test]
    fn test_replacement_name_unknown_role_uses_two_chars() {
        assert!(replacement_server_name("demo", "gateway").starts_with("demo-ga-"));
        assert!(replacement_server_name("demo", "x").starts_with("demo-x-"));
    }

    #[test]
    fn test_names_are_unique() {
        let a = worker("demo");
        let b = worker("demo");
        assert_ne!(a, b);
    }

    #[test]
    fn test_server_labels() {
        let labels = server_labels("demo", NodeRole::Worker);
        assert_eq!(labels.get("cluster").unwrap(), "demo");
        assert_eq!(labels.get("role").unwrap(), "worker");
        assert_eq!(labels.get("pool").unwrap(), "demo-worker");
        assert_eq!(labels.get("managed-by").unwrap(), MANAGED_BY);
    }

    #[test]
    fn test_size_mapping() {
        assert_eq!(normalize_server_type("small"), "cpx21");
        assert_eq!(normalize_server_type("medium"), "cpx31");
        assert_eq!(normalize_server_type("cpx51"), "cpx51");
        assert_eq!(normalize_server_type("cax31"), "cax31");
    }

    #[test]
    fn test_ephemeral_key_name() {
        assert_eq!(
            ephemeral_key_name("demo", NodeRole::ControlPlane, 1_700_000_000),
            "ephemeral-demo-control-plane-1700000000"
        );
    }
}
