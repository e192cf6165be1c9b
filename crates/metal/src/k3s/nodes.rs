//! Parsing `kubectl get nodes -o wide --no-headers` output.

use crate::config::{ClusterConfig, NodeConfig};
use crate::state::ClusterStatus;

/// One row of the node listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Kubernetes node name.
    pub name: String,
    /// Whether the Ready condition is true.
    pub ready: bool,
    /// Roles column (`control-plane,master` or `<none>`).
    pub roles: String,
    /// Kubelet version.
    pub version: String,
    /// Internal IP, if reported.
    pub internal_ip: Option<String>,
}

impl NodeInfo {
    /// Whether this row is the machine described by `node`.
    ///
    /// A node matches by configured hostname, by internal IP, or by a node
    /// name equal to the configured host (DNS-addressed nodes).
    #[must_use]
    pub fn matches(&self, node: &NodeConfig) -> bool {
        node.hostname.as_deref() == Some(self.name.as_str())
            || self.internal_ip.as_deref() == Some(node.host.as_str())
            || self.name == node.host
    }
}

/// Parse the wide node listing.
///
/// Columns: NAME STATUS ROLES AGE VERSION INTERNAL-IP EXTERNAL-IP OS-IMAGE
/// KERNEL-VERSION CONTAINER-RUNTIME. Everything from OS-IMAGE on may contain
/// spaces and is ignored. Short or blank lines are skipped.
#[must_use]
pub fn parse_node_list(output: &str) -> Vec<NodeInfo> {
    output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 || cols[0] == "NAME" {
                return None;
            }
            Some(NodeInfo {
                name: cols[0].to_string(),
                // "Ready,SchedulingDisabled" is still Ready; "NotReady" is not.
                ready: cols[1].split(',').any(|s| s == "Ready"),
                roles: cols[2].to_string(),
                version: cols[4].to_string(),
                internal_ip: cols
                    .get(5)
                    .filter(|ip| **ip != "<none>")
                    .map(|ip| (*ip).to_string()),
            })
        })
        .collect()
}

/// Ready when every configured node appears Ready, degraded otherwise.
#[must_use]
pub fn derive_status(nodes: &[NodeInfo], cluster: &ClusterConfig) -> ClusterStatus {
    let all_ready = std::iter::once(&cluster.control_plane)
        .chain(&cluster.workers)
        .all(|configured| nodes.iter().any(|n| n.ready && n.matches(configured)));
    if all_ready {
        ClusterStatus::Ready
    } else {
        ClusterStatus::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;

    const LISTING: &str = "\
turing-1   Ready      control-plane,master   12m   v1.31.4+k3s1   10.0.0.10   <none>   Ubuntu 22.04.4 LTS   5.15.0-119-generic   containerd://1.7.23-k3s2
turing-2   NotReady   <none>                 40s   v1.31.4+k3s1   10.0.0.11   <none>   Ubuntu 22.04.4 LTS   5.15.0-119-generic   containerd://1.7.23-k3s2
";

    fn node(host: &str) -> NodeConfig {
        NodeConfig::new(host, Credentials::password("pw"))
    }

    #[test]
    fn test_parse_node_list() {
        let nodes = parse_node_list(LISTING);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "turing-1");
        assert!(nodes[0].ready);
        assert_eq!(nodes[0].roles, "control-plane,master");
        assert_eq!(nodes[0].version, "v1.31.4+k3s1");
        assert_eq!(nodes[0].internal_ip.as_deref(), Some("10.0.0.10"));
        assert!(!nodes[1].ready);
    }

    #[test]
    fn test_cordoned_node_is_ready_and_garbage_skipped() {
        let nodes = parse_node_list(
            "NAME STATUS ROLES AGE VERSION\n\nnode-a Ready,SchedulingDisabled <none> 1d v1.30.0\nNo resources found\n",
        );
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].ready);
        assert_eq!(nodes[0].internal_ip, None);
    }

    #[test]
    fn test_matching_by_hostname_ip_or_host() {
        let nodes = parse_node_list(LISTING);
        assert!(nodes[0].matches(&node("10.0.0.10")));
        assert!(nodes[1].matches(&node("192.168.9.9").with_hostname("turing-2")));
        assert!(nodes[0].matches(&node("turing-1")));
        assert!(!nodes[0].matches(&node("10.0.0.11")));
    }

    #[test]
    fn test_derive_status() {
        let cluster = ClusterConfig::new("demo", node("10.0.0.10")).with_worker(node("10.0.0.11"));
        let mut nodes = parse_node_list(LISTING);
        assert_eq!(derive_status(&nodes, &cluster), ClusterStatus::Degraded);

        nodes[1].ready = true;
        assert_eq!(derive_status(&nodes, &cluster), ClusterStatus::Ready);

        nodes.pop();
        assert_eq!(derive_status(&nodes, &cluster), ClusterStatus::Degraded);
    }
}
