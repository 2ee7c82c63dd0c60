/// Cluster Health and Status
///
/// Aggregates membership, consensus, replication and resource state into a
/// coarse cluster status plus a list of concrete issues an operator can act
/// on. Evaluation is a pure function of its inputs so it can run anywhere:
/// in the supervisor, in tests, or against recorded snapshots.
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::consensus::ReplicaStatus;
use crate::node::{NodeDescriptor, NodeLiveness};
use crate::replication::ReplicationStatus;
use crate::scaler::{ResourceSample, ScalingTrigger};

/// Overall cluster status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStatus {
    /// Fully operational.
    Healthy,
    /// Operational but something needs attention.
    Degraded,
    /// Quorum lost; writes cannot make progress.
    Failed,
}

/// Aggregated health summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub total_nodes: usize,
    pub live_nodes: usize,
    pub suspect_nodes: usize,
    pub has_leader: bool,
    pub has_quorum: bool,
    pub status: ClusterStatus,
}

impl ClusterHealth {
    /// Build a summary from registry descriptors and leadership knowledge.
    pub fn from_descriptors(nodes: &[NodeDescriptor], has_leader: bool) -> Self {
        let total_nodes = nodes.len();
        let live_nodes = nodes.iter().filter(|n| n.is_live()).count();
        let suspect_nodes = nodes
            .iter()
            .filter(|n| n.liveness == NodeLiveness::Suspect)
            .count();
        let has_quorum = total_nodes > 0 && live_nodes * 2 > total_nodes;

        let status = if !has_quorum {
            ClusterStatus::Failed
        } else if suspect_nodes > 0 || !has_leader || live_nodes < total_nodes {
            ClusterStatus::Degraded
        } else {
            ClusterStatus::Healthy
        };

        Self {
            total_nodes,
            live_nodes,
            suspect_nodes,
            has_leader,
            has_quorum,
            status,
        }
    }

    pub fn is_operational(&self) -> bool {
        matches!(self.status, ClusterStatus::Healthy | ClusterStatus::Degraded)
    }
}

/// Kind of detected problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthIssueType {
    QuorumLost,
    NoLeader,
    NodeSuspect,
    RegionDisconnected,
    HighCpuUsage,
    HighMemoryUsage,
    HighDiskUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IssueSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// One actionable problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIssue {
    pub issue_type: HealthIssueType,
    pub severity: IssueSeverity,
    /// What the issue is about: a node id, a region id.
    pub subject: String,
    pub message: String,
    pub detected_at: SystemTime,
}

impl HealthIssue {
    fn new(
        issue_type: HealthIssueType,
        severity: IssueSeverity,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            issue_type,
            severity,
            subject: subject.into(),
            message: message.into(),
            detected_at: SystemTime::now(),
        }
    }
}

/// Stateless issue detector.
pub struct HealthChecker;

impl HealthChecker {
    /// Evaluate the cluster across all dimensions. Issues come back sorted
    /// most severe first.
    pub fn evaluate(
        nodes: &[NodeDescriptor],
        consensus: &ReplicaStatus,
        regions: &[ReplicationStatus],
        samples: &[ResourceSample],
        trigger: &ScalingTrigger,
    ) -> (ClusterHealth, Vec<HealthIssue>) {
        let has_leader = consensus.leader_hint.is_some();
        let health = ClusterHealth::from_descriptors(nodes, has_leader);
        let mut issues = Vec::new();

        if !health.has_quorum {
            issues.push(HealthIssue::new(
                HealthIssueType::QuorumLost,
                IssueSeverity::Critical,
                "cluster",
                format!(
                    "{} of {} nodes live; replicated writes are blocked",
                    health.live_nodes, health.total_nodes
                ),
            ));
        }
        if !has_leader {
            issues.push(HealthIssue::new(
                HealthIssueType::NoLeader,
                IssueSeverity::Error,
                "consensus",
                format!("no known leader at term {}", consensus.term),
            ));
        }
        for node in nodes {
            if node.liveness == NodeLiveness::Suspect {
                issues.push(HealthIssue::new(
                    HealthIssueType::NodeSuspect,
                    IssueSeverity::Warning,
                    node.id.as_str(),
                    "heartbeat overdue, node suspected",
                ));
            }
        }
        for region in regions {
            if !region.connected {
                issues.push(HealthIssue::new(
                    HealthIssueType::RegionDisconnected,
                    IssueSeverity::Error,
                    region.region.clone(),
                    match &region.error {
                        Some(e) => format!("region unreachable: {}", e),
                        None => "region unreachable".to_string(),
                    },
                ));
            }
        }
        for sample in samples {
            Self::check_resource(&mut issues, sample, trigger);
        }

        issues.sort_by(|a, b| b.severity.cmp(&a.severity));
        (health, issues)
    }

    fn check_resource(issues: &mut Vec<HealthIssue>, sample: &ResourceSample, trigger: &ScalingTrigger) {
        let checks = [
            (
                sample.cpu_pct,
                trigger.cpu_threshold,
                HealthIssueType::HighCpuUsage,
                "cpu",
            ),
            (
                sample.mem_pct,
                trigger.mem_threshold,
                HealthIssueType::HighMemoryUsage,
                "memory",
            ),
            (
                sample.disk_pct,
                trigger.disk_threshold,
                HealthIssueType::HighDiskUsage,
                "disk",
            ),
        ];
        for (value, threshold, issue_type, label) in checks {
            if value >= threshold {
                issues.push(HealthIssue::new(
                    issue_type,
                    IssueSeverity::Warning,
                    sample.node.as_str(),
                    format!("{} at {:.1}% (threshold {:.1}%)", label, value, threshold),
                ));
            }
        }
    }

}
