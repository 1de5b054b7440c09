//! Type conversions between state store types and placement types.
//!
//! Bridges `shipyard_state::{Cluster, Installation}` to the placement
//! engine's `Candidate` and `ResourceRequest`.

use shipyard_state::{Affinity, Cluster, ClusterState, Installation};
use thiserror::Error;

use crate::placer::Candidate;
use crate::scorer::{ClusterResources, ResourceRequest};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeError {
    #[error("unknown installation size {0:?}")]
    Unknown(String),
}

/// Replica count and per-replica request for a named installation size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeProfile {
    pub replicas: u64,
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

/// Sizes accepted on installations.
pub const SIZES: &[(&str, SizeProfile)] = &[
    ("100users", SizeProfile { replicas: 1, cpu_millis: 250, memory_bytes: 512 * MIB }),
    ("1000users", SizeProfile { replicas: 2, cpu_millis: 500, memory_bytes: 1024 * MIB }),
    ("5000users", SizeProfile { replicas: 3, cpu_millis: 1000, memory_bytes: 2048 * MIB }),
    ("10000users", SizeProfile { replicas: 4, cpu_millis: 1500, memory_bytes: 4096 * MIB }),
    ("25000users", SizeProfile { replicas: 6, cpu_millis: 2000, memory_bytes: 4096 * MIB }),
];

pub fn size_profile(size: &str) -> Result<SizeProfile, SizeError> {
    SIZES
        .iter()
        .find(|(name, _)| *name == size)
        .map(|(_, profile)| *profile)
        .ok_or_else(|| SizeError::Unknown(size.to_string()))
}

/// Total resources an installation of `size` requests from its cluster.
pub fn size_to_request(size: &str) -> Result<ResourceRequest, SizeError> {
    let profile = size_profile(size)?;
    Ok(ResourceRequest {
        cpu_millis: profile.cpu_millis * profile.replicas,
        memory_bytes: profile.memory_bytes * profile.replicas,
        pods: profile.replicas,
    })
}

/// Convert an [`Installation`] to the [`ResourceRequest`] placement checks.
pub fn installation_request(installation: &Installation) -> Result<ResourceRequest, SizeError> {
    size_to_request(&installation.size)
}

/// Whether placement must treat the installation as a sole tenant.
pub fn is_isolated(installation: &Installation) -> bool {
    installation.affinity == Affinity::Isolated
}

/// Convert a [`Cluster`] to a [`Candidate`].
///
/// `installations` are the live installations currently bound to the cluster.
pub fn cluster_to_candidate(
    cluster: &Cluster,
    resources: ClusterResources,
    installations: &[Installation],
) -> Candidate {
    Candidate {
        cluster_id: cluster.id.clone(),
        resources,
        installation_count: installations.len(),
        allow_installations: cluster.allow_installations,
        api_locked: cluster.meta.api_locked,
        is_stable: cluster.state == ClusterState::Stable,
        is_external: cluster.is_external(),
        hosts_isolated: installations.iter().any(is_isolated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_state::ClusterMetadata;

    #[test]
    fn known_sizes() {
        let r = size_to_request("1000users").unwrap();
        assert_eq!(r.pods, 2);
        assert_eq!(r.cpu_millis, 1000);
        assert_eq!(r.memory_bytes, 2048 * MIB);
        assert_eq!(
            size_to_request("huge"),
            Err(SizeError::Unknown("huge".to_string()))
        );
    }

    #[test]
    fn cluster_candidate_flags() {
        let mut cluster = Cluster::new("c1".into(), "external", ClusterMetadata::default(), 0);
        cluster.meta.api_locked = true;
        let candidate = cluster_to_candidate(&cluster, ClusterResources::default(), &[]);
        assert!(candidate.api_locked);
        assert!(candidate.is_external);
        assert!(!candidate.is_stable);
        assert!(!candidate.hosts_isolated);
        assert_eq!(candidate.installation_count, 0);
    }
}
