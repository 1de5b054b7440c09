//! Node operations the rotator needs from the cluster backend.
//!
//! Methods return boxed futures so the trait stays object-safe; the
//! supervisor holds the backend as `Arc<dyn NodeDrainer>`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by every [`NodeDrainer`] method. Errors are opaque
/// backend messages.
pub type DrainFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send + 'a>>;

pub trait NodeDrainer: Send + Sync {
    /// Mark a node unschedulable.
    fn cordon<'a>(&'a self, cluster_id: &'a str, node: &'a str) -> DrainFuture<'a, ()>;

    /// Make a cordoned node schedulable again.
    fn uncordon<'a>(&'a self, cluster_id: &'a str, node: &'a str) -> DrainFuture<'a, ()>;

    /// Pods currently running on a node that must be evicted.
    fn list_pods<'a>(&'a self, cluster_id: &'a str, node: &'a str) -> DrainFuture<'a, Vec<String>>;

    /// Evict one pod, giving it `grace` to terminate.
    fn evict_pod<'a>(
        &'a self,
        cluster_id: &'a str,
        node: &'a str,
        pod: &'a str,
        grace: Duration,
    ) -> DrainFuture<'a, ()>;

    /// Terminate drained nodes and bring up replacements. Returns the new
    /// node names.
    fn replace_nodes<'a>(
        &'a self,
        cluster_id: &'a str,
        nodes: &'a [String],
    ) -> DrainFuture<'a, Vec<String>>;

    /// Whether a node has joined the cluster and reports ready.
    fn node_ready<'a>(&'a self, cluster_id: &'a str, node: &'a str) -> DrainFuture<'a, bool>;
}
