//! Traffic-state store and topology repository.
//!
//! The coordinator is the only writer. `TrafficRepo` is the seam between
//! the routing engine and whatever document store backs a deployment;
//! [`MemRepo`] is the in-process implementation, three collections behind
//! read-write locks, every mutation atomic at the document level. The DV
//! engine tolerates stale reads, so no cross-document transactions exist.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use thiserror::Error;

use crate::domain::{Direction, Edge, MetricsPatch, Node, RouteKey, RoutingEntry};
use crate::error::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("missing document: {0}")]
    Missing(String),

    /// Transient backing-store failure; safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Abstract topology + traffic-state repository.
pub trait TrafficRepo: Send + Sync {
    fn create_node(&self, node: Node) -> Result<Node, StoreError>;
    fn find_node(&self, node_id: &str) -> Result<Option<Node>, StoreError>;

    fn create_edge(&self, edge: Edge) -> Result<Edge, StoreError>;
    fn find_edge(&self, edge_id: &str) -> Result<Option<Edge>, StoreError>;
    /// Edges whose `out_node_id` is `node_id`, i.e. the approaches whose
    /// cameras report to that node's green computation.
    fn find_edges_by_out_node(&self, node_id: &str, active_only: bool)
        -> Result<Vec<Edge>, StoreError>;
    /// All active edges, ordered by edge id so DV iterations are
    /// deterministic.
    fn active_edges(&self) -> Result<Vec<Edge>, StoreError>;

    /// Merges `patch` into the named metric slot and stamps
    /// `last_update_ts` (never backwards).
    fn update_edge_metrics(
        &self,
        edge_id: &str,
        direction: Direction,
        patch: &MetricsPatch,
        now: i64,
    ) -> Result<Edge, StoreError>;

    fn create_routing_entry(&self, entry: RoutingEntry) -> Result<RoutingEntry, StoreError>;
    /// Rows matching every filter that is `Some`, ordered by key.
    fn find_routing_entries(
        &self,
        from: Option<&str>,
        destination: Option<&str>,
        next_hop: Option<&str>,
    ) -> Result<Vec<RoutingEntry>, StoreError>;
    fn upsert_routing_entry(
        &self,
        key: &RouteKey,
        cost: f64,
        now: i64,
    ) -> Result<RoutingEntry, StoreError>;
}

/// In-memory document store. Collections are `BTreeMap`s so scans come back
/// in key order.
#[derive(Default)]
pub struct MemRepo {
    nodes: RwLock<BTreeMap<String, Node>>,
    edges: RwLock<BTreeMap<String, Edge>>,
    routes: RwLock<BTreeMap<RouteKey, RoutingEntry>>,
}

impl MemRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrafficRepo for MemRepo {
    fn create_node(&self, node: Node) -> Result<Node, StoreError> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&node.node_id) {
            return Err(StoreError::DuplicateKey(format!("node {}", node.node_id)));
        }
        nodes.insert(node.node_id.clone(), node.clone());
        Ok(node)
    }

    fn find_node(&self, node_id: &str) -> Result<Option<Node>, StoreError> {
        Ok(self.nodes.read().get(node_id).cloned())
    }

    fn create_edge(&self, edge: Edge) -> Result<Edge, StoreError> {
        let mut edges = self.edges.write();
        if edges.contains_key(&edge.edge_id) {
            return Err(StoreError::DuplicateKey(format!("edge {}", edge.edge_id)));
        }
        edges.insert(edge.edge_id.clone(), edge.clone());
        Ok(edge)
    }

    fn find_edge(&self, edge_id: &str) -> Result<Option<Edge>, StoreError> {
        Ok(self.edges.read().get(edge_id).cloned())
    }

    fn find_edges_by_out_node(
        &self,
        node_id: &str,
        active_only: bool,
    ) -> Result<Vec<Edge>, StoreError> {
        Ok(self
            .edges
            .read()
            .values()
            .filter(|e| e.out_node_id == node_id && (!active_only || e.is_active))
            .cloned()
            .collect())
    }

    fn active_edges(&self) -> Result<Vec<Edge>, StoreError> {
        Ok(self
            .edges
            .read()
            .values()
            .filter(|e| e.is_active)
            .cloned()
            .collect())
    }

    fn update_edge_metrics(
        &self,
        edge_id: &str,
        direction: Direction,
        patch: &MetricsPatch,
        now: i64,
    ) -> Result<Edge, StoreError> {
        let mut edges = self.edges.write();
        let edge = edges
            .get_mut(edge_id)
            .ok_or_else(|| StoreError::Missing(format!("edge {edge_id}")))?;
        let metrics = edge.metrics_mut(direction);
        patch.apply(metrics);
        metrics.last_update_ts = metrics.last_update_ts.max(now);
        Ok(edge.clone())
    }

    fn create_routing_entry(&self, entry: RoutingEntry) -> Result<RoutingEntry, StoreError> {
        let mut routes = self.routes.write();
        let key = entry.key();
        if routes.contains_key(&key) {
            return Err(StoreError::DuplicateKey(format!(
                "route {} -> {} via {}",
                key.from_node_id, key.destination_node_id, key.next_hop_node_id
            )));
        }
        routes.insert(key, entry.clone());
        Ok(entry)
    }

    fn find_routing_entries(
        &self,
        from: Option<&str>,
        destination: Option<&str>,
        next_hop: Option<&str>,
    ) -> Result<Vec<RoutingEntry>, StoreError> {
        Ok(self
            .routes
            .read()
            .values()
            .filter(|r| from.is_none_or(|f| r.from_node_id == f))
            .filter(|r| destination.is_none_or(|d| r.destination_node_id == d))
            .filter(|r| next_hop.is_none_or(|n| r.next_hop_node_id == n))
            .cloned()
            .collect())
    }

    fn upsert_routing_entry(
        &self,
        key: &RouteKey,
        cost: f64,
        now: i64,
    ) -> Result<RoutingEntry, StoreError> {
        let mut routes = self.routes.write();
        let entry = routes
            .entry(key.clone())
            .and_modify(|e| {
                e.cost = cost;
                e.last_updated = now;
            })
            .or_insert_with(|| RoutingEntry::new(key.clone(), cost, now));
        Ok(entry.clone())
    }
}

/// Metric update from a node's perspective: the direction is inferred from
/// which end of the edge the node sits on.
pub fn update_traffic_by_node(
    repo: &dyn TrafficRepo,
    node_id: &str,
    edge_id: &str,
    patch: &MetricsPatch,
    now: i64,
) -> Result<Edge, Error> {
    let edge = repo
        .find_edge(edge_id)?
        .ok_or_else(|| Error::NotFound(format!("edge {edge_id}")))?;
    let direction = edge.direction_for(node_id).ok_or_else(|| Error::NotConnected {
        node_id: node_id.to_string(),
        edge_id: edge_id.to_string(),
    })?;
    Ok(repo.update_edge_metrics(edge_id, direction, patch, now)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::TrafficMetrics;

    pub(crate) fn node(id: &str) -> Node {
        Node {
            node_id: id.into(),
            name: format!("Node {id}"),
            location: None,
            is_active: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub(crate) fn edge(id: &str, tail: &str, head: &str, length_m: f64) -> Edge {
        Edge {
            edge_id: id.into(),
            name: format!("{tail} to {head}"),
            in_node_id: tail.into(),
            out_node_id: head.into(),
            camera_id: format!("CAM_{id}"),
            road_length_m: length_m,
            road_width_m: 10.0,
            incoming_traffic: TrafficMetrics::default(),
            outgoing_traffic: TrafficMetrics::default(),
            is_active: true,
            created_at: 0,
        }
    }

    #[test]
    fn test_duplicate_node_is_conflict() {
        let repo = MemRepo::new();
        repo.create_node(node("N1")).unwrap();
        let err = repo.create_node(node("N1")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));
    }

    #[test]
    fn test_edges_by_out_node_filters_head_and_active() {
        let repo = MemRepo::new();
        repo.create_edge(edge("E1", "B", "A", 100.0)).unwrap();
        repo.create_edge(edge("E2", "C", "A", 100.0)).unwrap();
        repo.create_edge(edge("E3", "A", "B", 100.0)).unwrap();
        let mut inactive = edge("E4", "D", "A", 100.0);
        inactive.is_active = false;
        repo.create_edge(inactive).unwrap();

        let reporting = repo.find_edges_by_out_node("A", true).unwrap();
        let ids: Vec<_> = reporting.iter().map(|e| e.edge_id.as_str()).collect();
        assert_eq!(ids, ["E1", "E2"]);

        let all = repo.find_edges_by_out_node("A", false).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_update_metrics_stamps_monotonic_timestamp() {
        let repo = MemRepo::new();
        repo.create_edge(edge("E1", "A", "B", 100.0)).unwrap();

        let patch = MetricsPatch {
            queue_length_m: Some(25.0),
            ..Default::default()
        };
        let updated = repo
            .update_edge_metrics("E1", Direction::Outgoing, &patch, 1_000)
            .unwrap();
        assert_eq!(updated.outgoing_traffic.last_update_ts, 1_000);

        // A write with an earlier clock must not move the stamp backwards.
        let updated = repo
            .update_edge_metrics("E1", Direction::Outgoing, &patch, 900)
            .unwrap();
        assert_eq!(updated.outgoing_traffic.last_update_ts, 1_000);
        assert_eq!(updated.incoming_traffic.last_update_ts, 0);
    }

    #[test]
    fn test_direction_inference_writes_correct_slot() {
        let repo = MemRepo::new();
        repo.create_edge(edge("E1", "X", "Y", 100.0)).unwrap();
        let patch = MetricsPatch {
            total_vehicles: Some(9),
            ..Default::default()
        };

        let from_head = update_traffic_by_node(&repo, "Y", "E1", &patch, 10).unwrap();
        assert_eq!(from_head.outgoing_traffic.total_vehicles, 9);
        assert_eq!(from_head.incoming_traffic.total_vehicles, 0);

        let from_tail = update_traffic_by_node(&repo, "X", "E1", &patch, 20).unwrap();
        assert_eq!(from_tail.incoming_traffic.total_vehicles, 9);

        let err = update_traffic_by_node(&repo, "Z", "E1", &patch, 30).unwrap_err();
        assert!(matches!(err, Error::NotConnected { .. }));
    }

    #[test]
    fn test_unknown_edge_update_is_not_found() {
        let repo = MemRepo::new();
        let err =
            update_traffic_by_node(&repo, "X", "E404", &MetricsPatch::default(), 0).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_route_filters_compose() {
        let repo = MemRepo::new();
        for (f, d, n, c) in [
            ("A", "B", "B", 10.0),
            ("A", "C", "B", 15.0),
            ("A", "C", "C", 20.0),
            ("B", "C", "C", 5.0),
        ] {
            repo.create_routing_entry(RoutingEntry::new(RouteKey::new(f, d, n), c, 0))
                .unwrap();
        }

        assert_eq!(repo.find_routing_entries(Some("A"), None, None).unwrap().len(), 3);
        assert_eq!(
            repo.find_routing_entries(Some("A"), Some("C"), None).unwrap().len(),
            2
        );
        let exact = repo
            .find_routing_entries(Some("A"), Some("C"), Some("C"))
            .unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].cost, 20.0);
    }

    #[test]
    fn test_upsert_overwrites_and_duplicate_create_conflicts() {
        let repo = MemRepo::new();
        let key = RouteKey::new("A", "B", "B");
        repo.upsert_routing_entry(&key, 12.0, 1).unwrap();
        repo.upsert_routing_entry(&key, 9.0, 2).unwrap();

        let rows = repo.find_routing_entries(Some("A"), None, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cost, 9.0);
        assert_eq!(rows[0].last_updated, 2);

        let err = repo
            .create_routing_entry(RoutingEntry::new(key, 1.0, 3))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));
    }
}
