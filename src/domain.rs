//! Domain model for the traffic-control fabric.
//!
//! Nodes and edges are flat documents keyed by string identifiers; edges
//! reference their endpoint nodes by id, never by object reference, so the
//! road graph can be cyclic without any ownership gymnastics. Traffic
//! metrics are a fixed, typed value struct embedded in the edge with one
//! slot per direction.

use serde::{Deserialize, Serialize};

/// Geographic position of an intersection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// A traffic intersection hosting a control agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Per-direction traffic state observed on an edge.
///
/// `last_update_ts` is monotonically non-decreasing; the store enforces
/// this on every metric write.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrafficMetrics {
    pub total_vehicles: u32,
    pub queue_length_m: f64,
    /// Occupied-area / road-area, in `[0, 1]`.
    pub density: f64,
    /// Weighted queue + density score, in `[0, 1]`.
    pub pressure: f64,
    /// Epoch seconds of the most recent green phase on this approach.
    pub last_green_ts: i64,
    /// Epoch seconds of the most recent metric write.
    pub last_update_ts: i64,
}

/// Partial metric update. Absent fields keep their stored values.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_vehicles: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_length_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub density: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_green_ts: Option<i64>,
}

impl MetricsPatch {
    /// Checks ranges before any write: lengths non-negative, density and
    /// pressure inside `[0, 1]`.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(q) = self.queue_length_m {
            if !q.is_finite() || q < 0.0 {
                return Err(format!("queue_length_m out of range: {q}"));
            }
        }
        for (name, value) in [("density", self.density), ("pressure", self.pressure)] {
            if let Some(v) = value {
                if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                    return Err(format!("{name} out of range: {v}"));
                }
            }
        }
        Ok(())
    }

    /// Merges the patch into `metrics`, leaving absent fields untouched.
    /// The caller stamps `last_update_ts`.
    pub fn apply(&self, metrics: &mut TrafficMetrics) {
        if let Some(v) = self.total_vehicles {
            metrics.total_vehicles = v;
        }
        if let Some(v) = self.queue_length_m {
            metrics.queue_length_m = v;
        }
        if let Some(v) = self.density {
            metrics.density = v;
        }
        if let Some(v) = self.pressure {
            metrics.pressure = v;
        }
        if let Some(v) = self.last_green_ts {
            metrics.last_green_ts = v;
        }
    }
}

/// Which of an edge's two metric slots a write addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Vehicles about to enter the tail node.
    Incoming,
    /// Vehicles leaving the tail node toward the head.
    Outgoing,
}

/// A directed road segment with a camera on its tail end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub edge_id: String,
    pub name: String,
    /// Tail node id.
    pub in_node_id: String,
    /// Head node id.
    pub out_node_id: String,
    pub camera_id: String,
    pub road_length_m: f64,
    pub road_width_m: f64,
    #[serde(default)]
    pub incoming_traffic: TrafficMetrics,
    #[serde(default)]
    pub outgoing_traffic: TrafficMetrics,
    pub is_active: bool,
    pub created_at: i64,
}

impl Edge {
    /// Infers which metric slot a write from `node_id`'s perspective lands
    /// in, or `None` when the node is on neither end.
    pub fn direction_for(&self, node_id: &str) -> Option<Direction> {
        if self.out_node_id == node_id {
            Some(Direction::Outgoing)
        } else if self.in_node_id == node_id {
            Some(Direction::Incoming)
        } else {
            None
        }
    }

    pub fn metrics(&self, direction: Direction) -> &TrafficMetrics {
        match direction {
            Direction::Incoming => &self.incoming_traffic,
            Direction::Outgoing => &self.outgoing_traffic,
        }
    }

    pub fn metrics_mut(&mut self, direction: Direction) -> &mut TrafficMetrics {
        match direction {
            Direction::Incoming => &mut self.incoming_traffic,
            Direction::Outgoing => &mut self.outgoing_traffic,
        }
    }
}

/// Unique key of a routing-table row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouteKey {
    pub from_node_id: String,
    pub destination_node_id: String,
    pub next_hop_node_id: String,
}

impl RouteKey {
    pub fn new(
        from: impl Into<String>,
        destination: impl Into<String>,
        next_hop: impl Into<String>,
    ) -> Self {
        Self {
            from_node_id: from.into(),
            destination_node_id: destination.into(),
            next_hop_node_id: next_hop.into(),
        }
    }

    /// Self-route `(n, n, n)` held by every active node at cost zero.
    pub fn self_route(node_id: &str) -> Self {
        Self::new(node_id, node_id, node_id)
    }
}

/// One row of the distance-vector table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub from_node_id: String,
    pub destination_node_id: String,
    pub next_hop_node_id: String,
    pub cost: f64,
    pub last_updated: i64,
}

impl RoutingEntry {
    pub fn new(key: RouteKey, cost: f64, now: i64) -> Self {
        Self {
            from_node_id: key.from_node_id,
            destination_node_id: key.destination_node_id,
            next_hop_node_id: key.next_hop_node_id,
            cost,
            last_updated: now,
        }
    }

    pub fn key(&self) -> RouteKey {
        RouteKey::new(
            self.from_node_id.clone(),
            self.destination_node_id.clone(),
            self.next_hop_node_id.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge_between(tail: &str, head: &str) -> Edge {
        Edge {
            edge_id: "E1".into(),
            name: format!("{tail} to {head}"),
            in_node_id: tail.into(),
            out_node_id: head.into(),
            camera_id: "CAM_E1".into(),
            road_length_m: 120.0,
            road_width_m: 10.0,
            incoming_traffic: TrafficMetrics::default(),
            outgoing_traffic: TrafficMetrics::default(),
            is_active: true,
            created_at: 0,
        }
    }

    #[test]
    fn test_direction_inference() {
        let edge = edge_between("X", "Y");
        assert_eq!(edge.direction_for("Y"), Some(Direction::Outgoing));
        assert_eq!(edge.direction_for("X"), Some(Direction::Incoming));
        assert_eq!(edge.direction_for("Z"), None);
    }

    #[test]
    fn test_patch_merges_only_present_fields() {
        let mut metrics = TrafficMetrics {
            total_vehicles: 7,
            queue_length_m: 30.0,
            density: 0.5,
            pressure: 0.4,
            last_green_ts: 100,
            last_update_ts: 100,
        };
        let patch = MetricsPatch {
            queue_length_m: Some(12.5),
            pressure: Some(0.9),
            ..Default::default()
        };
        patch.apply(&mut metrics);
        assert_eq!(metrics.total_vehicles, 7);
        assert_eq!(metrics.queue_length_m, 12.5);
        assert_eq!(metrics.density, 0.5);
        assert_eq!(metrics.pressure, 0.9);
        assert_eq!(metrics.last_green_ts, 100);
    }

    #[test]
    fn test_patch_validation_rejects_out_of_range() {
        let bad_density = MetricsPatch {
            density: Some(1.2),
            ..Default::default()
        };
        assert!(bad_density.validate().is_err());

        let negative_queue = MetricsPatch {
            queue_length_m: Some(-3.0),
            ..Default::default()
        };
        assert!(negative_queue.validate().is_err());

        let ok = MetricsPatch {
            total_vehicles: Some(4),
            density: Some(0.0),
            pressure: Some(1.0),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_patch_rejects_unknown_fields() {
        let raw = r#"{"total_vehicles": 3, "wheelbase_m": 2.7}"#;
        assert!(serde_json::from_str::<MetricsPatch>(raw).is_err());
    }

    #[test]
    fn test_self_route_key() {
        let key = RouteKey::self_route("N4");
        assert_eq!(key.from_node_id, "N4");
        assert_eq!(key.destination_node_id, "N4");
        assert_eq!(key.next_hop_node_id, "N4");
    }
}
