//! Stochastic routing tables derived from DV state.
//!
//! Vehicles do not follow the single cheapest path; each destination maps
//! to a probability distribution over near-optimal next hops, which spreads
//! load across alternatives instead of herding every car down one street.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::store::{StoreError, TrafficRepo};

/// Tunables for the table builder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TableParams {
    /// Softmax temperature: higher values concentrate probability on the
    /// cheapest hop.
    pub beta: f64,
    /// Candidates costing more than this multiple of the group minimum are
    /// dropped before weighting.
    pub max_cost_ratio: f64,
}

impl Default for TableParams {
    fn default() -> Self {
        Self {
            beta: 0.08,
            max_cost_ratio: 3.3,
        }
    }
}

/// One weighted next-hop option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopChoice {
    pub next_hop: String,
    pub prob: f64,
}

/// `destination -> weighted next hops`, probabilities summing to ~1 per
/// destination (modulo 4-decimal rounding).
pub type RoutingTable = HashMap<String, Vec<HopChoice>>;

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Builds the routing table for `node_id` from its DV rows.
///
/// Destinations with no rows are simply absent from the map.
pub fn build_routing_table(
    repo: &dyn TrafficRepo,
    node_id: &str,
    params: &TableParams,
) -> Result<RoutingTable, StoreError> {
    let routes = repo.find_routing_entries(Some(node_id), None, None)?;

    let mut by_destination: HashMap<String, Vec<(String, f64)>> = HashMap::new();
    for route in routes {
        by_destination
            .entry(route.destination_node_id)
            .or_default()
            .push((route.next_hop_node_id, route.cost));
    }

    let mut table = RoutingTable::new();
    for (destination, options) in by_destination {
        let best = options
            .iter()
            .map(|(_, cost)| *cost)
            .fold(f64::INFINITY, f64::min);

        let weighted: Vec<(String, f64)> = options
            .into_iter()
            .filter(|(_, cost)| *cost <= params.max_cost_ratio * best)
            .map(|(next_hop, cost)| (next_hop, (-params.beta * cost).exp()))
            .collect();

        let z: f64 = weighted.iter().map(|(_, w)| w).sum();
        let choices = weighted
            .into_iter()
            .map(|(next_hop, w)| HopChoice {
                next_hop,
                prob: round4(w / z),
            })
            .collect();
        table.insert(destination, choices);
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RouteKey, RoutingEntry};
    use crate::store::MemRepo;

    fn seed(repo: &MemRepo, rows: &[(&str, &str, &str, f64)]) {
        for (from, dest, via, cost) in rows {
            repo.create_routing_entry(RoutingEntry::new(
                RouteKey::new(*from, *dest, *via),
                *cost,
                0,
            ))
            .unwrap();
        }
    }

    #[test]
    fn test_expensive_alternative_is_filtered() {
        let repo = MemRepo::new();
        seed(
            &repo,
            &[
                ("A", "D", "B", 10.0),
                ("A", "D", "C", 15.0),
                ("A", "D", "E", 40.0), // 40 > 3.3 * 10
            ],
        );

        let table = build_routing_table(&repo, "A", &TableParams::default()).unwrap();
        let choices = &table["D"];
        assert_eq!(choices.len(), 2);
        assert!(choices.iter().all(|c| c.next_hop != "E"));

        // exp(-0.08 * 10) vs exp(-0.08 * 15): cheaper hop gets more mass.
        let by_hop: HashMap<&str, f64> =
            choices.iter().map(|c| (c.next_hop.as_str(), c.prob)).collect();
        assert!(by_hop["B"] > by_hop["C"]);
        let expected_b = ((-0.08f64 * 10.0).exp())
            / ((-0.08f64 * 10.0).exp() + (-0.08f64 * 15.0).exp());
        assert!((by_hop["B"] - expected_b).abs() < 1e-3);
    }

    #[test]
    fn test_probabilities_sum_to_one_per_destination() {
        let repo = MemRepo::new();
        seed(
            &repo,
            &[
                ("A", "D", "B", 12.0),
                ("A", "D", "C", 19.5),
                ("A", "D", "F", 30.0),
                ("A", "E", "B", 7.0),
                ("A", "A", "A", 0.0),
            ],
        );

        let table = build_routing_table(&repo, "A", &TableParams::default()).unwrap();
        for (dest, choices) in &table {
            let sum: f64 = choices.iter().map(|c| c.prob).sum();
            assert!((sum - 1.0).abs() < 1e-3, "probs for {dest} sum to {sum}");
        }
    }

    #[test]
    fn test_single_option_gets_probability_one() {
        let repo = MemRepo::new();
        seed(&repo, &[("A", "B", "B", 25.0)]);
        let table = build_routing_table(&repo, "A", &TableParams::default()).unwrap();
        assert_eq!(table["B"], vec![HopChoice { next_hop: "B".into(), prob: 1.0 }]);
    }

    #[test]
    fn test_other_nodes_rows_are_ignored() {
        let repo = MemRepo::new();
        seed(&repo, &[("A", "D", "B", 10.0), ("B", "D", "C", 4.0)]);
        let table = build_routing_table(&repo, "A", &TableParams::default()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table["D"].len(), 1);
    }

    #[test]
    fn test_node_without_rows_gets_empty_table() {
        let repo = MemRepo::new();
        let table = build_routing_table(&repo, "A", &TableParams::default()).unwrap();
        assert!(table.is_empty());
    }
}
