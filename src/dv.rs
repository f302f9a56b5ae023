//! Distance-vector routing engine.
//!
//! One call to [`run_dv_update_once`] is the atomic unit of progress: it
//! bootstraps direct-edge routes from live traffic costs, then performs a
//! single relaxation step over every active edge. Operators (or a
//! scheduler) invoke it repeatedly; with unchanged metrics the applied
//! change count falls to zero and stays there.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{Edge, RouteKey, RoutingEntry};
use crate::store::{StoreError, TrafficRepo};

/// Tunables for the DV engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DvParams {
    /// EMA weight given to a newly observed cost.
    pub alpha: f64,
    /// A candidate more than this factor above the incumbent is rejected,
    /// which stops count-to-infinity and poisoned-shortcut propagation.
    pub max_inflation: f64,
}

impl Default for DvParams {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            max_inflation: 1.5,
        }
    }
}

/// Link weight of an edge, derived from its outgoing-direction metrics.
///
/// Never drops below the `0.1 * road_length_m` floor term, so an empty
/// road still has positive cost.
pub fn edge_cost(edge: &Edge) -> f64 {
    let t = &edge.outgoing_traffic;
    0.6 * t.queue_length_m + 0.3 * t.pressure * 100.0 + 0.1 * edge.road_length_m
}

/// Runs one DV iteration and returns the number of routing writes that
/// changed persisted state in the bootstrap and propagation phases.
///
/// Writes that leave a cost bit-identical (the EMA fixed point) are not
/// counted, so a converged table reports zero.
pub fn run_dv_update_once(
    repo: &dyn TrafficRepo,
    params: &DvParams,
    now: i64,
) -> Result<usize, StoreError> {
    let edges = repo.active_edges()?;

    let mut all_nodes: BTreeSet<&str> = BTreeSet::new();
    for edge in &edges {
        all_nodes.insert(edge.in_node_id.as_str());
        all_nodes.insert(edge.out_node_id.as_str());
    }

    // Phase 0: every endpoint of an active edge holds a zero-cost route to
    // itself. Created once, never counted as a change.
    for node in &all_nodes {
        let key = RouteKey::self_route(node);
        let existing = repo.find_routing_entries(Some(node), Some(node), Some(node))?;
        if existing.is_empty() {
            repo.create_routing_entry(RoutingEntry::new(key, 0.0, now))?;
            debug!(node_id = %node, "created self-route");
        }
    }

    let mut changes = 0usize;

    // Phase 1: bootstrap direct routes from edge costs.
    for edge in &edges {
        let a = edge.in_node_id.as_str();
        let b = edge.out_node_id.as_str();
        let cost_ab = edge_cost(edge);
        let key = RouteKey::new(a, b, b);

        match repo
            .find_routing_entries(Some(a), Some(b), Some(b))?
            .into_iter()
            .next()
        {
            Some(existing) => {
                let smoothed = (1.0 - params.alpha) * existing.cost + params.alpha * cost_ab;
                if smoothed != existing.cost {
                    repo.upsert_routing_entry(&key, smoothed, now)?;
                    changes += 1;
                }
            }
            None => {
                repo.upsert_routing_entry(&key, cost_ab, now)?;
                changes += 1;
            }
        }
    }

    // Phase 2: single relaxation step. Route reads go against the live
    // store, so rows written earlier in this pass are visible to later
    // edges; the dedupe set keeps each (from, dest, via) candidate to one
    // evaluation per iteration.
    let mut processed: HashSet<(String, String, String)> = HashSet::new();

    for edge in &edges {
        let a = edge.in_node_id.as_str();
        let b = edge.out_node_id.as_str();
        let cost_ab = edge_cost(edge);

        let routes_from_b = match repo.find_routing_entries(Some(b), None, None) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(edge_id = %edge.edge_id, error = %err, "skipping edge in propagation");
                continue;
            }
        };

        for route in routes_from_b {
            let dest = route.destination_node_id.as_str();
            // A path A -> B -> ... -> A is never useful to A.
            if dest == a {
                continue;
            }

            let dedupe_key = (a.to_string(), dest.to_string(), b.to_string());
            if !processed.insert(dedupe_key) {
                continue;
            }

            let candidate = cost_ab + route.cost;
            let key = RouteKey::new(a, dest, b);

            match repo
                .find_routing_entries(Some(a), Some(dest), Some(b))?
                .into_iter()
                .next()
            {
                Some(existing) => {
                    if candidate > existing.cost * params.max_inflation {
                        continue;
                    }
                    let smoothed =
                        (1.0 - params.alpha) * existing.cost + params.alpha * candidate;
                    if smoothed != existing.cost {
                        repo.upsert_routing_entry(&key, smoothed, now)?;
                        changes += 1;
                    }
                }
                None => {
                    let best_existing = repo
                        .find_routing_entries(Some(a), Some(dest), None)?
                        .into_iter()
                        .map(|r| r.cost)
                        .fold(None::<f64>, |acc, c| {
                            Some(acc.map_or(c, |best| best.min(c)))
                        });
                    if let Some(best) = best_existing {
                        if candidate > best * params.max_inflation {
                            continue;
                        }
                    }
                    repo.upsert_routing_entry(&key, candidate, now)?;
                    changes += 1;
                }
            }
        }
    }

    info!(changes, nodes = all_nodes.len(), edges = edges.len(), "dv iteration complete");
    Ok(changes)
}
