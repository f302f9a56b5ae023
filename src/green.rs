//! Green-time allocation for one signal cycle.
//!
//! The allocator is deliberately heuristic: demand per approach is a
//! weighted mix of queue length, time since the approach last had green,
//! and pressure; the cycle is split proportionally and clamped. Post-clamp
//! the slice sum may differ from the cycle time; the node scheduler runs
//! phases back-to-back regardless.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Bounds and cycle length for the allocator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct GreenParams {
    pub min_green: u32,
    pub max_green: u32,
    /// Total cycle length in seconds split across the approaches.
    pub cycle_time: f64,
}

impl Default for GreenParams {
    fn default() -> Self {
        Self {
            min_green: 8,
            max_green: 40,
            cycle_time: 100.0,
        }
    }
}

/// Per-approach observation fed to the allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeState {
    pub edge_id: String,
    pub total_vehicles: u32,
    pub queue_length_m: f64,
    pub pressure: f64,
    pub last_green_ts: i64,
}

/// Waiting time is capped so a long-starved approach cannot monopolize the
/// cycle.
const MAX_WAIT_S: f64 = 60.0;

/// Splits `params.cycle_time` across the given approaches by demand.
///
/// Returns `{edge_id: whole seconds}` in input order, every value clamped
/// to `[min_green, max_green]`. Zero total demand degenerates to equal
/// shares, which the clamp lifts to `min_green`.
pub fn compute_green_times(
    states: &[EdgeState],
    params: &GreenParams,
    now: i64,
) -> IndexMap<String, u32> {
    let mut demand: IndexMap<&str, f64> = IndexMap::with_capacity(states.len());

    for state in states {
        let waited = ((now - state.last_green_ts) as f64).min(MAX_WAIT_S);
        let d = 1.5 * state.queue_length_m + 0.8 * waited + 4.0 * state.pressure;
        demand.insert(state.edge_id.as_str(), d);
    }

    let total: f64 = demand.values().sum();
    let total = if total == 0.0 { 1.0 } else { total };

    let mut green_times = IndexMap::with_capacity(states.len());
    for state in states {
        let share = demand[state.edge_id.as_str()] / total * params.cycle_time;
        let seconds = (share as i64).clamp(params.min_green as i64, params.max_green as i64);
        green_times.insert(state.edge_id.clone(), seconds as u32);
    }

    green_times
}
