//! Intersection node agent.
//!
//! Two long-lived activities share one process: the phase scheduler ticks
//! once a second, rotating through the green schedule and recomputing it
//! shortly before the current phase runs out, while the vehicle responder
//! answers one next-hop query per TCP connection from the cached routing
//! table. The cache is read-mostly and replaced wholesale on refresh, so
//! readers always see an internally consistent table.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::client::{ClientError, CoordinatorClient};
use crate::config::NodeConfig;
use crate::error::Error;
use crate::routing_table::{HopChoice, RoutingTable};

/// A vehicle query cannot exceed this many bytes.
const MAX_REQUEST_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One slot of the green rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub edge_id: String,
    pub green_s: u32,
}

/// Green rotation state: the ordered schedule, the active slot, and when
/// it ends.
#[derive(Debug)]
pub struct PhaseSchedule {
    phases: Vec<Phase>,
    current: usize,
    phase_end: i64,
    recompute_before: i64,
}

impl PhaseSchedule {
    pub fn new(recompute_before: i64) -> Self {
        Self {
            phases: Vec::new(),
            current: 0,
            phase_end: 0,
            recompute_before,
        }
    }

    /// True inside the pre-empt window: the schedule must be refreshed
    /// before the current phase runs out. An empty schedule is always due.
    pub fn needs_recompute(&self, now: i64) -> bool {
        self.phase_end - now <= self.recompute_before
    }

    /// Replaces the rotation with a fresh allocator result and restarts it
    /// at the first slot.
    pub fn install(&mut self, green_times: &IndexMap<String, u32>, now: i64) {
        self.phases = green_times
            .iter()
            .map(|(edge_id, &green_s)| Phase {
                edge_id: edge_id.clone(),
                green_s,
            })
            .collect();
        self.current = 0;
        self.phase_end = now + self.phases.first().map_or(0, |p| i64::from(p.green_s));
    }

    /// Moves to the next slot once the current one has elapsed, returning
    /// the newly green phase.
    pub fn advance_if_due(&mut self, now: i64) -> Option<&Phase> {
        if self.phases.is_empty() || now < self.phase_end {
            return None;
        }
        self.current = (self.current + 1) % self.phases.len();
        self.phase_end = now + i64::from(self.phases[self.current].green_s);
        Some(&self.phases[self.current])
    }

    pub fn current_phase(&self) -> Option<&Phase> {
        self.phases.get(self.current)
    }
}

/// Samples one next hop weighted by `prob`. Falls back to the first choice
/// if the weights are degenerate (all zero after rounding).
pub fn sample_next_hop<'a, R: Rng + ?Sized>(
    choices: &'a [HopChoice],
    rng: &mut R,
) -> Option<&'a str> {
    if choices.is_empty() {
        return None;
    }
    match WeightedIndex::new(choices.iter().map(|c| c.prob)) {
        Ok(dist) => Some(choices[dist.sample(rng)].next_hop.as_str()),
        Err(_) => Some(choices[0].next_hop.as_str()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum VehicleRequest {
    #[serde(rename = "NEXT_EDGE")]
    NextEdge { car_id: String, destination: String },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum VehicleReply {
    NextEdge { next_edge: String },
    Error { error: &'static str },
}

pub struct NodeAgent {
    config: NodeConfig,
    client: CoordinatorClient,
    table: RwLock<RoutingTable>,
    schedule: Mutex<PhaseSchedule>,
    rng: Mutex<StdRng>,
}

impl NodeAgent {
    pub fn new(config: NodeConfig) -> Self {
        let client = CoordinatorClient::new(config.coordinator_url.clone());
        let schedule = PhaseSchedule::new(config.recompute_before_secs as i64);
        Self {
            client,
            table: RwLock::new(RoutingTable::new()),
            schedule: Mutex::new(schedule),
            rng: Mutex::new(StdRng::from_entropy()),
            config,
        }
    }

    /// Brings the node online: loads the routing table, computes the first
    /// schedule, then runs the scheduler and the responder until process
    /// exit.
    pub async fn run(self: Arc<Self>) -> Result<(), AgentError> {
        self.refresh_table().await?;
        if let Err(err) = self.recompute_green().await {
            warn!(error = %err, "initial green computation failed; scheduler will retry");
        }

        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.scheduler_loop().await });

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(
            node_id = %self.config.node_id,
            addr = %self.config.listen_addr,
            "vehicle responder listening"
        );
        self.serve_vehicles(listener).await
    }

    async fn refresh_table(&self) -> Result<(), ClientError> {
        let response = self.client.fetch_table(&self.config.node_id).await?;
        let destinations = response.routing_table.len();
        *self.table.write() = response.routing_table;
        info!(node_id = %self.config.node_id, destinations, "routing table loaded");
        Ok(())
    }

    /// Captures one frame per configured edge and asks the coordinator for
    /// a fresh schedule. Unreadable frames are skipped so one dead camera
    /// does not stall the whole intersection.
    async fn recompute_green(&self) -> Result<(), ClientError> {
        let mut images = Vec::with_capacity(self.config.edge_images.len());
        for (edge_id, path) in &self.config.edge_images {
            match tokio::fs::read(path).await {
                Ok(bytes) => images.push((edge_id.clone(), bytes)),
                Err(err) => {
                    warn!(edge_id = %edge_id, path = %path.display(), error = %err, "skipping unreadable frame");
                }
            }
        }

        let response = self
            .client
            .calculate_green(&self.config.node_id, images)
            .await?;
        let now = Utc::now().timestamp();
        let mut schedule = self.schedule.lock();
        schedule.install(&response.green_times, now);
        info!(
            node_id = %self.config.node_id,
            phases = response.green_times.len(),
            "green schedule updated"
        );
        Ok(())
    }

    async fn scheduler_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            let now = Utc::now().timestamp();
            let due = self.schedule.lock().needs_recompute(now);
            if due {
                if let Err(err) = self.recompute_green().await {
                    warn!(error = %err, "green recompute failed; keeping current schedule");
                }
            }

            let now = Utc::now().timestamp();
            let mut schedule = self.schedule.lock();
            if let Some(phase) = schedule.advance_if_due(now) {
                debug!(edge_id = %phase.edge_id, green_s = phase.green_s, "phase advanced");
            }
        }
    }

    async fn serve_vehicles(self: Arc<Self>, listener: TcpListener) -> Result<(), AgentError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let agent = self.clone();
            tokio::spawn(async move {
                if let Err(err) = agent.handle_vehicle(stream).await {
                    // Connection loss mid-exchange is a silent drop.
                    debug!(peer = %peer, error = %err, "vehicle connection dropped");
                }
            });
        }
    }

    async fn handle_vehicle(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let request = read_request(&mut stream).await?;

        let reply = match request {
            VehicleRequest::NextEdge {
                car_id,
                destination,
            } => match self.next_edge(&destination) {
                Ok(next_edge) => {
                    info!(car_id = %car_id, destination = %destination, next_edge = %next_edge, "routed vehicle");
                    VehicleReply::NextEdge { next_edge }
                }
                Err(_) => {
                    info!(car_id = %car_id, destination = %destination, "no route");
                    VehicleReply::Error { error: "NO_ROUTE" }
                }
            },
        };

        let payload = serde_json::to_vec(&reply)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        stream.write_all(&payload).await?;
        stream.shutdown().await
    }

    /// One weighted draw from the cached table.
    fn next_edge(&self, destination: &str) -> Result<String, Error> {
        let table = self.table.read();
        let choices = table
            .get(destination)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::NoRoute(destination.to_string()))?;
        let mut rng = self.rng.lock();
        sample_next_hop(choices, &mut *rng)
            .map(str::to_string)
            .ok_or_else(|| Error::NoRoute(destination.to_string()))
    }
}

/// Accumulates bytes until one complete JSON request parses. The client
/// may fragment its single message across writes.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<VehicleRequest> {
    let mut buf: Vec<u8> = Vec::with_capacity(256);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before a complete request",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request too large",
            ));
        }
        if let Ok(request) = serde_json::from_slice::<VehicleRequest>(&buf) {
            return Ok(request);
        }
    }
}
