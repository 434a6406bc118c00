// Traffic simulation against a shared replay cache
// Drives concurrent workers with fresh and replayed IVs and tallies outcomes

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::security::replay::{false_positive_rate, ReplayCache, ReplayCacheError, FINGERPRINT_LEN};

/// Requests between cooperative yields inside a worker
const YIELD_EVERY: u64 = 256;

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Invalid simulation config: {0}")]
    InvalidConfig(String),

    #[error("Replay cache error: {0}")]
    Cache(#[from] ReplayCacheError),

    #[error("Worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Parameters for one simulation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Simulation {
    pub capacity: usize,
    pub requests: u64,
    pub workers: usize,
    /// Probability that a request resends an IV the worker used before
    pub replay_ratio: f64,
    pub iv_len: usize,
}

/// Outcome counts of a simulation run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub requests: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub replays_sent: u64,
    pub replays_detected: u64,
    /// Replays whose IV had already been forgotten
    pub replays_missed: u64,
    /// Fresh IVs reported as replays (fingerprint collisions)
    pub false_positives: u64,
    pub expected_false_positive_rate: f64,
    pub elapsed_ms: u64,
}

impl SimulationReport {
    fn merge(&mut self, other: &SimulationReport) {
        self.requests += other.requests;
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.replays_sent += other.replays_sent;
        self.replays_detected += other.replays_detected;
        self.replays_missed += other.replays_missed;
        self.false_positives += other.false_positives;
    }

    /// Observed false positives per fresh request
    pub fn observed_false_positive_rate(&self) -> f64 {
        let fresh = self.requests - self.replays_sent;
        if fresh == 0 {
            return 0.0;
        }
        self.false_positives as f64 / fresh as f64
    }
}

impl Simulation {
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.workers == 0 {
            return Err(SimulationError::InvalidConfig(
                "at least one worker is required".to_string(),
            ));
        }
        if self.iv_len < FINGERPRINT_LEN {
            return Err(SimulationError::InvalidConfig(format!(
                "IVs must be at least {} bytes, got {}",
                FINGERPRINT_LEN, self.iv_len
            )));
        }
        if !(0.0..=1.0).contains(&self.replay_ratio) {
            return Err(SimulationError::InvalidConfig(format!(
                "replay ratio must be within [0, 1], got {}",
                self.replay_ratio
            )));
        }
        Ok(())
    }

    /// Run all workers against one shared cache
    pub async fn run(&self) -> Result<SimulationReport, SimulationError> {
        self.validate()?;
        let cache = Arc::new(ReplayCache::new(self.capacity)?);

        info!(
            capacity = self.capacity,
            requests = self.requests,
            workers = self.workers,
            "starting simulation"
        );

        let start = Instant::now();
        let per_worker = self.requests / self.workers as u64;
        let remainder = self.requests % self.workers as u64;
        // Keeps each worker's replays inside the window the cache promises
        let history = (self.capacity / self.workers).max(1);

        let mut handles = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            let requests = per_worker + u64::from((id as u64) < remainder);
            let worker = Worker {
                cache: Arc::clone(&cache),
                requests,
                replay_ratio: self.replay_ratio,
                iv_len: self.iv_len,
                history,
            };
            handles.push(tokio::spawn(worker.run()));
        }

        let mut report = SimulationReport {
            expected_false_positive_rate: false_positive_rate(self.capacity),
            ..Default::default()
        };
        for handle in handles {
            report.merge(&handle.await?);
        }
        report.elapsed_ms = start.elapsed().as_millis() as u64;

        info!(
            accepted = report.accepted,
            rejected = report.rejected,
            false_positives = report.false_positives,
            elapsed_ms = report.elapsed_ms,
            "simulation finished"
        );

        Ok(report)
    }
}

struct Worker {
    cache: Arc<ReplayCache>,
    requests: u64,
    replay_ratio: f64,
    iv_len: usize,
    history: usize,
}

impl Worker {
    async fn run(self) -> SimulationReport {
        let mut rng = StdRng::from_entropy();
        let mut sent: VecDeque<Vec<u8>> = VecDeque::with_capacity(self.history);
        let mut tally = SimulationReport::default();

        for n in 0..self.requests {
            if n > 0 && n % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }

            let replay = !sent.is_empty() && rng.gen_bool(self.replay_ratio);
            let iv = if replay {
                sent[rng.gen_range(0..sent.len())].clone()
            } else {
                let mut iv = vec![0u8; self.iv_len];
                rng.fill_bytes(&mut iv);
                iv
            };

            let is_new = self.cache.add(&iv);

            tally.requests += 1;
            if is_new {
                tally.accepted += 1;
            } else {
                tally.rejected += 1;
            }

            match (replay, is_new) {
                (true, true) => {
                    tally.replays_sent += 1;
                    tally.replays_missed += 1;
                }
                (true, false) => {
                    tally.replays_sent += 1;
                    tally.replays_detected += 1;
                }
                (false, false) => {
                    debug!(iv = %hex::encode(&iv), "fresh IV reported as replay");
                    tally.false_positives += 1;
                }
                (false, true) => {}
            }

            if !replay {
                if sent.len() == self.history {
                    sent.pop_front();
                }
                sent.push_back(iv);
            }
        }

        tally
    }
}
