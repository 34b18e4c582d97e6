// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Victim selection for peer-to-peer work stealing: pure, synchronous, and
//! unit-testable independently of the gRPC machinery in `worker.rs` that
//! actually sends the `Steal` RPC.

use rand::Rng;

/// What a worker has most recently announced about itself to its peers.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerStat {
    pub worker_id: String,
    pub queue_depth: u32,
    pub load_factor: f32,
}

/// Tunables for the steal algorithm; see `4.H Distributed Layer`'s
/// description of power-of-two-choices victim selection.
#[derive(Clone, Copy, Debug)]
pub struct StealConfig {
    pub min_queue_for_steal: u32,
    pub weight_queue_depth: f64,
    pub weight_load_factor: f64,
}

impl Default for StealConfig {
    fn default() -> Self {
        StealConfig {
            min_queue_for_steal: 2,
            weight_queue_depth: 1.0,
            weight_load_factor: 1.0,
        }
    }
}

fn score(peer: &PeerStat, config: &StealConfig) -> f64 {
    peer.queue_depth as f64 * config.weight_queue_depth - peer.load_factor as f64 * config.weight_load_factor
}

/// Sample two peers at random among those with at least `min_queue_for_steal`
/// ready actions, and return the higher-scoring one. Returns `None` if no
/// peer clears the threshold.
pub fn choose_victim(peers: &[PeerStat], config: &StealConfig) -> Option<String> {
    let eligible: Vec<&PeerStat> = peers.iter().filter(|p| p.queue_depth >= config.min_queue_for_steal).collect();

    match eligible.len() {
        0 => None,
        1 => Some(eligible[0].worker_id.clone()),
        n => {
            let mut rng = rand::thread_rng();
            let a = eligible[rng.gen_range(0..n)];
            let b = eligible[rng.gen_range(0..n)];
            let winner = if score(a, config) >= score(b, config) { a } else { b };
            Some(winner.worker_id.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, queue_depth: u32, load_factor: f32) -> PeerStat {
        PeerStat {
            worker_id: id.to_string(),
            queue_depth,
            load_factor,
        }
    }

    #[test]
    fn no_peer_clears_the_threshold() {
        let peers = vec![peer("a", 0, 0.1), peer("b", 1, 0.2)];
        let config = StealConfig {
            min_queue_for_steal: 2,
            ..Default::default()
        };
        assert_eq!(choose_victim(&peers, &config), None);
    }

    #[test]
    fn a_single_eligible_peer_is_chosen_outright() {
        let peers = vec![peer("a", 0, 0.0), peer("b", 5, 0.0)];
        let config = StealConfig::default();
        assert_eq!(choose_victim(&peers, &config), Some("b".to_string()));
    }

    #[test]
    fn among_two_eligible_peers_the_higher_scoring_one_can_win() {
        // With only two eligible peers, power-of-two-choices degenerates to
        // "always compare the pair", so the higher scorer should win
        // deterministically regardless of which two the sampler draws.
        let peers = vec![peer("low", 2, 0.9), peer("high", 10, 0.1)];
        let config = StealConfig::default();
        for _ in 0..20 {
            assert_eq!(choose_victim(&peers, &config), Some("high".to_string()));
        }
    }

    #[test]
    fn scoring_combines_queue_depth_and_load_factor() {
        let config = StealConfig {
            min_queue_for_steal: 0,
            weight_queue_depth: 1.0,
            weight_load_factor: 10.0,
        };
        let busy_but_shallow = peer("busy", 3, 0.9);
        let idle_but_deep = peer("idle", 10, 0.0);
        assert!(score(&idle_but_deep, &config) > score(&busy_but_shallow, &config));
    }
}
