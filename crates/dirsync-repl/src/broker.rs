//! Choice of the replication server a directory server should connect to.
//!
//! Candidates are filtered by a chain of criteria, most important first:
//! same group id, same generation id, then holding every change this
//! replica ever generated. Each filter only narrows the list when it leaves
//! at least one candidate. The survivors are balanced by weight: every
//! server has a load goal (its share of the summed weights) and the one
//! farthest below its goal wins.
//!
//! When the local server is already connected, it only moves if that
//! actually improves the balance. Moving one server between two equally
//! weighted peers just mirrors the imbalance, so that move is suppressed
//! (otherwise the topology oscillates forever around a balance point that
//! is not an integer).

use rand::Rng;

use dirsync_proto::ServerState;

use crate::config::DomainConfig;

/// A replication server the local replica could connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsCandidate {
    /// Server id.
    pub server_id: u16,
    /// Connection URL.
    pub server_url: String,
    /// Topology group.
    pub group_id: u8,
    /// Data generation held for the suffix.
    pub generation_id: i64,
    /// Configured load-balancing weight.
    pub weight: u8,
    /// Directory servers currently connected to it.
    pub connected_ds_count: u32,
    /// Progress vector, when learned during a handshake.
    pub state: Option<ServerState>,
}

/// What the local replica brings to the evaluation.
#[derive(Debug, Clone)]
pub struct LocalInfo<'a> {
    /// The local replica id.
    pub replica_id: u16,
    /// The local group id.
    pub group_id: u8,
    /// The local generation id.
    pub generation_id: i64,
    /// The local progress vector.
    pub state: &'a ServerState,
}

impl<'a> LocalInfo<'a> {
    /// Build from the domain configuration.
    pub fn from_config(config: &DomainConfig, state: &'a ServerState) -> Self {
        Self {
            replica_id: config.replica_id,
            group_id: config.group_id,
            generation_id: config.generation_id,
            state,
        }
    }
}

/// Decision for a connected replica re-evaluating its choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerDecision {
    /// Keep the current connection.
    Stay,
    /// Disconnect and connect to this server instead.
    ConnectTo(u16),
}

/// Pick the replication server to connect to when not yet connected.
/// Returns `None` when the candidate list is empty.
pub fn pick_first_connection<R: Rng>(
    candidates: &[RsCandidate],
    local: &LocalInfo<'_>,
    rng: &mut R,
) -> Option<u16> {
    let best = filter_candidates(candidates, local);
    if best.is_empty() {
        return None;
    }
    if best.len() == 1 {
        return Some(best[0].server_id);
    }
    // With no observed load yet, the choice is proportional to weight so a
    // fleet of starting replicas spreads itself without coordination.
    if best.iter().all(|c| c.connected_ds_count == 0) {
        return Some(weighted_pick(&best, rng));
    }
    let distances = load_distances(&best);
    pick_by_distance(&best, &distances)
}

/// Re-evaluate the choice while connected to `current_rs`. `ds_on_current`
/// are the replica ids connected to the current server, ascending.
pub fn reevaluate(
    candidates: &[RsCandidate],
    local: &LocalInfo<'_>,
    current_rs: u16,
    ds_on_current: &[u16],
) -> BrokerDecision {
    let best = filter_candidates(candidates, local);
    let Some(current) = best.iter().find(|c| c.server_id == current_rs) else {
        // The current server no longer qualifies (changed group,
        // generation, or vanished): move to the best remaining one.
        let distances = load_distances(&best);
        return match pick_by_distance(&best, &distances) {
            Some(id) => BrokerDecision::ConnectTo(id),
            None => BrokerDecision::Stay,
        };
    };
    if best.len() == 1 {
        return BrokerDecision::Stay;
    }

    let distances = load_distances(&best);
    let current_idx = best.iter().position(|c| c.server_id == current_rs).unwrap_or(0);
    let current_distance = distances[current_idx];
    if current_distance >= 0.0 {
        // The current server is at or below its load goal.
        return BrokerDecision::Stay;
    }

    let total_ds: u32 = best.iter().map(|c| c.connected_ds_count).sum();
    let others_sum: f64 = distances
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != current_idx)
        .map(|(_, d)| d)
        .sum();
    if others_sum <= 0.0 {
        return BrokerDecision::Stay;
    }

    let overloading = (others_sum * f64::from(total_ds)).round() as i64;
    if overloading < 1 {
        return BrokerDecision::Stay;
    }
    if overloading == 1 {
        // Would moving one server away just mirror the imbalance?
        let sum_weights: f64 = best.iter().map(|c| f64::from(c.weight)).sum();
        let goal = f64::from(current.weight) / sum_weights;
        let new_current_load = if total_ds == 0 {
            0.0
        } else {
            f64::from(current.connected_ds_count.saturating_sub(1)) / f64::from(total_ds)
        };
        let new_current_distance = goal - new_current_load;
        let new_others_sum = others_sum - 1.0 / f64::from(total_ds);
        if must_avoid_yoyo(new_current_distance, new_others_sum) {
            return BrokerDecision::Stay;
        }
    }

    // The lowest replica ids connected to the overloaded server move away.
    let movers = &ds_on_current[..(overloading as usize).min(ds_on_current.len())];
    if !movers.contains(&local.replica_id) {
        return BrokerDecision::Stay;
    }
    let others: Vec<RsCandidate> =
        best.iter().filter(|c| c.server_id != current_rs).cloned().collect();
    let other_distances = load_distances(&others);
    match pick_by_distance(&others, &other_distances) {
        Some(id) => BrokerDecision::ConnectTo(id),
        None => BrokerDecision::Stay,
    }
}

// Narrowing filter chain; a criterion that would empty the list is skipped.
fn filter_candidates(candidates: &[RsCandidate], local: &LocalInfo<'_>) -> Vec<RsCandidate> {
    let mut best: Vec<RsCandidate> = candidates.to_vec();
    narrow(&mut best, |c| c.group_id == local.group_id);
    let with_generation = narrow(&mut best, |c| c.generation_id == local.generation_id);
    if with_generation {
        let own = local.state.max_csn(local.replica_id);
        narrow(&mut best, |c| match (&c.state, own) {
            (_, None) => true,
            (Some(state), Some(csn)) => state.covers(&csn),
            (None, Some(_)) => false,
        });
    }
    best
}

fn narrow<F: Fn(&RsCandidate) -> bool>(best: &mut Vec<RsCandidate>, keep: F) -> bool {
    let filtered: Vec<RsCandidate> = best.iter().filter(|c| keep(c)).cloned().collect();
    if filtered.is_empty() {
        false
    } else {
        *best = filtered;
        true
    }
}

// Distance of each candidate to its load goal; positive means underloaded.
fn load_distances(candidates: &[RsCandidate]) -> Vec<f64> {
    let sum_weights: f64 = candidates.iter().map(|c| f64::from(c.weight)).sum();
    let sum_ds: f64 = candidates.iter().map(|c| f64::from(c.connected_ds_count)).sum();
    candidates
        .iter()
        .map(|c| {
            let goal =
                if sum_weights == 0.0 { 0.0 } else { f64::from(c.weight) / sum_weights };
            let load =
                if sum_ds == 0.0 { 0.0 } else { f64::from(c.connected_ds_count) / sum_ds };
            goal - load
        })
        .collect()
}

fn pick_by_distance(candidates: &[RsCandidate], distances: &[f64]) -> Option<u16> {
    if candidates.is_empty() {
        return None;
    }
    if distances.iter().all(|d| d.abs() < f64::EPSILON) {
        // Perfectly balanced: the highest weight wins, lowest id on ties.
        return candidates
            .iter()
            .max_by_key(|c| (c.weight, std::cmp::Reverse(c.server_id)))
            .map(|c| c.server_id);
    }
    let mut best_idx = 0;
    for (i, d) in distances.iter().enumerate() {
        if *d > distances[best_idx]
            || (*d == distances[best_idx] && candidates[i].server_id < candidates[best_idx].server_id)
        {
            best_idx = i;
        }
    }
    Some(candidates[best_idx].server_id)
}

fn weighted_pick<R: Rng>(candidates: &[RsCandidate], rng: &mut R) -> u16 {
    let total: u32 = candidates.iter().map(|c| u32::from(c.weight.max(1))).sum();
    let mut roll = rng.gen_range(0..total);
    for c in candidates {
        let w = u32::from(c.weight.max(1));
        if roll < w {
            return c.server_id;
        }
        roll -= w;
    }
    candidates[candidates.len() - 1].server_id
}

// Moving one server is pointless when the result is the same imbalance
// with the sign flipped; reaching perfect balance (both zero) is fine.
fn must_avoid_yoyo(new_current_distance: f64, new_others_sum: f64) -> bool {
    let both_zero =
        new_current_distance.abs() < f64::EPSILON && new_others_sum.abs() < f64::EPSILON;
    !both_zero && (new_current_distance + new_others_sum).abs() < 1e-9
}
