// Load-balancing strategies
//
// Decision: Candidates arrive sorted by account id; every strategy picks an index into that slice
// Decision: Strategies are pure over a snapshot of usage and latency; the router owns the state

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the router picks among eligible accounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Cyclic cursor per operation type
    RoundRobin,
    /// Uniform pick
    Random,
    /// Smallest rolling usage count, lowest id on ties
    LeastUsed,
    /// Smallest response-time EWMA; cold accounts count as the observed mean
    FastestResponse,
}

impl LoadBalanceStrategy {
    pub const ALL: [LoadBalanceStrategy; 4] = [
        LoadBalanceStrategy::RoundRobin,
        LoadBalanceStrategy::Random,
        LoadBalanceStrategy::LeastUsed,
        LoadBalanceStrategy::FastestResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceStrategy::RoundRobin => "round_robin",
            LoadBalanceStrategy::Random => "random",
            LoadBalanceStrategy::LeastUsed => "least_used",
            LoadBalanceStrategy::FastestResponse => "fastest_response",
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalanceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        LoadBalanceStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| format!("unknown load-balancing strategy: {}", s))
    }
}

/// What a strategy may look at for one candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct CandidateLoad {
    pub usage: usize,
    pub average_response_ms: Option<f64>,
}

/// Pick an index into `loads`
///
/// `cursor` is the round-robin position for the operation type; it is
/// advanced only by strategies that consume it.
pub(crate) fn pick(strategy: LoadBalanceStrategy, loads: &[CandidateLoad], cursor: &mut u64) -> usize {
    debug_assert!(!loads.is_empty());
    // Round robin still advances with a single candidate
    if loads.len() == 1 && strategy != LoadBalanceStrategy::RoundRobin {
        return 0;
    }
    match strategy {
        LoadBalanceStrategy::RoundRobin => round_robin(loads.len(), cursor),
        LoadBalanceStrategy::Random => rand::thread_rng().gen_range(0..loads.len()),
        LoadBalanceStrategy::LeastUsed => loads
            .iter()
            .enumerate()
            .min_by_key(|(_, load)| load.usage)
            .map(|(i, _)| i)
            .unwrap_or(0),
        LoadBalanceStrategy::FastestResponse => fastest(loads, cursor),
    }
}

fn round_robin(len: usize, cursor: &mut u64) -> usize {
    let index = (*cursor % len as u64) as usize;
    *cursor = cursor.wrapping_add(1);
    index
}

fn fastest(loads: &[CandidateLoad], cursor: &mut u64) -> usize {
    let observed: Vec<f64> = loads.iter().filter_map(|l| l.average_response_ms).collect();
    let cold = if observed.is_empty() {
        0.0
    } else {
        observed.iter().sum::<f64>() / observed.len() as f64
    };

    let scores: Vec<f64> = loads
        .iter()
        .map(|l| l.average_response_ms.unwrap_or(cold))
        .collect();
    let best = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let tied: Vec<usize> = scores
        .iter()
        .enumerate()
        .filter(|(_, score)| **score == best)
        .map(|(i, _)| i)
        .collect();

    match tied.len() {
        0 => 0,
        1 => tied[0],
        n => tied[round_robin(n, cursor)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(usage: usize, average_response_ms: Option<f64>) -> CandidateLoad {
        CandidateLoad {
            usage,
            average_response_ms,
        }
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!(
            "round_robin".parse::<LoadBalanceStrategy>().unwrap(),
            LoadBalanceStrategy::RoundRobin
        );
        assert_eq!(
            "Fastest-Response".parse::<LoadBalanceStrategy>().unwrap(),
            LoadBalanceStrategy::FastestResponse
        );
        assert!("sticky".parse::<LoadBalanceStrategy>().is_err());

        for strategy in LoadBalanceStrategy::ALL {
            let json = serde_json::to_string(&strategy).unwrap();
            assert_eq!(json, format!("\"{}\"", strategy));
        }
    }

    #[test]
    fn test_round_robin_wraps() {
        let loads = vec![load(0, None); 3];
        let mut cursor = 0;
        let picks: Vec<usize> = (0..6)
            .map(|_| pick(LoadBalanceStrategy::RoundRobin, &loads, &mut cursor))
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_round_robin_advances_with_single_candidate() {
        let mut cursor = 0;
        assert_eq!(pick(LoadBalanceStrategy::RoundRobin, &[load(0, None)], &mut cursor), 0);
        assert_eq!(pick(LoadBalanceStrategy::RoundRobin, &[load(0, None)], &mut cursor), 0);
        assert_eq!(cursor, 2);

        let pair = [load(0, None), load(0, None)];
        assert_eq!(pick(LoadBalanceStrategy::RoundRobin, &pair, &mut cursor), 0);
        assert_eq!(pick(LoadBalanceStrategy::RoundRobin, &pair, &mut cursor), 1);
    }

    #[test]
    fn test_least_used_prefers_first_on_ties() {
        let loads = vec![load(3, None), load(1, None), load(1, None)];
        let mut cursor = 0;
        assert_eq!(pick(LoadBalanceStrategy::LeastUsed, &loads, &mut cursor), 1);
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_fastest_treats_cold_accounts_as_mean() {
        // mean of observed = 200; cold account scores 200 and loses to 100
        let loads = vec![load(0, Some(300.0)), load(0, None), load(0, Some(100.0))];
        let mut cursor = 0;
        assert_eq!(pick(LoadBalanceStrategy::FastestResponse, &loads, &mut cursor), 2);
    }

    #[test]
    fn test_fastest_rotates_among_ties() {
        let loads = vec![load(0, None), load(0, None)];
        let mut cursor = 0;
        let first = pick(LoadBalanceStrategy::FastestResponse, &loads, &mut cursor);
        let second = pick(LoadBalanceStrategy::FastestResponse, &loads, &mut cursor);
        assert_ne!(first, second);
    }

    #[test]
    fn test_random_stays_in_bounds() {
        let loads = vec![load(0, None); 4];
        let mut cursor = 0;
        for _ in 0..100 {
            assert!(pick(LoadBalanceStrategy::Random, &loads, &mut cursor) < 4);
        }
    }
}
