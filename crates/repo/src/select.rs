//! Dial-candidate selection.
//!
//! One O(N) pass over the index. Candidates are ranked by, in order:
//! recency class of the last successful handshake, fewest attempts,
//! oldest last attempt. Ties are broken uniformly at random with a
//! reservoir so the pass never needs to sort or allocate.

use crate::node::Node;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use std::net::SocketAddr;

/// How recent a successful handshake must be to count as "good".
fn recent_success() -> Duration {
    Duration::minutes(30)
}

/// Ranking key; larger is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rank {
    /// 2 = recent success, 1 = any success, 0 = never succeeded.
    success_class: u8,
    attempts: u32,
    last_attempt: Option<DateTime<Utc>>,
}

impl Rank {
    fn of(node: &Node, now: DateTime<Utc>) -> Self {
        let success_class = match node.last_success {
            Some(t) if now - t <= recent_success() => 2,
            Some(_) => 1,
            None => 0,
        };
        Self {
            success_class,
            attempts: node.attempts,
            last_attempt: node.last_attempt,
        }
    }

    fn better_than(&self, other: &Rank) -> bool {
        if self.success_class != other.success_class {
            return self.success_class > other.success_class;
        }
        if self.attempts != other.attempts {
            return self.attempts < other.attempts;
        }
        // Never-attempted sorts before any timestamp.
        match (self.last_attempt, other.last_attempt) {
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (a, b) => a < b,
        }
    }
}

/// Pick one dialable address from the index, or `None` if it is empty.
pub fn pick<'a, I>(nodes: I, now: DateTime<Utc>, rng: &mut StdRng) -> Option<SocketAddr>
where
    I: Iterator<Item = &'a Node>,
{
    let mut best: Option<(Rank, SocketAddr)> = None;
    let mut ties = 0u32;

    for node in nodes {
        let rank = Rank::of(node, now);
        match &best {
            None => {
                best = Some((rank, node.addr));
                ties = 1;
            }
            Some((current, _)) if rank.better_than(current) => {
                best = Some((rank, node.addr));
                ties = 1;
            }
            Some((current, _)) if rank == *current => {
                // Reservoir: replace with probability 1/ties.
                ties += 1;
                if rng.gen_range(0..ties) == 0 {
                    best = Some((rank, node.addr));
                }
            }
            Some(_) => {}
        }
    }

    best.map(|(_, addr)| addr)
}
