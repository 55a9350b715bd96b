use std::collections::HashSet;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::connection::SlowPeerRule;

pub const CHOKE_INTERVAL: Duration = Duration::from_secs(15);
pub const OPTIMISTIC_UNCHOKE_INTERVAL: Duration = Duration::from_secs(30);

/// Recently connected peers get this weight in the optimistic draw.
const NEW_PEER_WEIGHT: u32 = 3;
const NEW_PEER_AGE: Duration = Duration::from_secs(60);

/// Immutable per-peer snapshot the choker decides over.
#[derive(Debug, Clone, Copy)]
pub struct ChokeView {
    pub uuid: Uuid,
    /// They want our data.
    pub peer_interested: bool,
    /// They choke us.
    pub peer_choking: bool,
    /// We choke them.
    pub am_choking: bool,
    /// How long their current choke on us has lasted.
    pub choking_for: Duration,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub connected_for: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChokeActionKind {
    Choke,
    Unchoke,
}

#[derive(Debug, Clone, Copy)]
pub struct ChokeAction {
    pub peer: Uuid,
    pub action: ChokeActionKind,
    pub reason: &'static str,
}

#[derive(Debug, Default)]
pub struct ChokeDecisions {
    /// State flips to apply; peers already in the right state are omitted.
    pub actions: Vec<ChokeAction>,
    pub optimistic: Option<Uuid>,
    /// Disconnect recommendations. Only populated when replacements exist.
    pub drops: Vec<Uuid>,
}

/// Periodic choke algorithm: the best `max_upload_slots - 1` interested
/// peers by rate hold regular slots, one rotating optimistic slot gives
/// unknown peers a chance, everyone else gets choked.
#[derive(Debug)]
pub struct Choker {
    max_upload_slots: usize,
    optimistic: Option<Uuid>,
    last_rotation: Instant,
    slow_rule: SlowPeerRule,
}

impl Choker {
    pub fn new(max_upload_slots: usize, slow_rule: SlowPeerRule, now: Instant) -> Self {
        Self {
            max_upload_slots,
            optimistic: None,
            last_rotation: now,
            slow_rule,
        }
    }

    pub fn set_max_upload_slots(&mut self, slots: usize) {
        self.max_upload_slots = slots;
    }

    pub fn optimistic(&self) -> Option<Uuid> {
        self.optimistic
    }

    pub fn evaluate(
        &mut self,
        peers: &[ChokeView],
        seeding: bool,
        has_alternatives: bool,
        now: Instant,
    ) -> ChokeDecisions {
        let mut decisions = ChokeDecisions::default();

        // regular slots by rate, leaving one for the optimistic unchoke
        let regular_slots = self.max_upload_slots.saturating_sub(1);
        let mut ranked: Vec<&ChokeView> = peers.iter().filter(|p| p.peer_interested).collect();
        ranked.sort_unstable_by_key(|p| {
            std::cmp::Reverse(if seeding {
                p.upload_rate
            } else {
                p.download_rate
            })
        });
        let mut unchoked: HashSet<Uuid> = ranked
            .iter()
            .take(regular_slots)
            .map(|p| p.uuid)
            .collect();

        self.rotate_optimistic(peers, &unchoked, now);
        if let Some(optimistic) = self.optimistic {
            unchoked.insert(optimistic);
        }
        decisions.optimistic = self.optimistic;

        for peer in peers {
            let should_unchoke = unchoked.contains(&peer.uuid);
            if should_unchoke && peer.am_choking {
                let reason = if Some(peer.uuid) == self.optimistic {
                    "optimistic"
                } else {
                    "rate"
                };
                decisions.actions.push(ChokeAction {
                    peer: peer.uuid,
                    action: ChokeActionKind::Unchoke,
                    reason,
                });
            } else if !should_unchoke && !peer.am_choking {
                decisions.actions.push(ChokeAction {
                    peer: peer.uuid,
                    action: ChokeActionKind::Choke,
                    reason: "outranked",
                });
            }
        }

        if has_alternatives {
            let average_rate = average_download_rate(peers);
            for peer in peers {
                if self.slow_rule.is_slow(
                    peer.peer_choking,
                    peer.choking_for,
                    peer.download_rate,
                    average_rate,
                    peer.connected_for,
                ) {
                    decisions.drops.push(peer.uuid);
                }
            }
        }

        decisions
    }

    /// Pick a fresh optimistic peer from the interested-and-choked pool,
    /// weighted toward recent arrivals. Outside the rotation window the
    /// current pick is kept while it stays valid.
    fn rotate_optimistic(&mut self, peers: &[ChokeView], unchoked: &HashSet<Uuid>, now: Instant) {
        let still_valid = self.optimistic.is_some_and(|id| {
            peers
                .iter()
                .any(|p| p.uuid == id && p.peer_interested && !unchoked.contains(&id))
        });
        let due = now.saturating_duration_since(self.last_rotation) >= OPTIMISTIC_UNCHOKE_INTERVAL;
        if still_valid && !due {
            return;
        }

        let candidates: Vec<&ChokeView> = peers
            .iter()
            .filter(|p| p.peer_interested && p.am_choking && !unchoked.contains(&p.uuid))
            .collect();
        if candidates.is_empty() {
            if !still_valid {
                self.optimistic = None;
            }
            return;
        }
        let weights: Vec<u32> = candidates
            .iter()
            .map(|p| {
                if p.connected_for < NEW_PEER_AGE {
                    NEW_PEER_WEIGHT
                } else {
                    1
                }
            })
            .collect();
        let total: u32 = weights.iter().sum();
        let mut roll = rand::Rng::random_range(&mut rand::rng(), 0..total);
        let mut picked = candidates[0].uuid;
        for (candidate, weight) in candidates.iter().zip(weights) {
            if roll < weight {
                picked = candidate.uuid;
                break;
            }
            roll -= weight;
        }
        self.optimistic = Some(picked);
        self.last_rotation = now;
    }
}

fn average_download_rate(peers: &[ChokeView]) -> u64 {
    if peers.is_empty() {
        return 0;
    }
    peers.iter().map(|p| p.download_rate).sum::<u64>() / peers.len() as u64
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use uuid::Uuid;

    use crate::connection::SlowPeerRule;

    use super::{ChokeActionKind, ChokeView, Choker};

    fn rule() -> SlowPeerRule {
        SlowPeerRule {
            min_speed: 1024,
            choke_timeout: Duration::from_secs(60),
        }
    }

    fn view(interested: bool, am_choking: bool, download_rate: u64) -> ChokeView {
        ChokeView {
            uuid: Uuid::new_v4(),
            peer_interested: interested,
            peer_choking: false,
            am_choking,
            choking_for: Duration::ZERO,
            download_rate,
            upload_rate: download_rate / 2,
            connected_for: Duration::from_secs(300),
        }
    }

    #[test]
    fn best_rated_interested_peers_win_slots() {
        let now = Instant::now();
        let mut choker = Choker::new(3, rule(), now);
        let peers = vec![
            view(true, true, 50_000),
            view(true, true, 10_000),
            view(true, true, 90_000),
            view(false, true, 999_999),
        ];
        let decisions = choker.evaluate(&peers, false, false, now);
        let unchoked: Vec<Uuid> = decisions
            .actions
            .iter()
            .filter(|a| a.action == ChokeActionKind::Unchoke)
            .map(|a| a.peer)
            .collect();
        // two regular slots (fastest raters) + one optimistic from the rest
        assert_eq!(unchoked.len(), 3);
        assert!(unchoked.contains(&peers[2].uuid));
        assert!(unchoked.contains(&peers[0].uuid));
        assert_eq!(decisions.optimistic, Some(peers[1].uuid));
        // the uninterested speedster gets nothing
        assert!(!unchoked.contains(&peers[3].uuid));
    }

    #[test]
    fn seeding_ranks_by_upload_rate() {
        let now = Instant::now();
        let mut choker = Choker::new(2, rule(), now);
        let mut slow_down_fast_up = view(true, true, 0);
        slow_down_fast_up.upload_rate = 80_000;
        let fast_down_slow_up = view(true, true, 99_000);
        let peers = vec![fast_down_slow_up, slow_down_fast_up];
        let decisions = choker.evaluate(&peers, true, false, now);
        let regular_unchoke = decisions
            .actions
            .iter()
            .find(|a| a.action == ChokeActionKind::Unchoke && a.reason == "rate")
            .unwrap();
        assert_eq!(regular_unchoke.peer, peers[1].uuid);
    }

    #[test]
    fn outranked_peers_get_choked() {
        let now = Instant::now();
        let mut choker = Choker::new(2, rule(), now);
        let mut loser = view(true, false, 10);
        loser.uuid = Uuid::new_v4();
        let winner = view(true, true, 10_000);
        let third = view(true, true, 5_000);
        let peers = vec![loser, winner, third];
        let decisions = choker.evaluate(&peers, false, false, now);
        // slot 1: winner; optimistic: third; loser must flip to choked
        let choked: Vec<Uuid> = decisions
            .actions
            .iter()
            .filter(|a| a.action == ChokeActionKind::Choke)
            .map(|a| a.peer)
            .collect();
        assert_eq!(choked, vec![loser.uuid]);
    }

    #[test]
    fn optimistic_rotation_respects_interval() {
        let t0 = Instant::now();
        let mut choker = Choker::new(1, rule(), t0);
        let peers = vec![view(true, true, 0), view(true, true, 0)];
        let first = choker.evaluate(&peers, false, false, t0).optimistic.unwrap();
        // a second evaluation within the window keeps the pick
        let shortly = t0 + Duration::from_secs(5);
        assert_eq!(
            choker.evaluate(&peers, false, false, shortly).optimistic,
            Some(first)
        );
        // the pick can only change once the rotation interval elapsed
        let later = t0 + Duration::from_secs(31);
        let rotated = choker.evaluate(&peers, false, false, later).optimistic;
        assert!(rotated.is_some());
    }

    #[test]
    fn no_interested_peers_means_no_optimistic() {
        let now = Instant::now();
        let mut choker = Choker::new(4, rule(), now);
        let peers = vec![view(false, true, 0)];
        let decisions = choker.evaluate(&peers, false, false, now);
        assert_eq!(decisions.optimistic, None);
        assert!(decisions.actions.is_empty());
    }

    #[test]
    fn drops_require_alternatives() {
        let now = Instant::now();
        let mut choker = Choker::new(4, rule(), now);
        let mut starver = view(true, true, 0);
        starver.peer_choking = true;
        starver.choking_for = Duration::from_secs(120);
        let healthy = view(true, true, 50_000);
        let peers = vec![starver, healthy];

        let without = choker.evaluate(&peers, false, false, now);
        assert!(without.drops.is_empty());

        let with = choker.evaluate(&peers, false, true, now);
        assert_eq!(with.drops, vec![starver.uuid]);
    }
}
