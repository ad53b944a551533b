use crate::repository::ScheduleRepository;
use cacheable::CacheService;
use common::model::entity::{AccountModel, ScheduleModel};
use errors::{Result, ScheduleError};
use dashmap::DashMap;
use log::{debug, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const VIDEO_MARKER_TTL: Duration = Duration::from_secs(24 * 3600);
/// Compaction keeps this many counters per schedule and halves the counts,
/// so old habits fade instead of pinning weights forever.
const USAGE_CAP: usize = 50;

/// In-process recent-use counters, per schedule. Owned by the selector;
/// nothing else touches it (tests seed it through `record`).
pub struct UsageTracker {
    counts: DashMap<i64, HashMap<i64, u32>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self {
            counts: DashMap::new(),
        }
    }

    pub fn record(&self, schedule_id: i64, account_id: i64) {
        let mut entry = self.counts.entry(schedule_id).or_default();
        *entry.value_mut().entry(account_id).or_insert(0) += 1;
    }

    pub fn snapshot(&self, schedule_id: i64) -> HashMap<i64, u32> {
        self.counts
            .get(&schedule_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn forget(&self, schedule_id: i64) {
        self.counts.remove(&schedule_id);
    }

    /// Periodic trim: drop to the top entries and halve what remains.
    pub fn compact(&self) {
        for mut entry in self.counts.iter_mut() {
            let map = entry.value_mut();
            if map.len() > USAGE_CAP {
                let mut pairs: Vec<(i64, u32)> = map.drain().collect();
                pairs.sort_by(|a, b| b.1.cmp(&a.1));
                pairs.truncate(USAGE_CAP);
                map.extend(pairs);
            }
            for count in map.values_mut() {
                *count /= 2;
            }
        }
    }
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Least-recently-used bias: an account's weight shrinks with each recent
/// use but never reaches zero.
pub fn weighted_pick<R: Rng>(
    candidates: &[i64],
    usage: &HashMap<i64, u32>,
    rng: &mut R,
) -> Option<i64> {
    if candidates.is_empty() {
        return None;
    }
    let weights: Vec<u32> = candidates
        .iter()
        .map(|id| {
            let used = usage.get(id).copied().unwrap_or(0);
            (20u32.saturating_sub(used)).max(1)
        })
        .collect();
    let total: u32 = weights.iter().sum();
    let mut roll = rng.gen_range(0..total);
    for (id, weight) in candidates.iter().zip(weights) {
        if roll < weight {
            return Some(*id);
        }
        roll -= weight;
    }
    candidates.last().copied()
}

/// Exclusion rules in strict-to-relaxed order. Returns the surviving pool
/// and whether any rule had to be dropped to keep it non-empty.
pub fn apply_exclusions(
    candidates: &[i64],
    last_used: Option<i64>,
    video_last: Option<i64>,
) -> (Vec<i64>, bool) {
    if candidates.len() <= 1 {
        return (candidates.to_vec(), false);
    }

    let strict: Vec<i64> = candidates
        .iter()
        .filter(|id| Some(**id) != last_used && Some(**id) != video_last)
        .copied()
        .collect();
    if !strict.is_empty() {
        return (strict, false);
    }

    // Relax the per-video marker first, then the global last-used rule.
    let no_video_rule: Vec<i64> = candidates
        .iter()
        .filter(|id| Some(**id) != last_used)
        .copied()
        .collect();
    if !no_video_rule.is_empty() {
        return (no_video_rule, true);
    }

    (candidates.to_vec(), true)
}

pub struct AccountSelector {
    repo: Arc<ScheduleRepository>,
    cache: Arc<CacheService>,
    usage: UsageTracker,
}

impl AccountSelector {
    pub fn new(repo: Arc<ScheduleRepository>, cache: Arc<CacheService>) -> Self {
        Self {
            repo,
            cache,
            usage: UsageTracker::new(),
        }
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    fn video_marker_key(schedule_id: i64, video_id: &str) -> String {
        format!("schedule:{}:video:{}:lastAccount", schedule_id, video_id)
    }

    /// Picks the next account for `video_id` out of `candidates`.
    pub async fn select<'a>(
        &self,
        schedule: &ScheduleModel,
        candidates: &'a [AccountModel],
        video_id: &str,
    ) -> Result<&'a AccountModel> {
        if candidates.is_empty() {
            return Err(ScheduleError::NoAccounts.into());
        }

        let marker_key = Self::video_marker_key(schedule.id, video_id);
        let video_last: Option<i64> = self
            .cache
            .get_string(&marker_key)
            .await
            .ok()
            .flatten()
            .and_then(|s| s.parse().ok());

        let ids: Vec<i64> = candidates.iter().map(|a| a.id).collect();
        let (pool, relaxed) = apply_exclusions(&ids, schedule.last_used_account_id, video_last);
        if relaxed {
            warn!(
                "Schedule {} account pool too small for strict exclusions on video {}, relaxing",
                schedule.id, video_id
            );
        }

        let usage = self.usage.snapshot(schedule.id);
        let picked_id = weighted_pick(&pool, &usage, &mut rand::thread_rng())
            .ok_or(ScheduleError::NoAccounts)?;

        debug!(
            "Schedule {} selected account {} for video {}",
            schedule.id, picked_id, video_id
        );
        Ok(candidates
            .iter()
            .find(|a| a.id == picked_id)
            .expect("picked id comes from candidates"))
    }

    /// Post-dispatch bookkeeping: usage counter, per-video marker, and the
    /// persisted `last_used_account_id`.
    pub async fn mark_dispatched(
        &self,
        schedule_id: i64,
        account_id: i64,
        video_id: &str,
    ) -> Result<()> {
        self.usage.record(schedule_id, account_id);
        let marker_key = Self::video_marker_key(schedule_id, video_id);
        self.cache
            .set_string(&marker_key, &account_id.to_string(), Some(VIDEO_MARKER_TTL))
            .await
            .map_err(errors::Error::from)?;
        self.repo
            .set_last_used_account(schedule_id, account_id)
            .await?;
        Ok(())
    }

    pub fn compact_usage(&self) {
        self.usage.compact();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn single_candidate_wins_despite_exclusions() {
        let (pool, relaxed) = apply_exclusions(&[7], Some(7), Some(7));
        assert_eq!(pool, vec![7]);
        assert!(!relaxed);
    }

    #[test]
    fn last_used_is_excluded_when_pool_allows() {
        let (pool, relaxed) = apply_exclusions(&[1, 2, 3], Some(2), None);
        assert_eq!(pool, vec![1, 3]);
        assert!(!relaxed);
    }

    #[test]
    fn video_marker_excluded_then_relaxed_in_order() {
        // Strict filtering leaves someone: no relaxation.
        let (pool, relaxed) = apply_exclusions(&[1, 2, 3], Some(1), Some(2));
        assert_eq!(pool, vec![3]);
        assert!(!relaxed);

        // Both rules together block everything; the video rule is dropped
        // first and the last-used rule still holds.
        let (pool, relaxed) = apply_exclusions(&[1, 2], Some(1), Some(2));
        assert_eq!(pool, vec![2]);
        assert!(relaxed);
    }

    #[test]
    fn weighted_pick_prefers_less_used_accounts() {
        let mut usage = HashMap::new();
        usage.insert(1i64, 19u32); // weight 1
        usage.insert(2, 0); // weight 20

        let mut rng = StdRng::seed_from_u64(42);
        let mut wins = [0u32; 2];
        for _ in 0..1000 {
            match weighted_pick(&[1, 2], &usage, &mut rng) {
                Some(1) => wins[0] += 1,
                Some(2) => wins[1] += 1,
                _ => unreachable!(),
            }
        }
        // Expected ratio 1:20.
        assert!(wins[1] > wins[0] * 10, "wins: {wins:?}");
    }

    #[test]
    fn weighted_pick_handles_heavy_overuse() {
        let mut usage = HashMap::new();
        usage.insert(1i64, 500u32); // weight clamps to 1
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(weighted_pick(&[1], &usage, &mut rng), Some(1));
    }

    #[test]
    fn usage_compaction_caps_and_decays() {
        let tracker = UsageTracker::new();
        for account in 0..200i64 {
            for _ in 0..(account % 10 + 1) {
                tracker.record(1, account);
            }
        }
        tracker.compact();
        let snapshot = tracker.snapshot(1);
        assert!(snapshot.len() <= USAGE_CAP);
        assert!(snapshot.values().all(|&c| c <= 5));
    }
}
