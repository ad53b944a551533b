use crate::repository::ScheduleRepository;
use chrono::Utc;
use common::model::entity::schedule::ActivePool;
use common::model::entity::{LimitComments, ScheduleModel};
use errors::Result;
use log::{debug, info};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;

/// What the schedule worker should do with this batch.
#[derive(Debug, Clone, PartialEq)]
pub enum SleepOutcome {
    /// Mid-window; skip the batch and come back when it ends.
    Sleeping { remaining_ms: i64 },
    /// The posted-count just crossed a limit boundary; the follow-up job
    /// waits out the freshly drawn sleep window.
    EnteredSleep { sleep_ms: i64 },
    /// Proceed; `interval_ms` is the effective interval for the follow-up.
    Run { interval_ms: i64 },
}

/// `posted ≡ 0 (mod limit)` with a monotonic guard so the same boundary
/// never fires twice.
pub fn sleep_triggered(limit: &LimitComments, posted: i64, last_trigger_count: i64) -> bool {
    let threshold = limit.value() as i64;
    threshold > 0 && posted > 0 && posted % threshold == 0 && last_trigger_count != posted
}

/// Next interval value, re-drawn from the configured bounds when the
/// schedule asks for randomised spacing. Equal bounds always yield that
/// exact value.
pub fn draw_interval_value<R: Rng>(
    spec: &common::model::entity::IntervalSpec,
    rng: &mut R,
) -> i32 {
    match spec.random {
        Some((min, max)) if max > min => rng.gen_range(min..=max),
        Some((min, _)) => min,
        None => spec.value,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPlan {
    /// The new active membership; always the size of the principal pool.
    pub selected: Vec<i64>,
    pub rotated_out: Vec<i64>,
    pub rotated_in: Vec<i64>,
}

/// Swap `k = min(⌈0.3·|principal|⌉, |secondary|)` principals for reserves,
/// avoiding the previous cycle's rotated-out set when the pool allows.
pub fn forward_rotation<R: Rng>(
    principal: &[i64],
    secondary: &[i64],
    avoid: &[i64],
    rng: &mut R,
) -> RotationPlan {
    let k = ((principal.len() as f64 * 0.3).ceil() as usize).min(secondary.len());
    if k == 0 {
        return RotationPlan {
            selected: principal.to_vec(),
            rotated_out: Vec::new(),
            rotated_in: Vec::new(),
        };
    }

    let mut out_candidates: Vec<i64> = principal
        .iter()
        .filter(|id| !avoid.contains(id))
        .copied()
        .collect();
    // Not enough fresh principals; fall back to the full pool.
    if out_candidates.len() < k {
        out_candidates = principal.to_vec();
    }
    out_candidates.shuffle(rng);
    let rotated_out: Vec<i64> = out_candidates.into_iter().take(k).collect();

    let mut in_candidates = secondary.to_vec();
    in_candidates.shuffle(rng);
    let rotated_in: Vec<i64> = in_candidates.into_iter().take(k).collect();

    let mut selected: Vec<i64> = principal
        .iter()
        .filter(|id| !rotated_out.contains(id))
        .copied()
        .collect();
    selected.extend(&rotated_in);

    RotationPlan {
        selected,
        rotated_out,
        rotated_in,
    }
}

/// Sleep/rotation state machine, invoked at the start of every batch.
pub struct SleepController {
    repo: Arc<ScheduleRepository>,
}

impl SleepController {
    pub fn new(repo: Arc<ScheduleRepository>) -> Self {
        Self { repo }
    }

    /// Runs the state machine against the loaded schedule and persists any
    /// transitions. Returns the outcome plus the schedule as the rest of
    /// the batch should see it (limit redraws, interval redraws).
    pub async fn evaluate(&self, schedule: &ScheduleModel) -> Result<(SleepOutcome, ScheduleModel)> {
        let now = Utc::now();
        let mut schedule = schedule.clone();

        // Still inside an active window.
        if let Some(start) = schedule.sleep_delay_start_time {
            if schedule.in_sleep_window(now) {
                let end = start + chrono::Duration::minutes(schedule.sleep_delay_minutes as i64);
                let remaining_ms = (end - now).num_milliseconds().max(1_000);
                debug!(
                    "Schedule {} sleeping for another {}ms",
                    schedule.id, remaining_ms
                );
                return Ok((SleepOutcome::Sleeping { remaining_ms }, schedule));
            }
        }

        // A window that has elapsed gets cleaned up before the batch runs.
        if schedule.sleep_delay_minutes > 0 {
            self.wake(&mut schedule).await?;
        }

        if sleep_triggered(
            &schedule.limit(),
            schedule.posted_comments,
            schedule.last_sleep_trigger_count,
        ) {
            let sleep_ms = self.enter_sleep(&mut schedule).await?;
            return Ok((SleepOutcome::EnteredSleep { sleep_ms }, schedule));
        }

        // Normal path: compute (and possibly redraw) the interval.
        let spec = schedule.interval_spec();
        let value = draw_interval_value(&spec, &mut rand::thread_rng());
        if spec.random.is_some() && value != schedule.interval_value {
            self.repo.persist_interval_value(schedule.id, value).await?;
            schedule.interval_value = value;
        }
        let interval_ms = schedule.interval_unit.to_millis(value.max(1) as i64);

        Ok((SleepOutcome::Run { interval_ms }, schedule))
    }

    async fn enter_sleep(&self, schedule: &mut ScheduleModel) -> Result<i64> {
        let (min_delay, max_delay) = (schedule.min_delay.max(1), schedule.max_delay);
        let sleep_minutes = if max_delay > min_delay {
            rand::thread_rng().gen_range(min_delay..=max_delay)
        } else {
            min_delay
        };

        info!(
            "Schedule {} hit {} posted comments, sleeping {} minutes",
            schedule.id, schedule.posted_comments, sleep_minutes
        );

        self.repo
            .persist_sleep_entry(schedule.id, sleep_minutes, schedule.posted_comments)
            .await?;
        schedule.sleep_delay_minutes = sleep_minutes;
        schedule.sleep_delay_start_time = Some(Utc::now());
        schedule.last_sleep_trigger_count = schedule.posted_comments;

        if schedule.rotation_enabled {
            self.rotate(schedule).await?;
        }

        Ok(sleep_minutes as i64 * 60_000)
    }

    async fn wake(&self, schedule: &mut ScheduleModel) -> Result<()> {
        // Random limits are redrawn on wake so each cycle has a fresh
        // threshold.
        let new_limit = match schedule.limit() {
            LimitComments::Random { min, max, .. } => {
                Some(rand::thread_rng().gen_range(min..=max))
            }
            _ => None,
        };

        info!("Schedule {} waking from sleep window", schedule.id);
        self.repo.clear_sleep(schedule.id, new_limit).await?;
        schedule.sleep_delay_minutes = 0;
        schedule.sleep_delay_start_time = None;
        if let Some(value) = new_limit {
            schedule.limit_value = value;
        }

        // The reserve shift only lasts for the window; wake restores the
        // principal pool.
        if schedule.rotation_enabled && schedule.currently_active == ActivePool::Secondary {
            self.restore_principal(schedule).await?;
        }
        Ok(())
    }

    async fn rotate(&self, schedule: &mut ScheduleModel) -> Result<()> {
        match schedule.currently_active {
            ActivePool::Principal => {
                let principal = self.repo.principal_account_ids(schedule.id).await?;
                let secondary = self.repo.secondary_account_ids(schedule.id).await?;
                if principal.is_empty() || secondary.is_empty() {
                    debug!(
                        "Schedule {} rotation enabled but a pool is empty, skipping",
                        schedule.id
                    );
                    return Ok(());
                }
                let avoid = self.repo.rotated_principal_ids(schedule.id).await?;
                let plan =
                    forward_rotation(&principal, &secondary, &avoid, &mut rand::thread_rng());

                info!(
                    "Schedule {} rotating {} principals out, {} reserves in",
                    schedule.id,
                    plan.rotated_out.len(),
                    plan.rotated_in.len()
                );
                self.repo
                    .persist_rotation(
                        schedule.id,
                        &plan.selected,
                        &plan.rotated_out,
                        &plan.rotated_in,
                        ActivePool::Secondary,
                    )
                    .await?;
                schedule.currently_active = ActivePool::Secondary;
            }
            ActivePool::Secondary => {
                self.restore_principal(schedule).await?;
            }
        }
        Ok(())
    }

    async fn restore_principal(&self, schedule: &mut ScheduleModel) -> Result<()> {
        let principal = self.repo.principal_account_ids(schedule.id).await?;
        // Keep the rotated-out record so the next forward swap prefers
        // different principals.
        let previous_out = self.repo.rotated_principal_ids(schedule.id).await?;
        info!("Schedule {} restoring principal pool", schedule.id);
        self.repo
            .persist_rotation(schedule.id, &principal, &previous_out, &[], ActivePool::Principal)
            .await?;
        schedule.currently_active = ActivePool::Principal;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn trigger_fires_only_on_fresh_boundaries() {
        let limit = LimitComments::Fixed(5);
        assert!(sleep_triggered(&limit, 5, 0));
        assert!(sleep_triggered(&limit, 10, 5));
        // Same boundary twice: guarded.
        assert!(!sleep_triggered(&limit, 5, 5));
        // Not a boundary.
        assert!(!sleep_triggered(&limit, 7, 5));
        // Nothing posted yet.
        assert!(!sleep_triggered(&limit, 0, 0));
        // Limit disabled.
        assert!(!sleep_triggered(&LimitComments::Disabled, 10, 0));
    }

    #[test]
    fn random_interval_with_equal_bounds_is_exact() {
        use common::model::entity::{IntervalSpec, IntervalUnit};
        let spec = IntervalSpec {
            value: 2,
            unit: IntervalUnit::Minutes,
            random: Some((5, 5)),
        };
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..10 {
            assert_eq!(draw_interval_value(&spec, &mut rng), 5);
        }
    }

    #[test]
    fn fixed_interval_keeps_configured_value() {
        use common::model::entity::{IntervalSpec, IntervalUnit};
        let spec = IntervalSpec {
            value: 7,
            unit: IntervalUnit::Hours,
            random: None,
        };
        let mut rng = StdRng::seed_from_u64(9);
        assert_eq!(draw_interval_value(&spec, &mut rng), 7);
    }

    #[test]
    fn forward_rotation_swaps_expected_count() {
        let principal: Vec<i64> = (1..=6).collect();
        let secondary: Vec<i64> = vec![101, 102, 103];
        let mut rng = StdRng::seed_from_u64(7);

        let plan = forward_rotation(&principal, &secondary, &[], &mut rng);
        // k = min(ceil(0.3 * 6), 3) = 2
        assert_eq!(plan.rotated_out.len(), 2);
        assert_eq!(plan.rotated_in.len(), 2);
        assert_eq!(plan.selected.len(), 6);
        for id in &plan.rotated_out {
            assert!(!plan.selected.contains(id));
        }
        for id in &plan.rotated_in {
            assert!(plan.selected.contains(id));
            assert!(secondary.contains(id));
        }
    }

    #[test]
    fn forward_rotation_avoids_previous_cycle_when_possible() {
        let principal: Vec<i64> = (1..=6).collect();
        let secondary: Vec<i64> = vec![101, 102, 103];
        let avoid = vec![1, 2];

        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let plan = forward_rotation(&principal, &secondary, &avoid, &mut rng);
            for id in &plan.rotated_out {
                assert!(!avoid.contains(id), "seed {seed} rotated out an avoided id");
            }
        }
    }

    #[test]
    fn forward_rotation_falls_back_when_avoid_set_blocks_everything() {
        let principal: Vec<i64> = vec![1, 2];
        let secondary: Vec<i64> = vec![101];
        // Avoiding the whole pool cannot be honored; rotation still happens.
        let avoid = vec![1, 2];
        let mut rng = StdRng::seed_from_u64(3);

        let plan = forward_rotation(&principal, &secondary, &avoid, &mut rng);
        assert_eq!(plan.rotated_out.len(), 1);
        assert_eq!(plan.selected.len(), 2);
    }

    #[test]
    fn rotation_with_empty_secondary_is_a_noop() {
        let principal: Vec<i64> = (1..=4).collect();
        let mut rng = StdRng::seed_from_u64(1);
        let plan = forward_rotation(&principal, &[], &[], &mut rng);
        assert_eq!(plan.selected, principal);
        assert!(plan.rotated_out.is_empty());
    }
}
