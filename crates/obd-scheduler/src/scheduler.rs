//! Poll Scheduler Implementation
//!
//! Every polled parameter has its own target interval. The scheduler picks
//! the parameter that is most overdue relative to that interval, so a 1 s
//! parameter that is 500 ms late outranks a 200 ms parameter that is 50 ms
//! late. Failures push a parameter's next attempt out exponentially.

use obd_protocol::{lookup, ParameterDefinition, ParameterId, SupportedPids};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for the poll scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Each consecutive failure multiplies the next delay by this factor
    pub failure_backoff_factor: f64,
    /// Cap on the number of factors applied
    pub max_backoff_exponent: u32,
    /// A sample is stale once older than `interval * stale_factor`
    pub stale_factor: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            failure_backoff_factor: 2.0,
            max_backoff_exponent: 5,
            stale_factor: 2.0,
        }
    }
}

/// A polled parameter with its timing state
#[derive(Debug, Clone)]
pub struct ScheduledPid {
    pub definition: &'static ParameterDefinition,
    /// Target interval between polls
    pub interval: Duration,
    /// When the next poll is due
    pub next_due: Instant,
    /// Consecutive failure count
    pub failures: u32,
}

impl ScheduledPid {
    pub fn new(definition: &'static ParameterDefinition, interval: Duration, now: Instant) -> Self {
        Self {
            definition,
            interval,
            next_due: now,
            failures: 0,
        }
    }

    pub fn id(&self) -> ParameterId {
        self.definition.id
    }

    /// How late the parameter is, in units of its own interval.
    /// Negative while not yet due; grows without bound while waiting.
    pub fn overdue_ratio(&self, now: Instant) -> f64 {
        let interval = self.interval.as_secs_f64().max(f64::EPSILON);
        if now >= self.next_due {
            (now - self.next_due).as_secs_f64() / interval
        } else {
            -(self.next_due - now).as_secs_f64() / interval
        }
    }

    /// Delay before the next poll given the current failure count
    pub fn backoff_delay(&self, config: &SchedulerConfig) -> Duration {
        let exponent = self.failures.min(config.max_backoff_exponent) as i32;
        self.interval
            .mul_f64(config.failure_backoff_factor.max(1.0).powi(exponent))
    }
}

/// Decides which parameter gets the next turn on the channel
#[derive(Debug)]
pub struct PollScheduler {
    entries: Vec<ScheduledPid>,
    config: SchedulerConfig,
}

impl PollScheduler {
    /// Create a scheduler for `targets`, dropping every parameter the
    /// vehicle did not advertise or the registry does not know.
    pub fn new(
        config: SchedulerConfig,
        targets: &[(ParameterId, Duration)],
        supported: &SupportedPids,
        now: Instant,
    ) -> Self {
        let mut entries: Vec<ScheduledPid> = Vec::with_capacity(targets.len());
        for &(id, interval) in targets {
            let definition = match lookup(id) {
                Ok(definition) => definition,
                Err(e) => {
                    warn!(pid = %id, "Skipping parameter: {}", e);
                    continue;
                }
            };
            if !supported.contains(id) {
                warn!(pid = %id, "{} not supported by vehicle, skipping", definition.short_name);
                continue;
            }
            if entries.iter().any(|e| e.id() == id) {
                continue;
            }
            entries.push(ScheduledPid::new(definition, interval, now));
        }

        info!("Poll scheduler created with {} parameters", entries.len());
        Self { entries, config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The most overdue parameter among those due at `now`
    pub fn select(&self, now: Instant) -> Option<ParameterId> {
        self.entries
            .iter()
            .filter(|e| e.next_due <= now)
            .max_by(|a, b| {
                a.overdue_ratio(now)
                    .total_cmp(&b.overdue_ratio(now))
                    // On a tie, the earlier due date, then the lower PID wins
                    .then_with(|| b.next_due.cmp(&a.next_due))
                    .then_with(|| b.id().cmp(&a.id()))
            })
            .map(|e| e.id())
    }

    /// Earliest due time of any parameter
    pub fn next_due(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.next_due).min()
    }

    /// Reset the failure count and schedule one interval ahead
    pub fn on_success(&mut self, id: ParameterId, now: Instant) {
        if let Some(entry) = self.entry_mut(id) {
            if entry.failures > 0 {
                debug!(pid = %id, "Recovered after {} failures", entry.failures);
            }
            entry.failures = 0;
            entry.next_due = now + entry.interval;
        }
    }

    /// Count a failure and defer the next attempt by the backoff delay.
    /// Returns the delay applied.
    pub fn on_failure(&mut self, id: ParameterId, now: Instant) -> Duration {
        let config = self.config.clone();
        match self.entry_mut(id) {
            Some(entry) => {
                entry.failures = entry.failures.saturating_add(1);
                let delay = entry.backoff_delay(&config);
                entry.next_due = now + delay;
                debug!(
                    pid = %id,
                    failures = entry.failures,
                    "Deferring next poll by {}ms",
                    delay.as_millis()
                );
                delay
            }
            None => Duration::ZERO,
        }
    }

    /// How old a sample of `id` may get before it counts as stale
    pub fn stale_after(&self, id: ParameterId) -> Option<Duration> {
        self.entries
            .iter()
            .find(|e| e.id() == id)
            .map(|e| e.interval.mul_f64(self.config.stale_factor.max(1.0)))
    }

    pub fn get(&self, id: ParameterId) -> Option<&ScheduledPid> {
        self.entries.iter().find(|e| e.id() == id)
    }

    fn entry_mut(&mut self, id: ParameterId) -> Option<&mut ScheduledPid> {
        self.entries.iter_mut().find(|e| e.id() == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = ParameterId> + '_ {
        self.entries.iter().map(|e| e.id())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    const RPM: ParameterId = ParameterId::current(0x0C);
    const SPEED: ParameterId = ParameterId::current(0x0D);
    const COOLANT: ParameterId = ParameterId::current(0x05);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn scheduler(targets: &[(ParameterId, Duration)], now: Instant) -> PollScheduler {
        let supported = SupportedPids::from_pids(targets.iter().map(|(id, _)| id.pid));
        PollScheduler::new(SchedulerConfig::default(), targets, &supported, now)
    }

    #[test]
    fn test_unsupported_and_unknown_are_skipped() {
        let now = Instant::now();
        let supported = SupportedPids::from_pids([0x0C]);
        let scheduler = PollScheduler::new(
            SchedulerConfig::default(),
            &[(RPM, ms(200)), (SPEED, ms(200)), (ParameterId::current(0x12), ms(200))],
            &supported,
            now,
        );
        assert_eq!(scheduler.ids().collect::<Vec<_>>(), vec![RPM]);
    }

    #[test]
    fn test_most_overdue_relative_to_interval_wins() {
        let start = Instant::now();
        let mut scheduler = scheduler(&[(RPM, ms(200)), (COOLANT, ms(1000))], start);
        scheduler.on_success(RPM, start);
        scheduler.on_success(COOLANT, start);

        // RPM is 100ms late (0.5 intervals), coolant 0ms late
        let now = start + ms(1000);
        assert_eq!(scheduler.select(now), Some(RPM));

        // RPM 50ms late (0.25), coolant 500ms late (0.5)
        scheduler.on_success(RPM, start + ms(1300));
        let now = start + ms(1550);
        assert_eq!(scheduler.select(now), Some(COOLANT));
    }

    #[test]
    fn test_nothing_due() {
        let start = Instant::now();
        let mut scheduler = scheduler(&[(RPM, ms(200))], start);
        scheduler.on_success(RPM, start);
        assert_eq!(scheduler.select(start + ms(100)), None);
        assert_eq!(scheduler.next_due(), Some(start + ms(200)));
    }

    #[test]
    fn test_three_failures_back_off_two_four_eight_times() {
        let start = Instant::now();
        let mut scheduler = scheduler(&[(RPM, ms(100)), (SPEED, ms(100))], start);

        let mut now = start;
        for expected in [200, 400, 800] {
            let delay = scheduler.on_failure(RPM, now);
            assert_eq!(delay, ms(expected));
            assert_eq!(scheduler.get(RPM).unwrap().next_due, now + ms(expected));
            now += ms(expected);
        }

        // SPEED keeps its own cadence throughout
        scheduler.on_success(SPEED, start);
        assert_eq!(scheduler.get(SPEED).unwrap().next_due, start + ms(100));

        scheduler.on_success(RPM, now);
        assert_eq!(scheduler.get(RPM).unwrap().failures, 0);
        assert_eq!(scheduler.get(RPM).unwrap().next_due, now + ms(100));
    }

    #[test]
    fn test_backoff_is_capped() {
        let start = Instant::now();
        let mut scheduler = scheduler(&[(RPM, ms(100))], start);
        let mut delay = Duration::ZERO;
        for _ in 0..10 {
            delay = scheduler.on_failure(RPM, start);
        }
        assert_eq!(delay, ms(3200));
    }

    #[test]
    fn test_stale_after() {
        let scheduler = scheduler(&[(RPM, ms(200))], Instant::now());
        assert_eq!(scheduler.stale_after(RPM), Some(ms(400)));
        assert_eq!(scheduler.stale_after(SPEED), None);
    }

    #[test]
    fn test_failing_pid_does_not_starve_others() {
        let start = Instant::now();
        let targets = [(RPM, ms(100)), (SPEED, ms(200)), (COOLANT, ms(1000))];
        let mut scheduler = scheduler(&targets, start);

        // One request per 50ms turnaround; RPM always fails
        let mut now = start;
        let mut last_served: HashMap<ParameterId, Instant> = HashMap::new();
        for _ in 0..400 {
            match scheduler.select(now) {
                Some(id) if id == RPM => {
                    scheduler.on_failure(id, now);
                }
                Some(id) => {
                    if let Some(previous) = last_served.insert(id, now) {
                        let interval = scheduler.get(id).unwrap().interval;
                        // every healthy parameter is served within its interval
                        // plus a few turnarounds
                        assert!(now - previous <= interval + ms(150), "{id} starved");
                    }
                    scheduler.on_success(id, now);
                }
                None => {}
            }
            now += ms(50);
        }
        assert!(last_served.contains_key(&SPEED));
        assert!(last_served.contains_key(&COOLANT));
    }

    proptest! {
        #[test]
        fn prop_overdue_priority_strictly_increases(
            interval_ms in 1u64..5_000,
            failures in 0u32..8,
            late_ms in 0u64..60_000,
            extra_ms in 1u64..60_000,
        ) {
            let start = Instant::now();
            let definition = lookup(RPM).unwrap();
            let mut entry = ScheduledPid::new(definition, ms(interval_ms), start);
            entry.failures = failures;
            entry.next_due = start + entry.backoff_delay(&SchedulerConfig::default());

            let earlier = entry.next_due + ms(late_ms);
            let later = earlier + ms(extra_ms);
            prop_assert!(entry.overdue_ratio(later) > entry.overdue_ratio(earlier));
        }
    }
}
