use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::Settings;
use crate::subscriptions::{Subscription, Subscriptions};

/// A parameterised retry schedule.
///
/// The nth attempt runs with `attempt_timeouts[n]` when the list is
/// long enough, otherwise the previous timeout times
/// `attempt_multiplier`, clipped to `max_attempt_timeout`; the wait
/// between failed attempts follows the same rule over `retry_after` /
/// `retry_multiplier` / `max_retry_after`.
///
/// Patterns also have a compact textual form,
/// `"retries_csv/attempt_timeout/max_attempts"`, where the retries csv
/// may end in `*multiplier:cap`:
///
/// ```
/// use icelink::backoff::BackOffPattern;
/// use std::time::Duration;
///
/// let pattern: BackOffPattern = "1,2,4*2:60/5/7".parse().unwrap();
///
/// assert_eq!(pattern.max_attempts, 7);
/// assert_eq!(pattern.attempt_timeout(0), Duration::from_secs(5));
/// assert_eq!(pattern.retry_after(2), Duration::from_secs(4));
/// assert_eq!(pattern.retry_after(3), Duration::from_secs(8));
/// assert_eq!(pattern.retry_after(10), Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackOffPattern {
    #[serde(default)]
    pub max_attempts: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "millis_vec")]
    pub attempt_timeouts: Vec<Duration>,

    #[serde(default = "one", skip_serializing_if = "is_one")]
    pub attempt_multiplier: f64,

    #[serde(default, skip_serializing_if = "is_zero", with = "millis")]
    pub max_attempt_timeout: Duration,

    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "millis_vec")]
    pub retry_after: Vec<Duration>,

    #[serde(default = "one", skip_serializing_if = "is_one")]
    pub retry_multiplier: f64,

    #[serde(default, skip_serializing_if = "is_zero", with = "millis")]
    pub max_retry_after: Duration,
}

fn one() -> f64 {
    1.0
}

fn is_one(v: &f64) -> bool {
    *v == 1.0
}

fn is_zero(v: &Duration) -> bool {
    v.is_zero()
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod millis_vec {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(value.iter().map(|d| d.as_millis() as u64))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Duration>, D::Error> {
        Ok(Vec::<u64>::deserialize(deserializer)?
            .into_iter()
            .map(Duration::from_millis)
            .collect())
    }
}

impl Default for BackOffPattern {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            attempt_timeouts: Vec::new(),
            attempt_multiplier: 1.0,
            max_attempt_timeout: Duration::ZERO,
            retry_after: Vec::new(),
            retry_multiplier: 1.0,
            max_retry_after: Duration::ZERO,
        }
    }
}

impl BackOffPattern {
    /// timeout budget of the given zero-based attempt.
    pub fn attempt_timeout(&self, attempt: u32) -> Duration {
        Self::schedule(
            &self.attempt_timeouts,
            self.attempt_multiplier,
            self.max_attempt_timeout,
            attempt,
        )
    }

    /// wait after the given zero-based attempt failed.
    pub fn retry_after(&self, attempt: u32) -> Duration {
        Self::schedule(
            &self.retry_after,
            self.retry_multiplier,
            self.max_retry_after,
            attempt,
        )
    }

    fn schedule(list: &[Duration], multiplier: f64, cap: Duration, attempt: u32) -> Duration {
        let Some(last) = list.last() else {
            return Duration::ZERO;
        };

        if (attempt as usize) < list.len() {
            return list[attempt as usize];
        }

        let multiplier = if multiplier > 0.0 { multiplier } else { 1.0 };
        let mut value = *last;
        for _ in list.len()..=(attempt as usize) {
            value = Duration::from_secs_f64(value.as_secs_f64() * multiplier);
            if !cap.is_zero() && value > cap {
                return cap;
            }
        }

        value
    }

    /// JSON form of the pattern.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("pattern serializes")
    }

    pub fn from_json(source: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(source)?)
    }
}

impl FromStr for BackOffPattern {
    type Err = anyhow::Error;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        let mut parts = source.split('/');
        let (retries, timeout, attempts) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(a), Some(b), Some(c), None) => (a, b, c),
                _ => anyhow::bail!("expected retries_csv/attempt_timeout/max_attempts"),
            };

        let max_attempts: u32 = attempts.trim().parse()?;
        let timeout = Duration::from_secs_f64(timeout.trim().parse()?);

        // the retries csv may end in "*multiplier:cap".
        let (retries, retry_multiplier, max_retry_after) = match retries.split_once('*') {
            None => (retries, 1.0, Duration::ZERO),
            Some((list, growth)) => {
                let (multiplier, cap) = growth
                    .split_once(':')
                    .ok_or_else(|| anyhow::anyhow!("expected *multiplier:cap"))?;

                (
                    list,
                    multiplier.trim().parse()?,
                    Duration::from_secs_f64(cap.trim().parse()?),
                )
            }
        };

        let retry_after = retries
            .split(',')
            .filter(|v| !v.trim().is_empty())
            .map(|v| Ok(Duration::from_secs_f64(v.trim().parse()?)))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            max_attempts,
            attempt_timeouts: vec![timeout],
            attempt_multiplier: 1.0,
            max_attempt_timeout: timeout,
            retry_after,
            retry_multiplier,
            max_retry_after,
        })
    }
}

/// Timer lifecycle; see [`BackOffTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackOffState {
    /// the caller should start an attempt now.
    AttemptNow,
    /// an attempt is in flight, bounded by the attempt timeout.
    Attempting,
    /// the last attempt failed; waiting out the retry-after period.
    WaitingAfterAttemptFailure,
    /// the schedule is exhausted.  Terminal.
    AllAttemptsFailed,
    /// the caller reported success.  Terminal.
    Succeeded,
}

pub trait BackOffObserver: Send + Sync {
    fn on_state_changed(&self, state: BackOffState);
}

struct TimerState {
    state: BackOffState,
    /// failures recorded so far; doubles as the attempt cursor.
    failures: u32,
    /// invalidates one-shots that were scheduled for an older state.
    generation: u64,
    next_retry_at: Option<Instant>,
}

/// Caller-driven retry timer.
///
/// The timer never performs attempts itself; it tells the caller when
/// to try (`AttemptNow`), bounds each try with the pattern's attempt
/// timeout, and spaces failed tries by the pattern's retry-after
/// schedule.  The caller reports outcomes through the `notify_*`
/// methods; an attempt the caller never resolves is failed by the
/// internal one-shot.
pub struct BackOffTimer {
    pattern: BackOffPattern,
    state: Mutex<TimerState>,
    subs: Subscriptions<dyn BackOffObserver>,
}

impl BackOffTimer {
    /// create a timer, replaying `prior_failures` immediately (bounded
    /// by the settings cap).
    pub fn create(
        pattern: BackOffPattern,
        prior_failures: u32,
        settings: &Settings,
    ) -> Arc<BackOffTimer> {
        let failures = prior_failures
            .min(settings.backoff_max_constructor_failures)
            .min(pattern.max_attempts);

        let state = if failures >= pattern.max_attempts {
            BackOffState::AllAttemptsFailed
        } else {
            BackOffState::AttemptNow
        };

        Arc::new(BackOffTimer {
            pattern,
            state: Mutex::new(TimerState {
                state,
                failures,
                generation: 0,
                next_retry_at: None,
            }),
            subs: Subscriptions::default(),
        })
    }

    pub fn subscribe(&self, observer: Arc<dyn BackOffObserver>) -> Subscription {
        self.subs.subscribe(observer)
    }

    pub fn pattern(&self) -> &BackOffPattern {
        &self.pattern
    }

    pub fn state(&self) -> BackOffState {
        self.state.lock().state
    }

    pub fn total_failures(&self) -> u32 {
        self.state.lock().failures
    }

    /// when the next `AttemptNow` will fire, while waiting.
    pub fn next_retry_after_time(&self) -> Option<Instant> {
        self.state.lock().next_retry_at
    }

    /// the caller started an attempt.
    pub fn notify_attempting(self: &Arc<Self>) {
        let (fire, timeout, generation) = {
            let mut state = self.state.lock();
            if state.state != BackOffState::AttemptNow {
                return;
            }

            state.state = BackOffState::Attempting;
            state.generation += 1;
            state.next_retry_at = None;
            (
                BackOffState::Attempting,
                self.pattern.attempt_timeout(state.failures),
                state.generation,
            )
        };

        self.notify(fire);
        if !timeout.is_zero() {
            self.one_shot(timeout, generation, TimerEdge::AttemptTimedOut);
        }
    }

    /// the caller's attempt failed.
    pub fn notify_attempt_failed(self: &Arc<Self>) {
        self.attempt_failed();
    }

    /// skip the retry-after wait.
    pub fn notify_try_again_now(self: &Arc<Self>) {
        let fire = {
            let mut state = self.state.lock();
            if state.state != BackOffState::WaitingAfterAttemptFailure {
                return;
            }

            state.state = BackOffState::AttemptNow;
            state.generation += 1;
            state.next_retry_at = None;
            BackOffState::AttemptNow
        };

        self.notify(fire);
    }

    /// the caller's attempt succeeded.  Terminal.
    pub fn notify_succeeded(self: &Arc<Self>) {
        let fire = {
            let mut state = self.state.lock();
            if matches!(
                state.state,
                BackOffState::Succeeded | BackOffState::AllAttemptsFailed
            ) {
                return;
            }

            state.state = BackOffState::Succeeded;
            state.generation += 1;
            state.next_retry_at = None;
            BackOffState::Succeeded
        };

        self.notify(fire);
    }

    /// stop the timer without reaching a terminal state; outstanding
    /// one-shots are disarmed and observers are released.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.next_retry_at = None;
        drop(state);

        self.subs.clear();
    }

    fn attempt_failed(self: &Arc<Self>) {
        enum Outcome {
            Exhausted,
            Wait(Duration, u64),
        }

        let (fire, outcome) = {
            let mut state = self.state.lock();
            if !matches!(
                state.state,
                BackOffState::Attempting | BackOffState::AttemptNow
            ) {
                return;
            }

            state.failures += 1;
            state.generation += 1;

            if state.failures >= self.pattern.max_attempts {
                state.state = BackOffState::AllAttemptsFailed;
                state.next_retry_at = None;
                (BackOffState::AllAttemptsFailed, Outcome::Exhausted)
            } else {
                let wait = self.pattern.retry_after(state.failures - 1);
                state.state = BackOffState::WaitingAfterAttemptFailure;
                state.next_retry_at = Some(Instant::now() + wait);
                (
                    BackOffState::WaitingAfterAttemptFailure,
                    Outcome::Wait(wait, state.generation),
                )
            }
        };

        self.notify(fire);
        if let Outcome::Wait(wait, generation) = outcome {
            self.one_shot(wait, generation, TimerEdge::TryAgainNow);
        }
    }

    fn try_again_now_elapsed(self: &Arc<Self>) {
        let fire = {
            let mut state = self.state.lock();
            if state.state != BackOffState::WaitingAfterAttemptFailure {
                return;
            }

            state.state = BackOffState::AttemptNow;
            state.next_retry_at = None;
            BackOffState::AttemptNow
        };

        self.notify(fire);
    }

    fn one_shot(self: &Arc<Self>, after: Duration, generation: u64, edge: TimerEdge) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(timer) = weak.upgrade() else {
                return;
            };

            if timer.state.lock().generation != generation {
                return;
            }

            match edge {
                TimerEdge::AttemptTimedOut => timer.attempt_failed(),
                TimerEdge::TryAgainNow => timer.try_again_now_elapsed(),
            }
        });
    }

    fn notify(&self, state: BackOffState) {
        log::trace!("backoff state changed: state={:?}", state);
        self.subs.for_each(|o| o.on_state_changed(state));
    }
}

#[derive(Clone, Copy)]
enum TimerEdge {
    AttemptTimedOut,
    TryAgainNow,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn pattern() -> BackOffPattern {
        "1,2,4*2:60/5/3".parse().unwrap()
    }

    #[test]
    fn textual_and_json_forms_round_trip() {
        let pattern = pattern();
        let json = pattern.to_json();
        assert_eq!(BackOffPattern::from_json(&json).unwrap(), pattern);
    }

    #[test]
    fn schedule_grows_and_clips() {
        let pattern = pattern();
        assert_eq!(pattern.retry_after(0), Duration::from_secs(1));
        assert_eq!(pattern.retry_after(1), Duration::from_secs(2));
        assert_eq!(pattern.retry_after(4), Duration::from_secs(16));
        assert_eq!(pattern.retry_after(30), Duration::from_secs(60));
    }

    struct Tally {
        exhausted: AtomicU32,
        changes: AtomicU32,
    }

    impl BackOffObserver for Tally {
        fn on_state_changed(&self, state: BackOffState) {
            self.changes.fetch_add(1, Ordering::SeqCst);
            if state == BackOffState::AllAttemptsFailed {
                self.exhausted.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_fires_exactly_once() {
        let settings = Settings::default();
        let timer = BackOffTimer::create(pattern(), 0, &settings);
        let tally = Arc::new(Tally {
            exhausted: AtomicU32::new(0),
            changes: AtomicU32::new(0),
        });
        let _sub = timer.subscribe(tally.clone());

        for _ in 0..3 {
            assert_eq!(timer.state(), BackOffState::AttemptNow);
            timer.notify_attempting();
            timer.notify_attempt_failed();
            // sleep past any retry-after period.
            tokio::time::sleep(Duration::from_secs(120)).await;
        }

        assert_eq!(timer.state(), BackOffState::AllAttemptsFailed);
        assert_eq!(tally.exhausted.load(Ordering::SeqCst), 1);
        assert!(timer.total_failures() <= timer.pattern().max_attempts);

        // terminal states ignore further notifications.
        timer.notify_attempt_failed();
        assert_eq!(tally.exhausted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_synthesises_a_failure() {
        let settings = Settings::default();
        let timer = BackOffTimer::create(pattern(), 0, &settings);

        timer.notify_attempting();
        assert_eq!(timer.state(), BackOffState::Attempting);

        // the attempt budget is 5s; never resolve it.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(timer.state(), BackOffState::WaitingAfterAttemptFailure);
        assert_eq!(timer.total_failures(), 1);

        // the retry-after one-shot then re-arms the attempt.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(timer.state(), BackOffState::AttemptNow);
    }

    #[tokio::test(start_paused = true)]
    async fn constructor_failures_replay_bounded() {
        let settings = Settings::default();
        let timer = BackOffTimer::create(pattern(), 99, &settings);
        assert_eq!(timer.state(), BackOffState::AllAttemptsFailed);

        let timer = BackOffTimer::create(pattern(), 2, &settings);
        assert_eq!(timer.state(), BackOffState::AttemptNow);
        assert_eq!(timer.total_failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn success_disarms_the_attempt_one_shot() {
        let settings = Settings::default();
        let timer = BackOffTimer::create(pattern(), 0, &settings);

        timer.notify_attempting();
        timer.notify_succeeded();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(timer.state(), BackOffState::Succeeded);
        assert_eq!(timer.total_failures(), 0);
    }
}
