use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Per-user sliding window over dispatch admissions.
///
/// Counts PENDING→RUNNING transitions, not enqueues: a tenant may queue as
/// much as it likes, but its share of actual compute starts is bounded to
/// `limit` per `window`. `now` is passed in by the caller so tests can drive
/// the limiter with the paused tokio clock.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    history: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            history: HashMap::new(),
        }
    }

    /// Returns true iff fewer than `limit` admissions fall within
    /// `[now - window, now]`, recording `now` on success. Old entries are
    /// pruned on every call, so each recorded admission is pushed and popped
    /// exactly once.
    pub fn try_admit(&mut self, user_id: &str, now: Instant) -> bool {
        let history = self.history.entry(user_id.to_string()).or_default();
        while let Some(front) = history.front() {
            if now.duration_since(*front) > self.window {
                history.pop_front();
            } else {
                break;
            }
        }

        if history.len() >= self.limit {
            return false;
        }
        history.push_back(now);
        true
    }

    /// How long until the user's oldest recorded admission ages out of the
    /// window. `None` when a slot is already free (or can never free up,
    /// i.e. `limit` is zero). The dispatcher uses this to arm a retry timer
    /// instead of spinning on a denied candidate.
    pub fn retry_after(&self, user_id: &str, now: Instant) -> Option<Duration> {
        let history = self.history.get(user_id)?;
        if history.len() < self.limit {
            return None;
        }
        let oldest = *history.front()?;
        Some(self.window.saturating_sub(now.duration_since(oldest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_the_limit_then_denies() {
        let mut rl = RateLimiter::new(2, Duration::from_secs(10));
        let now = Instant::now();

        assert!(rl.try_admit("u1", now));
        assert!(rl.try_admit("u1", now));
        assert!(!rl.try_admit("u1", now));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_and_frees_slots() {
        let mut rl = RateLimiter::new(2, Duration::from_secs(10));

        assert!(rl.try_admit("u1", Instant::now()));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(rl.try_admit("u1", Instant::now()));
        assert!(!rl.try_admit("u1", Instant::now()));

        // First admission ages out, second is still inside the window.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(rl.try_admit("u1", Instant::now()));
        assert!(!rl.try_admit("u1", Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn users_are_tracked_independently() {
        let mut rl = RateLimiter::new(1, Duration::from_secs(10));
        let now = Instant::now();

        assert!(rl.try_admit("u1", now));
        assert!(rl.try_admit("u2", now));
        assert!(!rl.try_admit("u1", now));
        assert!(!rl.try_admit("u2", now));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_limit_denies_everything() {
        let mut rl = RateLimiter::new(0, Duration::from_secs(1));
        assert!(!rl.try_admit("u1", Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_tracks_the_oldest_admission() {
        let mut rl = RateLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();

        assert_eq!(rl.retry_after("u1", start), None);
        assert!(rl.try_admit("u1", start));

        tokio::time::advance(Duration::from_secs(4)).await;
        let now = Instant::now();
        assert!(!rl.try_admit("u1", now));
        assert_eq!(rl.retry_after("u1", now), Some(Duration::from_secs(6)));

        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(rl.try_admit("u1", Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn denied_attempts_do_not_consume_slots() {
        let mut rl = RateLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();

        assert!(rl.try_admit("u1", start));
        for _ in 0..100 {
            assert!(!rl.try_admit("u1", Instant::now()));
        }

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(rl.try_admit("u1", Instant::now()));
    }
}
