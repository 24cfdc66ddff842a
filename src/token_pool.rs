use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::AppConfig;
use crate::database::methods::DbMethods as _;
use crate::database::types::ApiToken;
use crate::database::{self, Database};

#[derive(Debug, Error)]
pub enum Error {
    /// Every active token is in cooldown, or none exist.
    #[error("no tokens available for dispensing")]
    NoTokensAvailable,

    #[error(transparent)]
    Database(#[from] database::Error),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(database::Error::from(err))
    }
}

/// Sliding-window error accounting for tokens, with cooldown tripping.
///
/// Pure in-memory state; time is passed in explicitly so the arithmetic is
/// testable without a clock.
pub struct ErrorTracker {
    window: chrono::Duration,
    threshold: usize,
    cooldown: chrono::Duration,
    errors: HashMap<i64, VecDeque<DateTime<Utc>>>,
    cooldown_until: HashMap<i64, DateTime<Utc>>,
}

impl ErrorTracker {
    pub fn new(window: Duration, threshold: u32, cooldown: Duration) -> Self {
        Self {
            window: chrono::Duration::from_std(window).expect("error window out of range"),
            threshold: threshold as usize,
            cooldown: chrono::Duration::from_std(cooldown).expect("cooldown out of range"),
            errors: HashMap::new(),
            cooldown_until: HashMap::new(),
        }
    }

    /// Records one error. Returns the cooldown end if this error tripped the
    /// threshold.
    pub fn record(&mut self, token_id: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let timestamps = self.errors.entry(token_id).or_default();
        timestamps.push_back(now);

        let horizon = now - self.window;
        while timestamps.front().is_some_and(|t| *t < horizon) {
            timestamps.pop_front();
        }

        if timestamps.len() >= self.threshold && !self.cooldown_until.contains_key(&token_id) {
            let until = now + self.cooldown;
            self.cooldown_until.insert(token_id, until);
            return Some(until);
        }

        None
    }

    /// Lazily expires a stale cooldown; expiry clears the error history.
    pub fn is_in_cooldown(&mut self, token_id: i64, now: DateTime<Utc>) -> bool {
        match self.cooldown_until.get(&token_id) {
            Some(until) if now >= *until => {
                self.cooldown_until.remove(&token_id);
                self.errors.remove(&token_id);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn error_count(&mut self, token_id: i64, now: DateTime<Utc>) -> usize {
        let Some(timestamps) = self.errors.get_mut(&token_id) else {
            return 0;
        };

        let horizon = now - self.window;
        while timestamps.front().is_some_and(|t| *t < horizon) {
            timestamps.pop_front();
        }

        timestamps.len()
    }
}

/// Dispenses upstream credentials under batch rotation and error cooldown.
///
/// A pure interface over the store: all durable counters live in the tokens
/// table and are mutated under row locks; only the error window and cooldown
/// deadlines are process-local.
pub struct TokenPool {
    database: Arc<Database>,
    tracker: Mutex<ErrorTracker>,
    batch_size: i32,
    error_threshold: u32,
}

impl TokenPool {
    pub fn new(database: Arc<Database>, config: &AppConfig) -> Self {
        Self {
            database,
            tracker: Mutex::new(ErrorTracker::new(
                config.error_window,
                config.error_threshold,
                config.cooldown,
            )),
            batch_size: config.token_batch_size as i32,
            error_threshold: config.error_threshold,
        }
    }

    /// Dispenses the current batch token, advancing the round-robin cursor
    /// when the token has served a full batch.
    ///
    /// Runs in a single transaction; the row lock on the current token
    /// serializes concurrent dispensers so the batch counter never
    /// double-increments. The lock is released at commit, before the caller
    /// performs any upstream call.
    #[instrument(skip(self), level = "debug")]
    pub async fn dispense_batch_token(&self) -> Result<ApiToken, Error> {
        let database = self.database.clone();

        let mut tx = database.pool.begin().await?;

        let settings = (&mut *tx).get_token_settings().await?;
        let active = (&mut *tx).get_active_tokens().await?;

        let available: Vec<&ApiToken> = {
            let mut tracker = self.tracker.lock().expect("tracker poisoned");
            let now = Utc::now();
            active
                .iter()
                .filter(|t| !tracker.is_in_cooldown(t.id, now))
                .collect()
        };

        if available.is_empty() {
            return Err(Error::NoTokensAvailable);
        }

        let mut index = settings.last_used_token_index.max(0) as usize % available.len();
        let mut current = (&mut *tx)
            .lock_token(available[index].id)
            .await?
            .ok_or(Error::NoTokensAvailable)?;

        if current.current_batch_count >= self.batch_size {
            // Batch complete: close it out and move to the next token.
            (&mut *tx).reset_token_batch(current.id).await?;

            index = (settings.last_used_token_index.max(0) as usize + 1) % available.len();
            current = (&mut *tx)
                .lock_token(available[index].id)
                .await?
                .ok_or(Error::NoTokensAvailable)?;

            (&mut *tx)
                .update_last_used_token_index(index as i32)
                .await?;

            info!(
                token_id = current.id,
                label = %current.label,
                "token batch complete, rotated to next token"
            );
        }

        let token = (&mut *tx).record_token_dispense(current.id).await?;

        tx.commit().await?;

        Ok(token)
    }

    /// Least-recently-used dispense for status checks, where batch
    /// accounting does not apply. Skips cooldown tokens and tokens within
    /// one error of the threshold to leave headroom against concurrent
    /// recorders.
    #[instrument(skip(self), level = "debug")]
    pub async fn next_rotation_token(&self) -> Result<Option<ApiToken>, Error> {
        let active = self.database.pool.get_active_tokens().await?;

        let candidate = {
            let mut tracker = self.tracker.lock().expect("tracker poisoned");
            let now = Utc::now();
            let near_threshold = (self.error_threshold.max(1) - 1) as usize;

            let mut usable: Vec<&ApiToken> = active
                .iter()
                .filter(|t| {
                    !tracker.is_in_cooldown(t.id, now)
                        && tracker.error_count(t.id, now) < near_threshold
                })
                .collect();

            // Never-used tokens sort first.
            usable.sort_by_key(|t| t.last_used_at);
            usable.first().map(|t| (*t).clone())
        };

        let Some(token) = candidate else {
            return Ok(None);
        };

        self.database.pool.touch_token_last_used(token.id).await?;

        Ok(Some(token))
    }

    /// Appends an error for the token and trips its cooldown when the
    /// window count reaches the threshold.
    pub fn record_error(&self, token_id: i64) {
        let mut tracker = self.tracker.lock().expect("tracker poisoned");

        if let Some(until) = tracker.record(token_id, Utc::now()) {
            warn!(
                token_id,
                cooldown_until = %until,
                "token crossed error threshold, placed in cooldown"
            );
        }
    }

    #[must_use]
    pub fn is_in_cooldown(&self, token_id: i64) -> bool {
        self.tracker
            .lock()
            .expect("tracker poisoned")
            .is_in_cooldown(token_id, Utc::now())
    }

    #[must_use]
    pub fn error_count(&self, token_id: i64) -> usize {
        self.tracker
            .lock()
            .expect("tracker poisoned")
            .error_count(token_id, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const WINDOW: Duration = Duration::from_secs(20 * 60);
    const COOLDOWN: Duration = Duration::from_secs(2 * 60 * 60);

    fn tracker() -> ErrorTracker {
        ErrorTracker::new(WINDOW, 10, COOLDOWN)
    }

    fn at(minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 12 + minute / 60, minute % 60, second)
            .unwrap()
    }

    #[test]
    fn tenth_error_in_window_trips_cooldown() {
        let mut tracker = tracker();

        for i in 0..9 {
            assert_eq!(tracker.record(1, at(i, 0)), None);
        }
        assert!(!tracker.is_in_cooldown(1, at(9, 0)));

        let until = tracker.record(1, at(9, 30)).expect("should trip");
        assert_eq!(until, at(9, 30) + chrono::Duration::hours(2));
        assert!(tracker.is_in_cooldown(1, at(10, 0)));
    }

    #[test]
    fn errors_outside_window_slide_out() {
        let mut tracker = tracker();

        for i in 0..9 {
            tracker.record(1, at(i, 0));
        }

        // 21 minutes later the early errors are gone; this one is not the
        // tenth-in-window.
        assert_eq!(tracker.record(1, at(21, 0)), None);
        assert!(!tracker.is_in_cooldown(1, at(21, 0)));
        assert!(tracker.error_count(1, at(21, 0)) < 10);
    }

    #[test]
    fn cooldown_expiry_clears_error_history() {
        let mut tracker = tracker();

        for i in 0..10 {
            tracker.record(1, at(i, 0));
        }
        assert!(tracker.is_in_cooldown(1, at(10, 0)));

        let after_cooldown = at(9, 0) + chrono::Duration::hours(2) + chrono::Duration::seconds(1);
        assert!(!tracker.is_in_cooldown(1, after_cooldown));
        assert_eq!(tracker.error_count(1, after_cooldown), 0);
    }

    #[test]
    fn cooldown_is_per_token() {
        let mut tracker = tracker();

        for i in 0..10 {
            tracker.record(1, at(i, 0));
        }

        assert!(tracker.is_in_cooldown(1, at(10, 0)));
        assert!(!tracker.is_in_cooldown(2, at(10, 0)));
        assert_eq!(tracker.error_count(2, at(10, 0)), 0);
    }

    #[test]
    fn repeat_errors_during_cooldown_do_not_extend_it() {
        let mut tracker = tracker();

        for i in 0..10 {
            tracker.record(1, at(i, 0));
        }

        assert_eq!(tracker.record(1, at(11, 0)), None);
        assert!(tracker.is_in_cooldown(1, at(11, 0)));
    }
}
