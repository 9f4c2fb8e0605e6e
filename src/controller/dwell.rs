//! Minimum-dwell gating between dispatch actions.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::config::Settings;
use crate::domain::Action;

/// Tracks the active action and how long it has been held.
///
/// Owned by the actuation state; executors borrow it mutably for one apply
/// at a time and never clone it.
#[derive(Debug, Clone, Default)]
pub struct DwellController {
    minimum_dwell_seconds: u32,
    /// Overrides keyed by the *previous* action.
    per_action_dwell_seconds: HashMap<Action, u32>,
    last_action: Option<Action>,
    last_action_at: Option<DateTime<Utc>>,
}

impl DwellController {
    pub fn new(minimum_dwell_seconds: u32, per_action_dwell_seconds: HashMap<Action, u32>) -> Self {
        Self {
            minimum_dwell_seconds,
            per_action_dwell_seconds,
            last_action: None,
            last_action_at: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.minimum_action_dwell_seconds,
            settings.per_action_dwell_seconds(),
        )
    }

    /// Picks up new dwell durations while keeping the current action and
    /// its start time.
    pub fn reconfigure(&mut self, settings: &Settings) {
        self.minimum_dwell_seconds = settings.minimum_action_dwell_seconds;
        self.per_action_dwell_seconds = settings.per_action_dwell_seconds();
    }

    pub fn last_action(&self) -> Option<Action> {
        self.last_action
    }

    pub fn last_action_at(&self) -> Option<DateTime<Utc>> {
        self.last_action_at
    }

    fn required_dwell_seconds(&self, previous: Action) -> u32 {
        self.per_action_dwell_seconds
            .get(&previous)
            .copied()
            .unwrap_or(self.minimum_dwell_seconds)
    }

    /// Whether switching to `new_action` at `now` is allowed. Pure.
    pub fn should_change(&self, new_action: Action, now: DateTime<Utc>) -> bool {
        let Some(previous) = self.last_action else {
            return true;
        };
        if previous == new_action {
            return true;
        }
        let required = self.required_dwell_seconds(previous);
        if required == 0 {
            return true;
        }
        let Some(since) = self.last_action_at else {
            return true;
        };
        (now - since).num_milliseconds() >= i64::from(required) * 1000
    }

    /// Records an adopted action. Re-noting the current action keeps the
    /// original start time.
    pub fn note_action(&mut self, action: Action, now: DateTime<Utc>) {
        if self.last_action != Some(action) {
            self.last_action = Some(action);
            self.last_action_at = Some(now);
        }
    }
}
