//! Per-(trigger, component) cooldown and hourly rate limiting.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use super::types::{TriggerConfig, TriggerKind};
use crate::errors::GateDenial;

const WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
struct GateEntry {
    window_start: Instant,
    count: u32,
    cooldown_until: Option<Instant>,
}

/// Admission control for recovery attempts.
///
/// The whole check-and-record step runs under one lock, so two attempts for
/// the same key can never both slip past the limit.
pub struct TriggerGate {
    triggers: HashMap<TriggerKind, TriggerConfig>,
    entries: Mutex<HashMap<(TriggerKind, String), GateEntry>>,
}

impl TriggerGate {
    pub fn new(triggers: HashMap<TriggerKind, TriggerConfig>) -> Self {
        Self {
            triggers,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn config(&self, trigger: TriggerKind) -> TriggerConfig {
        self.triggers
            .get(&trigger)
            .cloned()
            .unwrap_or_else(|| TriggerConfig::defaults_for(trigger))
    }

    pub fn should_admit(&self, trigger: TriggerKind, component: &str) -> Result<(), GateDenial> {
        self.should_admit_at(trigger, component, Instant::now())
    }

    /// Admit or deny at `now`. Admission is recorded; denial leaves state untouched.
    pub fn should_admit_at(
        &self,
        trigger: TriggerKind,
        component: &str,
        now: Instant,
    ) -> Result<(), GateDenial> {
        let config = self.config(trigger);
        if !config.enabled {
            return Err(GateDenial::TriggerDisabled);
        }

        let mut entries = self.entries.lock();
        let entry = entries
            .entry((trigger, component.to_string()))
            .or_insert(GateEntry {
                window_start: now,
                count: 0,
                cooldown_until: None,
            });

        if let Some(until) = entry.cooldown_until {
            if now < until {
                return Err(GateDenial::CoolingDown {
                    remaining_ms: (until - now).as_millis() as u64,
                });
            }
        }

        if now.saturating_duration_since(entry.window_start) >= WINDOW {
            entry.window_start = now;
            entry.count = 0;
        }
        if entry.count >= config.max_triggers_per_hour {
            return Err(GateDenial::HourlyLimit {
                limit: config.max_triggers_per_hour,
            });
        }

        entry.count += 1;
        if config.cooldown_ms > 0 {
            entry.cooldown_until = Some(now + config.cooldown());
        }
        debug!(
            trigger = %trigger,
            component = %component,
            count = entry.count,
            "Trigger admitted"
        );
        Ok(())
    }

    /// Attempts admitted for this key in the current window.
    pub fn admitted_in_window(&self, trigger: TriggerKind, component: &str) -> u32 {
        self.entries
            .lock()
            .get(&(trigger, component.to_string()))
            .map(|e| e.count)
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
