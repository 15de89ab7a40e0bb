//! Cost Tracker
//!
//! Per-provider spend for the current UTC day and month, checked against the
//! caps configured on each provider. Periods roll over lazily: the first
//! access after a day or month boundary zeroes the stale counter.
//!
//! All ledgers live behind one mutex, so concurrent `record_spend` calls for
//! the same provider never lose an update.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use conductor_core::config::CostConfig;

use crate::events::{EngineEvent, EventBus};
use crate::registry::ProviderRegistry;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Day,
    Month,
}

impl std::fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Day => "day",
            Self::Month => "month",
        })
    }
}

/// Where a provider stands against its caps. The worst period wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetState {
    Ok,
    /// At or above the alert threshold but below the cap.
    Warning,
    /// Cap reached; the provider is excluded from routing until rollover.
    Throttled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CrossingFlags {
    warned: bool,
    exhausted: bool,
}

/// Spend for one provider in the active day and month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpendLedger {
    pub day: NaiveDate,
    pub day_spend: f64,
    /// First day of the active month.
    pub month: NaiveDate,
    pub month_spend: f64,
    #[serde(skip)]
    day_flags: CrossingFlags,
    #[serde(skip)]
    month_flags: CrossingFlags,
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

impl SpendLedger {
    fn new(today: NaiveDate) -> Self {
        Self {
            day: today,
            day_spend: 0.0,
            month: month_start(today),
            month_spend: 0.0,
            day_flags: CrossingFlags::default(),
            month_flags: CrossingFlags::default(),
        }
    }

    /// Zero whichever counters belong to a period that has ended.
    fn roll(&mut self, provider: &str, today: NaiveDate) {
        if today > self.day {
            if self.day_spend > 0.0 {
                debug!(provider, day = %self.day, spent = self.day_spend, "Daily ledger rolled over");
            }
            self.day = today;
            self.day_spend = 0.0;
            self.day_flags = CrossingFlags::default();
        }
        let month = month_start(today);
        if month > self.month {
            if self.month_spend > 0.0 {
                debug!(provider, month = %self.month, spent = self.month_spend, "Monthly ledger rolled over");
            }
            self.month = month;
            self.month_spend = 0.0;
            self.month_flags = CrossingFlags::default();
        }
    }

    fn spend(&self, period: BudgetPeriod) -> f64 {
        match period {
            BudgetPeriod::Day => self.day_spend,
            BudgetPeriod::Month => self.month_spend,
        }
    }

    fn flags_mut(&mut self, period: BudgetPeriod) -> &mut CrossingFlags {
        match period {
            BudgetPeriod::Day => &mut self.day_flags,
            BudgetPeriod::Month => &mut self.month_flags,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Caps {
    daily: Option<f64>,
    monthly: Option<f64>,
}

impl Caps {
    fn get(&self, period: BudgetPeriod) -> Option<f64> {
        match period {
            BudgetPeriod::Day => self.daily,
            BudgetPeriod::Month => self.monthly,
        }
    }
}

const PERIODS: [BudgetPeriod; 2] = [BudgetPeriod::Day, BudgetPeriod::Month];

fn state_for(spent: f64, cap: Option<f64>, threshold: f64) -> BudgetState {
    match cap {
        Some(cap) if spent >= cap => BudgetState::Throttled,
        Some(cap) if spent >= cap * threshold => BudgetState::Warning,
        _ => BudgetState::Ok,
    }
}

// ---------------------------------------------------------------------------
// CostTracker
// ---------------------------------------------------------------------------

pub struct CostTracker {
    registry: Arc<ProviderRegistry>,
    alert_threshold: RwLock<f64>,
    ledgers: Mutex<HashMap<String, SpendLedger>>,
    events: EventBus,
}

impl CostTracker {
    pub fn new(registry: Arc<ProviderRegistry>, config: &CostConfig, events: EventBus) -> Self {
        Self {
            registry,
            alert_threshold: RwLock::new(config.alert_threshold),
            ledgers: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn alert_threshold(&self) -> f64 {
        *self.alert_threshold.read()
    }

    pub fn set_alert_threshold(&self, threshold: f64) {
        *self.alert_threshold.write() = threshold;
    }

    fn caps(&self, provider_id: &str) -> Option<Caps> {
        self.registry.get(provider_id).ok().map(|p| Caps {
            daily: p.daily_budget,
            monthly: p.monthly_budget,
        })
    }

    /// Add `amount` to the provider's day and month ledgers.
    ///
    /// Never fails: an unknown provider or a nonsensical amount is logged and
    /// dropped so a completed task is never aborted by bookkeeping.
    pub fn record_spend(&self, provider_id: &str, amount: f64) {
        self.record_spend_at(provider_id, amount, Utc::now());
    }

    pub fn record_spend_at(&self, provider_id: &str, amount: f64, now: DateTime<Utc>) {
        let Some(caps) = self.caps(provider_id) else {
            warn!(provider = provider_id, amount, "Spend recorded for unknown provider; ignoring");
            return;
        };
        if !amount.is_finite() || amount < 0.0 {
            warn!(provider = provider_id, amount, "Ignoring invalid spend amount");
            return;
        }

        let threshold = self.alert_threshold();
        let today = now.date_naive();
        let mut pending = Vec::new();
        {
            let mut ledgers = self.ledgers.lock();
            let ledger = ledgers
                .entry(provider_id.to_string())
                .or_insert_with(|| SpendLedger::new(today));
            ledger.roll(provider_id, today);
            ledger.day_spend += amount;
            ledger.month_spend += amount;

            for period in PERIODS {
                let Some(cap) = caps.get(period) else {
                    continue;
                };
                let spent = ledger.spend(period);
                let flags = ledger.flags_mut(period);
                if !flags.warned && spent >= cap * threshold {
                    flags.warned = true;
                    pending.push(EngineEvent::BudgetWarning {
                        provider: provider_id.to_string(),
                        period,
                        spent,
                        cap,
                    });
                }
                if !flags.exhausted && spent >= cap {
                    flags.exhausted = true;
                    pending.push(EngineEvent::BudgetExhausted {
                        provider: provider_id.to_string(),
                        period,
                        spent,
                        cap,
                    });
                }
            }
        }

        debug!(provider = provider_id, amount, "Spend recorded");
        for event in pending {
            match &event {
                EngineEvent::BudgetExhausted { period, spent, cap, .. } => {
                    warn!(provider = provider_id, %period, spent, cap, "Budget exhausted; provider throttled")
                }
                EngineEvent::BudgetWarning { period, spent, cap, .. } => {
                    info!(provider = provider_id, %period, spent, cap, "Budget alert threshold reached")
                }
                _ => {}
            }
            self.events.emit(event);
        }
    }

    /// Convert a token count to spend using the provider's per-token cost.
    pub fn record_usage(&self, provider_id: &str, tokens: u64) {
        match self.registry.get(provider_id) {
            Ok(provider) => self.record_spend(provider_id, tokens as f64 * provider.cost_per_token),
            Err(_) => warn!(provider = provider_id, tokens, "Usage recorded for unknown provider; ignoring"),
        }
    }

    pub fn budget_state(&self, provider_id: &str) -> BudgetState {
        self.budget_state_at(provider_id, Utc::now())
    }

    pub fn budget_state_at(&self, provider_id: &str, now: DateTime<Utc>) -> BudgetState {
        let Some(caps) = self.caps(provider_id) else {
            return BudgetState::Ok;
        };
        let threshold = self.alert_threshold();
        let today = now.date_naive();
        let mut ledgers = self.ledgers.lock();
        let Some(ledger) = ledgers.get_mut(provider_id) else {
            // Nothing spent yet; a zero cap is already exhausted.
            return PERIODS
                .iter()
                .map(|p| state_for(0.0, caps.get(*p), threshold))
                .max()
                .unwrap_or(BudgetState::Ok);
        };
        ledger.roll(provider_id, today);
        PERIODS
            .iter()
            .map(|p| state_for(ledger.spend(*p), caps.get(*p), threshold))
            .max()
            .unwrap_or(BudgetState::Ok)
    }

    /// True once the active day's or month's spend has reached its cap.
    pub fn is_throttled(&self, provider_id: &str) -> bool {
        self.budget_state(provider_id) == BudgetState::Throttled
    }

    pub fn is_throttled_at(&self, provider_id: &str, now: DateTime<Utc>) -> bool {
        self.budget_state_at(provider_id, now) == BudgetState::Throttled
    }

    /// Current ledger for a provider, rolled forward to today.
    pub fn ledger(&self, provider_id: &str) -> Option<SpendLedger> {
        let today = Utc::now().date_naive();
        let mut ledgers = self.ledgers.lock();
        let ledger = ledgers.get_mut(provider_id)?;
        ledger.roll(provider_id, today);
        Some(ledger.clone())
    }

    /// Export every ledger as CSV, one row per provider, sorted by id.
    pub fn export_csv(&self) -> String {
        let mut rows: Vec<(String, SpendLedger)> = self
            .ledgers
            .lock()
            .iter()
            .map(|(id, l)| (id.clone(), l.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));

        let fmt_cap = |cap: Option<f64>| cap.map(|c| format!("{c:.6}")).unwrap_or_default();
        let mut csv =
            String::from("provider,day,day_spend,daily_budget,month,month_spend,monthly_budget\n");
        for (id, ledger) in rows {
            let caps = self.caps(&id).unwrap_or_default();
            csv.push_str(&format!(
                "{},{},{:.6},{},{},{:.6},{}\n",
                id,
                ledger.day,
                ledger.day_spend,
                fmt_cap(caps.daily),
                ledger.month.format("%Y-%m"),
                ledger.month_spend,
                fmt_cap(caps.monthly),
            ));
        }
        csv
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
