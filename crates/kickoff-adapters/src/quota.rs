//! Daily request budget for a metered provider.
//!
//! One governor is created per provider by the composition root and shared by every
//! consumer of that provider's budget.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaPolicy {
    pub hard_daily_limit: u32,
    /// Ceiling this process allows itself, below the provider's hard limit.
    pub operational_cap: u32,
    pub max_calls_per_day: u32,
    pub safety_reserve: u32,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            hard_daily_limit: 100,
            operational_cap: 90,
            max_calls_per_day: 40,
            safety_reserve: 10,
        }
    }
}

impl QuotaPolicy {
    pub fn effective_operational_cap(&self) -> u32 {
        self.operational_cap.min(self.hard_daily_limit)
    }

    pub fn consumer_cap(&self) -> u32 {
        self.max_calls_per_day.min(self.effective_operational_cap())
    }

    /// Calls kept back from the hard limit.
    pub fn margin(&self) -> u32 {
        self.hard_daily_limit - self.effective_operational_cap()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaRefusal {
    ReservedForHigherPriority { remaining: u32, reserved: u32 },
    OperationalMargin { remaining: u32, margin: u32 },
    ConsumerCapReached { cap: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Granted { remaining: u32 },
    Refused(QuotaRefusal),
}

impl QuotaDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub day: NaiveDate,
    pub consumed: u32,
    pub consumer_consumed: u32,
}

#[derive(Debug)]
pub struct QuotaGovernor {
    policy: QuotaPolicy,
    state: Mutex<QuotaSnapshot>,
}

impl QuotaGovernor {
    pub fn new(policy: QuotaPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(QuotaSnapshot {
                day: Utc::now().date_naive(),
                consumed: 0,
                consumer_consumed: 0,
            }),
        }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// `reported_remaining` is the provider's own figure when its status endpoint answered.
    /// `imminent_priority_calls` is added to the policy's safety reserve.
    pub async fn try_acquire(
        &self,
        reported_remaining: Option<u32>,
        imminent_priority_calls: u32,
    ) -> QuotaDecision {
        self.try_acquire_at(Utc::now(), reported_remaining, imminent_priority_calls)
            .await
    }

    pub async fn try_acquire_at(
        &self,
        now: DateTime<Utc>,
        reported_remaining: Option<u32>,
        imminent_priority_calls: u32,
    ) -> QuotaDecision {
        let mut state = self.state.lock().await;
        roll_day(&mut state, now);

        let local_remaining = self.policy.hard_daily_limit.saturating_sub(state.consumed);
        let remaining = reported_remaining
            .map(|r| r.min(local_remaining))
            .unwrap_or(local_remaining);

        let reserved = self.policy.safety_reserve.saturating_add(imminent_priority_calls);
        if remaining <= reserved {
            return QuotaDecision::Refused(QuotaRefusal::ReservedForHigherPriority {
                remaining,
                reserved,
            });
        }
        let margin = self.policy.margin();
        if remaining <= margin {
            return QuotaDecision::Refused(QuotaRefusal::OperationalMargin { remaining, margin });
        }
        let cap = self.policy.consumer_cap();
        if state.consumer_consumed >= cap {
            return QuotaDecision::Refused(QuotaRefusal::ConsumerCapReached { cap });
        }

        state.consumed += 1;
        state.consumer_consumed += 1;
        QuotaDecision::Granted {
            remaining: remaining - 1,
        }
    }

    /// Charges a call made by a consumer outside this pipeline against the shared budget.
    pub async fn record_external_call(&self) {
        let mut state = self.state.lock().await;
        roll_day(&mut state, Utc::now());
        state.consumed += 1;
    }

    pub async fn snapshot(&self) -> QuotaSnapshot {
        let mut state = self.state.lock().await;
        roll_day(&mut state, Utc::now());
        *state
    }

    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        *state = QuotaSnapshot {
            day: Utc::now().date_naive(),
            consumed: 0,
            consumer_consumed: 0,
        };
    }
}

fn roll_day(state: &mut QuotaSnapshot, now: DateTime<Utc>) {
    let today = now.date_naive();
    if state.day != today {
        state.day = today;
        state.consumed = 0;
        state.consumer_consumed = 0;
    }
}
