//! Per-tenant token budgeting.
//!
//! The budgeter charges a pessimistic estimate before dispatch and corrects
//! it once the provider reports real usage:
//!
//! 1. [`TokenBudgeter::reserve`] charges the estimate to the tenant's
//!    current window, or fails with `BudgetExceeded` without charging.
//! 2. [`Reservation::settle`] replaces the estimate with the actual cost.
//!    An upward correction never takes the tenant past its ceiling.
//! 3. A reservation dropped unsettled is released in full.
//!
//! Windows are fixed-length and roll over lazily on the first access after
//! they end. A settlement or release that arrives after its window rolled
//! over is discarded, since the charge it would correct is already gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::telemetry;
use crate::types::{SamplingParams, TenantId};
use crate::{PromptgateError, Result};

/// Configuration for the token budgeter.
///
/// ```rust
/// # use promptgate::BudgetConfig;
/// # use std::time::Duration;
/// let config = BudgetConfig::new()
///     .tenant_ceiling(500_000)
///     .window(Duration::from_secs(3600))
///     .ceiling_for("acme", 2_000_000);
/// ```
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Largest estimate a single request may carry. Default: 4,000.
    pub max_tokens_per_request: u64,
    /// Tokens each tenant may consume per window. Default: 200,000.
    pub tenant_ceiling: u64,
    /// Window length. Default: 1 hour.
    pub window: Duration,
    /// Completion allowance assumed when a request omits `max_tokens`.
    /// Default: 1,024.
    pub default_completion_allowance: u32,
    /// Per-tenant ceiling overrides.
    pub overrides: HashMap<TenantId, u64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_request: 4_000,
            tenant_ceiling: 200_000,
            window: Duration::from_secs(3600),
            default_completion_allowance: 1_024,
            overrides: HashMap::new(),
        }
    }
}

impl BudgetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_tokens_per_request(mut self, n: u64) -> Self {
        self.max_tokens_per_request = n;
        self
    }

    pub fn tenant_ceiling(mut self, n: u64) -> Self {
        self.tenant_ceiling = n;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn default_completion_allowance(mut self, n: u32) -> Self {
        self.default_completion_allowance = n;
        self
    }

    /// Override the ceiling for one tenant.
    pub fn ceiling_for(mut self, tenant: impl Into<TenantId>, ceiling: u64) -> Self {
        self.overrides.insert(tenant.into(), ceiling);
        self
    }

    fn ceiling(&self, tenant: &TenantId) -> u64 {
        self.overrides
            .get(tenant)
            .copied()
            .unwrap_or(self.tenant_ceiling)
    }
}

/// Tenant state for the current window.
#[derive(Debug, Clone)]
pub struct TenantBudget {
    pub consumed: u64,
    pub window_start: Instant,
    pub ceiling: u64,
    epoch: u64,
}

impl TenantBudget {
    fn new(ceiling: u64) -> Self {
        Self {
            consumed: 0,
            window_start: Instant::now(),
            ceiling,
            epoch: 0,
        }
    }

    /// Start a fresh window if the current one has ended.
    fn roll(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.window_start) >= window {
            self.consumed = 0;
            self.window_start = now;
            self.epoch += 1;
        }
    }

    fn remaining(&self) -> u64 {
        self.ceiling.saturating_sub(self.consumed)
    }
}

/// Snapshot returned by [`TokenBudgeter::usage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetUsage {
    pub tenant: TenantId,
    pub consumed: u64,
    pub ceiling: u64,
    pub remaining: u64,
    pub window_resets_at: DateTime<Utc>,
}

struct Inner {
    config: BudgetConfig,
    tenants: DashMap<TenantId, TenantBudget>,
}

/// Per-tenant token accounting. Cheap to clone.
#[derive(Clone)]
pub struct TokenBudgeter {
    inner: Arc<Inner>,
}

impl TokenBudgeter {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                tenants: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.inner.config
    }

    /// Estimated cost of a request: prompt tokens plus the completion
    /// allowance (`max_tokens`, or the configured default).
    pub fn estimate(&self, prompt_tokens: usize, params: &SamplingParams) -> u64 {
        let completion = params
            .max_tokens
            .unwrap_or(self.inner.config.default_completion_allowance);
        prompt_tokens as u64 + u64::from(completion)
    }

    /// Charge `estimated` tokens to `tenant`'s current window.
    ///
    /// An estimate above the per-request limit is rejected without touching
    /// tenant state.
    pub fn reserve(&self, tenant: &TenantId, estimated: u64) -> Result<Reservation> {
        let config = &self.inner.config;
        if estimated > config.max_tokens_per_request {
            metrics::counter!(telemetry::BUDGET_REJECTIONS_TOTAL, "scope" => "request")
                .increment(1);
            return Err(PromptgateError::BudgetExceeded {
                tenant: tenant.to_string(),
                requested: estimated,
                remaining: config.max_tokens_per_request,
            });
        }

        let mut budget = self
            .inner
            .tenants
            .entry(tenant.clone())
            .or_insert_with(|| TenantBudget::new(config.ceiling(tenant)));
        budget.roll(Instant::now(), config.window);

        let remaining = budget.remaining();
        if estimated > remaining {
            metrics::counter!(telemetry::BUDGET_REJECTIONS_TOTAL, "scope" => "tenant")
                .increment(1);
            return Err(PromptgateError::BudgetExceeded {
                tenant: tenant.to_string(),
                requested: estimated,
                remaining,
            });
        }
        budget.consumed += estimated;
        debug!(%tenant, estimated, consumed = budget.consumed, "reserved tokens");

        Ok(Reservation {
            inner: Arc::clone(&self.inner),
            tenant: tenant.clone(),
            amount: estimated,
            epoch: budget.epoch,
            done: false,
        })
    }

    /// Current consumption for `tenant`. Unknown tenants report a fresh window.
    pub fn usage(&self, tenant: &TenantId) -> BudgetUsage {
        let config = &self.inner.config;
        let now = Instant::now();
        let (consumed, ceiling, window_start) = match self.inner.tenants.get_mut(tenant) {
            Some(mut budget) => {
                budget.roll(now, config.window);
                (budget.consumed, budget.ceiling, budget.window_start)
            }
            None => (0, config.ceiling(tenant), now),
        };
        let until_reset = (window_start + config.window).saturating_duration_since(now);
        let window_resets_at = TimeDelta::from_std(until_reset)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        BudgetUsage {
            tenant: tenant.clone(),
            consumed,
            ceiling,
            remaining: ceiling.saturating_sub(consumed),
            window_resets_at,
        }
    }
}

impl Inner {
    /// Replace `reserved` with `actual` if the window is still `epoch`.
    ///
    /// Returns the amount actually charged. A charge above the reservation
    /// is capped at the tenant's ceiling.
    fn adjust(&self, tenant: &TenantId, epoch: u64, reserved: u64, actual: u64) -> u64 {
        let Some(mut budget) = self.tenants.get_mut(tenant) else {
            return 0;
        };
        if budget.epoch != epoch {
            return 0;
        }
        let base = budget.consumed.saturating_sub(reserved);
        let mut next = base.saturating_add(actual);
        if actual > reserved {
            next = next.min(budget.ceiling.max(budget.consumed));
        }
        budget.consumed = next;
        next - base
    }
}

/// A provisional charge against a tenant's window.
///
/// Dropping it without calling [`settle`](Self::settle) releases the whole
/// amount, which covers error, timeout and cancellation paths.
#[must_use = "dropping a reservation releases it"]
pub struct Reservation {
    inner: Arc<Inner>,
    tenant: TenantId,
    amount: u64,
    epoch: u64,
    done: bool,
}

impl Reservation {
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Tokens currently held.
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Correct the charge to the true cost, capped at the tenant's ceiling.
    pub fn settle(mut self, actual: u64) {
        let charged = self
            .inner
            .adjust(&self.tenant, self.epoch, self.amount, actual);
        if charged < actual {
            warn!(tenant = %self.tenant, actual, charged, "usage above ceiling was not charged");
        }
        debug!(tenant = %self.tenant, reserved = self.amount, actual, "settled tokens");
        self.done = true;
    }

    /// Release the whole charge now.
    pub fn release(self) {
        // Drop does the work.
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.done {
            self.inner.adjust(&self.tenant, self.epoch, self.amount, 0);
        }
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("tenant", &self.tenant)
            .field("amount", &self.amount)
            .field("epoch", &self.epoch)
            .finish()
    }
}
