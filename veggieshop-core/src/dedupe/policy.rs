//! Replay fence policies

use std::collections::HashMap;
use std::time::Duration;

use crate::tenant::TenantId;

/// Fences applied before an event reaches the dedupe store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayPolicy {
    /// Versions below this are quarantined
    pub min_accepted_version: i64,
    /// Events older than now minus this window are quarantined
    pub replay_window: Duration,
    /// Events further in the future than this are quarantined
    pub max_future_skew: Duration,
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self {
            min_accepted_version: 0,
            replay_window: Duration::from_secs(10 * 24 * 3600),
            max_future_skew: Duration::from_secs(300),
        }
    }
}

/// Resolves the effective policy per (tenant, family)
pub trait ReplayPolicyProvider: Send + Sync {
    fn policy_for(&self, tenant: &TenantId, family: Option<&str>) -> ReplayPolicy;
}

/// Fixed default with optional per-(tenant, family) overrides
///
/// Lookup falls back from the most specific override to the default:
/// `(tenant, family)`, then `(tenant, any)`, then the default.
#[derive(Debug, Default)]
pub struct StaticReplayPolicyProvider {
    default: ReplayPolicy,
    overrides: HashMap<(TenantId, Option<String>), ReplayPolicy>,
}

impl StaticReplayPolicyProvider {
    pub fn new(default: ReplayPolicy) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(
        mut self,
        tenant: TenantId,
        family: Option<&str>,
        policy: ReplayPolicy,
    ) -> Self {
        self.overrides
            .insert((tenant, family.map(str::to_string)), policy);
        self
    }
}

impl ReplayPolicyProvider for StaticReplayPolicyProvider {
    fn policy_for(&self, tenant: &TenantId, family: Option<&str>) -> ReplayPolicy {
        if let Some(family) = family {
            if let Some(policy) = self
                .overrides
                .get(&(tenant.clone(), Some(family.to_string())))
            {
                return *policy;
            }
        }
        self.overrides
            .get(&(tenant.clone(), None))
            .copied()
            .unwrap_or(self.default)
    }
}
