//! Token-bucket rate limiting with composite keys
//!
//! Buckets are keyed by an ordered composite of request attributes
//! (default `tenant|ip`) and refilled in whole steps of
//! `refill_tokens` per `refill_period`. Policies attach per route via glob
//! patterns; the most specific matching pattern wins. The bucket map is
//! bounded; idle buckets are pruned when the bound is exceeded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use http::{HeaderName, HeaderValue};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::clock::MonotonicClock;
use crate::problem::{Problem, ProblemKind};
use crate::tenant::TenantId;

/// One component of the composite bucket key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPart {
    Ip,
    Tenant,
    Header(String),
    Path,
}

impl KeyPart {
    /// Parse `ip`, `tenant`, `path`, or `header:<NAME>`
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ip" => Some(Self::Ip),
            "tenant" => Some(Self::Tenant),
            "path" => Some(Self::Path),
            other => other
                .strip_prefix("header:")
                .map(|name| Self::Header(name.to_ascii_lowercase())),
        }
    }
}

/// Refill policy for one bucket class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePolicy {
    pub capacity: u32,
    pub refill_tokens: u32,
    /// Seconds per refill step
    pub refill_period_secs: u64,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_tokens: 100,
            refill_period_secs: 60,
        }
    }
}

impl RatePolicy {
    fn period(&self) -> Duration {
        Duration::from_secs(self.refill_period_secs.max(1))
    }

    /// Seconds to refill the full capacity from empty
    fn window_secs(&self) -> u64 {
        let refill = self.refill_tokens.max(1) as u64;
        self.refill_period_secs.max(1) * self.capacity.max(1) as u64 / refill
    }
}

/// Rate limiter tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Composite key parts in order; defaults to `tenant|ip`
    #[serde(default = "default_key_parts")]
    pub key_parts: Vec<String>,

    #[serde(default)]
    pub default_policy: RatePolicy,

    /// Route patterns (`/v1/orders`, `/v1/orders/*`, `/v1/**`) to policies
    #[serde(default)]
    pub routes: HashMap<String, RatePolicy>,

    /// Bucket map bound; pruning starts above this
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,

    /// Buckets idle longer than this are prune candidates
    #[serde(default = "default_idle_evict_after_secs")]
    pub idle_evict_after_secs: u64,
}

fn default_key_parts() -> Vec<String> {
    vec!["tenant".to_string(), "ip".to_string()]
}
fn default_max_buckets() -> usize {
    100_000
}
fn default_idle_evict_after_secs() -> u64 {
    600
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            key_parts: default_key_parts(),
            default_policy: RatePolicy::default(),
            routes: HashMap::new(),
            max_buckets: default_max_buckets(),
            idle_evict_after_secs: default_idle_evict_after_secs(),
        }
    }
}

/// Request attributes the limiter keys on
#[derive(Debug, Default)]
pub struct RateLimitRequest<'a> {
    pub ip: Option<&'a str>,
    pub tenant: Option<&'a TenantId>,
    pub path: &'a str,
    pub headers: Option<&'a http::HeaderMap>,
}

/// The limiter's verdict plus everything needed for response headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u64,
    pub reset_secs: u64,
    pub window_secs: u64,
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    /// Emit `RateLimit-*` headers (and `Retry-After` on denial)
    pub fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let set = |headers: &mut http::HeaderMap, name: &'static str, value: String| {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        };
        set(
            headers,
            "ratelimit-limit",
            format!("{};w={}", self.limit, self.window_secs),
        );
        set(headers, "ratelimit-remaining", self.remaining.to_string());
        set(headers, "ratelimit-reset", self.reset_secs.to_string());
        if let Some(retry_after) = self.retry_after_secs {
            set(headers, "retry-after", retry_after.to_string());
        }
    }

    pub fn to_problem(&self) -> Problem {
        Problem::with_detail(ProblemKind::RateLimited, "Rate limit exceeded")
            .extension("retry-after-seconds", self.retry_after_secs.unwrap_or(0))
            .header(
                http::header::RETRY_AFTER,
                self.retry_after_secs.unwrap_or(0).to_string(),
            )
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill_nanos: u64,
    last_seen_nanos: u64,
}

struct CompiledRoute {
    regex: Regex,
    policy: RatePolicy,
    specificity: usize,
}

/// Compiled route policies, most specific first
struct RoutePolicies {
    exact: HashMap<String, RatePolicy>,
    patterns: Vec<CompiledRoute>,
}

impl RoutePolicies {
    fn compile(routes: &HashMap<String, RatePolicy>) -> Self {
        let mut exact = HashMap::new();
        let mut patterns = Vec::new();
        for (pattern, policy) in routes {
            if pattern.contains('*') {
                patterns.push(CompiledRoute {
                    regex: compile_glob(pattern),
                    policy: *policy,
                    specificity: specificity(pattern),
                });
            } else {
                exact.insert(pattern.clone(), *policy);
            }
        }
        patterns.sort_by(|a, b| b.specificity.cmp(&a.specificity));
        Self { exact, patterns }
    }

    fn match_path(&self, path: &str) -> Option<&RatePolicy> {
        if let Some(policy) = self.exact.get(path) {
            return Some(policy);
        }
        self.patterns
            .iter()
            .find(|route| route.regex.is_match(path))
            .map(|route| &route.policy)
    }
}

fn compile_glob(pattern: &str) -> Regex {
    let mut regex_str = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    regex_str.push_str(".*");
                } else {
                    regex_str.push_str("[^/]+");
                }
            }
            '.' | '+' | '?' | '(' | ')' | '[' | ']' | '^' | '$' | '|' | '\\' => {
                regex_str.push('\\');
                regex_str.push(c);
            }
            _ => regex_str.push(c),
        }
    }
    regex_str.push('$');
    Regex::new(&regex_str).expect("glob compiles to valid regex")
}

fn specificity(pattern: &str) -> usize {
    let mut score = 0;
    for segment in pattern.split('/') {
        if segment.is_empty() {
            continue;
        }
        score += match segment {
            "**" => 1,
            "*" => 5,
            _ => 10,
        };
    }
    score + pattern.len()
}

/// In-process token-bucket limiter
pub struct TokenBucketLimiter {
    buckets: DashMap<String, Bucket>,
    routes: RoutePolicies,
    key_parts: Vec<KeyPart>,
    config: RateLimitConfig,
    clock: Arc<dyn MonotonicClock>,
}

impl TokenBucketLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn MonotonicClock>) -> Self {
        let key_parts: Vec<KeyPart> = config
            .key_parts
            .iter()
            .filter_map(|raw| {
                let part = KeyPart::parse(raw);
                if part.is_none() {
                    tracing::warn!(part = raw.as_str(), "ignoring unknown rate-limit key part");
                }
                part
            })
            .collect();
        let key_parts = if key_parts.is_empty() {
            vec![KeyPart::Tenant, KeyPart::Ip]
        } else {
            key_parts
        };
        Self {
            buckets: DashMap::new(),
            routes: RoutePolicies::compile(&config.routes),
            key_parts,
            config,
            clock,
        }
    }

    /// Take one token for the request
    pub fn check(&self, request: &RateLimitRequest<'_>) -> RateLimitDecision {
        let policy = *self
            .routes
            .match_path(request.path)
            .unwrap_or(&self.config.default_policy);
        let key = self.composite_key(request);
        let now = self.clock.now_nanos();
        let decision = self.update_bucket(&key, &policy, now);

        if self.buckets.len() > self.config.max_buckets {
            self.prune_idle(now);
        }
        decision
    }

    /// Like `check`, but a denial raises `rate-limited`
    pub fn enforce(&self, request: &RateLimitRequest<'_>) -> Result<RateLimitDecision, Problem> {
        let decision = self.check(request);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(decision.to_problem())
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn composite_key(&self, request: &RateLimitRequest<'_>) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(self.key_parts.len());
        for part in &self.key_parts {
            let value = match part {
                KeyPart::Ip => request.ip.unwrap_or("-").to_string(),
                KeyPart::Tenant => request
                    .tenant
                    .map(|t| t.as_str().to_string())
                    .unwrap_or_else(|| "-".to_string()),
                KeyPart::Path => request.path.to_string(),
                KeyPart::Header(name) => request
                    .headers
                    .and_then(|headers| headers.get(name.as_str()))
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-")
                    .to_string(),
            };
            parts.push(value);
        }
        parts.join("|")
    }

    fn update_bucket(&self, key: &str, policy: &RatePolicy, now: u64) -> RateLimitDecision {
        let period = policy.period();
        let period_nanos = period.as_nanos() as u64;
        let capacity = policy.capacity.max(1);

        // The entry guard is the bucket-scoped critical section
        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: capacity as f64,
            last_refill_nanos: now,
            last_seen_nanos: now,
        });
        let bucket = entry.value_mut();
        bucket.last_seen_nanos = now;

        let elapsed = now.saturating_sub(bucket.last_refill_nanos);
        let steps = elapsed / period_nanos;
        if steps > 0 {
            bucket.tokens = (bucket.tokens + steps as f64 * policy.refill_tokens as f64)
                .min(capacity as f64);
            bucket.last_refill_nanos += steps * period_nanos;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            let consumed = capacity as f64 - bucket.tokens;
            let reset_secs = (consumed * period.as_secs_f64()
                / policy.refill_tokens.max(1) as f64)
                .ceil() as u64;
            RateLimitDecision {
                allowed: true,
                limit: capacity,
                remaining: bucket.tokens.floor() as u64,
                reset_secs,
                window_secs: policy.window_secs(),
                retry_after_secs: None,
            }
        } else {
            let since_refill = now.saturating_sub(bucket.last_refill_nanos);
            let until_refill_nanos = period_nanos.saturating_sub(since_refill);
            let reset_secs = Duration::from_nanos(until_refill_nanos).as_secs_f64().ceil() as u64;
            RateLimitDecision {
                allowed: false,
                limit: capacity,
                remaining: 0,
                reset_secs,
                window_secs: policy.window_secs(),
                retry_after_secs: Some(reset_secs.max(1)),
            }
        }
    }

    /// Drop up to 10% of the bound, oldest-idle entries beyond the idle cutoff
    fn prune_idle(&self, now: u64) {
        let idle_nanos = Duration::from_secs(self.config.idle_evict_after_secs).as_nanos() as u64;
        let quota = (self.config.max_buckets / 10).max(1);
        let mut victims: Vec<(String, u64)> = self
            .buckets
            .iter()
            .filter(|entry| now.saturating_sub(entry.last_seen_nanos) > idle_nanos)
            .map(|entry| (entry.key().clone(), entry.last_seen_nanos))
            .collect();
        victims.sort_by_key(|(_, last_seen)| *last_seen);
        let pruned = victims.len().min(quota);
        for (key, _) in victims.into_iter().take(quota) {
            self.buckets.remove(&key);
        }
        if pruned > 0 {
            tracing::debug!(pruned, "rate-limit buckets pruned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn tenant() -> TenantId {
        TenantId::parse("acme").unwrap()
    }

    fn limiter(config: RateLimitConfig) -> (TokenBucketLimiter, Arc<ManualClock>) {
        let clock = ManualClock::new(0);
        (TokenBucketLimiter::new(config, clock.clone()), clock)
    }

    fn request<'a>(tenant: &'a TenantId, path: &'a str) -> RateLimitRequest<'a> {
        RateLimitRequest {
            ip: Some("10.0.0.1"),
            tenant: Some(tenant),
            path,
            headers: None,
        }
    }

    #[test]
    fn test_allows_up_to_capacity_then_denies() {
        let config = RateLimitConfig {
            default_policy: RatePolicy {
                capacity: 3,
                refill_tokens: 3,
                refill_period_secs: 60,
            },
            ..Default::default()
        };
        let (limiter, _clock) = limiter(config);
        let t = tenant();

        for _ in 0..3 {
            assert!(limiter.check(&request(&t, "/v1/orders")).allowed);
        }
        let denied = limiter.check(&request(&t, "/v1/orders"));
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after_secs.is_some());
    }

    #[test]
    fn test_refill_in_whole_steps() {
        let config = RateLimitConfig {
            default_policy: RatePolicy {
                capacity: 2,
                refill_tokens: 1,
                refill_period_secs: 10,
            },
            ..Default::default()
        };
        let (limiter, clock) = limiter(config);
        let t = tenant();

        assert!(limiter.check(&request(&t, "/p")).allowed);
        assert!(limiter.check(&request(&t, "/p")).allowed);
        assert!(!limiter.check(&request(&t, "/p")).allowed);

        // Half a period is not a step
        clock.advance_nanos(Duration::from_secs(5).as_nanos() as u64);
        assert!(!limiter.check(&request(&t, "/p")).allowed);

        // One full period refills one token
        clock.advance_nanos(Duration::from_secs(5).as_nanos() as u64);
        assert!(limiter.check(&request(&t, "/p")).allowed);
        assert!(!limiter.check(&request(&t, "/p")).allowed);
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let config = RateLimitConfig {
            default_policy: RatePolicy {
                capacity: 2,
                refill_tokens: 2,
                refill_period_secs: 1,
            },
            ..Default::default()
        };
        let (limiter, clock) = limiter(config);
        let t = tenant();
        assert!(limiter.check(&request(&t, "/p")).allowed);

        clock.advance_nanos(Duration::from_secs(3600).as_nanos() as u64);
        let decision = limiter.check(&request(&t, "/p"));
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[test]
    fn test_composite_keys_isolate() {
        let config = RateLimitConfig {
            default_policy: RatePolicy {
                capacity: 1,
                refill_tokens: 1,
                refill_period_secs: 60,
            },
            ..Default::default()
        };
        let (limiter, _clock) = limiter(config);
        let acme = tenant();
        let globex = TenantId::parse("globex").unwrap();

        assert!(limiter.check(&request(&acme, "/p")).allowed);
        assert!(!limiter.check(&request(&acme, "/p")).allowed);
        // A different tenant has its own bucket
        assert!(limiter.check(&request(&globex, "/p")).allowed);
        // A different ip likewise
        let other_ip = RateLimitRequest {
            ip: Some("10.0.0.2"),
            tenant: Some(&acme),
            path: "/p",
            headers: None,
        };
        assert!(limiter.check(&other_ip).allowed);
    }

    #[test]
    fn test_header_key_part() {
        let config = RateLimitConfig {
            key_parts: vec!["header:x-api-key".to_string()],
            default_policy: RatePolicy {
                capacity: 1,
                refill_tokens: 1,
                refill_period_secs: 60,
            },
            ..Default::default()
        };
        let (limiter, _clock) = limiter(config);

        let mut headers_a = http::HeaderMap::new();
        headers_a.insert("x-api-key", "alpha".parse().unwrap());
        let mut headers_b = http::HeaderMap::new();
        headers_b.insert("x-api-key", "beta".parse().unwrap());

        let req_a = RateLimitRequest {
            path: "/p",
            headers: Some(&headers_a),
            ..Default::default()
        };
        let req_b = RateLimitRequest {
            path: "/p",
            headers: Some(&headers_b),
            ..Default::default()
        };
        assert!(limiter.check(&req_a).allowed);
        assert!(!limiter.check(&req_a).allowed);
        assert!(limiter.check(&req_b).allowed);
    }

    #[test]
    fn test_route_policy_most_specific_wins() {
        let mut routes = HashMap::new();
        routes.insert(
            "/v1/**".to_string(),
            RatePolicy {
                capacity: 100,
                refill_tokens: 100,
                refill_period_secs: 60,
            },
        );
        routes.insert(
            "/v1/exports/*".to_string(),
            RatePolicy {
                capacity: 1,
                refill_tokens: 1,
                refill_period_secs: 60,
            },
        );
        let config = RateLimitConfig {
            routes,
            ..Default::default()
        };
        let (limiter, _clock) = limiter(config);
        let t = tenant();

        assert_eq!(limiter.check(&request(&t, "/v1/exports/full")).limit, 1);
        assert_eq!(limiter.check(&request(&t, "/v1/orders")).limit, 100);
        // Unmatched paths use the default policy
        assert_eq!(limiter.check(&request(&t, "/healthz")).limit, 100);
    }

    #[test]
    fn test_headers_shape() {
        let config = RateLimitConfig {
            default_policy: RatePolicy {
                capacity: 10,
                refill_tokens: 10,
                refill_period_secs: 60,
            },
            ..Default::default()
        };
        let (limiter, _clock) = limiter(config);
        let t = tenant();
        let decision = limiter.check(&request(&t, "/p"));

        let mut headers = http::HeaderMap::new();
        decision.apply_headers(&mut headers);
        assert_eq!(headers["ratelimit-limit"], "10;w=60");
        assert_eq!(headers["ratelimit-remaining"], "9");
        assert!(headers.contains_key("ratelimit-reset"));
        assert!(!headers.contains_key("retry-after"));
    }

    #[test]
    fn test_denial_problem_and_retry_after() {
        let config = RateLimitConfig {
            default_policy: RatePolicy {
                capacity: 1,
                refill_tokens: 1,
                refill_period_secs: 60,
            },
            ..Default::default()
        };
        let (limiter, _clock) = limiter(config);
        let t = tenant();
        limiter.check(&request(&t, "/p"));
        let err = limiter.enforce(&request(&t, "/p")).unwrap_err();
        assert_eq!(err.kind(), ProblemKind::RateLimited);
        assert!(err
            .response_headers()
            .iter()
            .any(|(name, _)| *name == http::header::RETRY_AFTER));
    }

    #[test]
    fn test_bounded_map_prunes_idle() {
        let config = RateLimitConfig {
            max_buckets: 10,
            idle_evict_after_secs: 1,
            ..Default::default()
        };
        let (limiter, clock) = limiter(config);
        let t = tenant();

        for i in 0..10 {
            let ip = format!("10.0.0.{i}");
            limiter.check(&RateLimitRequest {
                ip: Some(&ip),
                tenant: Some(&t),
                path: "/p",
                headers: None,
            });
        }
        assert_eq!(limiter.bucket_count(), 10);

        // All existing buckets go idle, then one more insert triggers pruning
        clock.advance_nanos(Duration::from_secs(2).as_nanos() as u64);
        limiter.check(&RateLimitRequest {
            ip: Some("10.0.0.99"),
            tenant: Some(&t),
            path: "/p/new",
            headers: None,
        });
        assert!(limiter.bucket_count() <= 10);
    }
}
