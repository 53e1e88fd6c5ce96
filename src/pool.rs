//! Ordered pool of redundant upstream deployments.

use crate::config::{EndpointConfig, StartPolicy};
use rand_core::{OsRng, RngCore};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub credential: String,
    pub resource: String,
    pub deployment: String,
    pub model_name: String,
}

impl Endpoint {
    /// `https://<resource>.openai.azure.com`, unless the resource is already a URL.
    pub fn base_url(&self) -> String {
        let resource = self.resource.trim_end_matches('/');
        if resource.starts_with("http://") || resource.starts_with("https://") {
            resource.to_string()
        } else {
            format!("https://{resource}.openai.azure.com")
        }
    }

    pub fn deployment_url(&self) -> String {
        format!("{}/openai/deployments/{}", self.base_url(), self.deployment)
    }
}

impl From<&EndpointConfig> for Endpoint {
    fn from(cfg: &EndpointConfig) -> Self {
        Self {
            credential: cfg.credential.clone(),
            resource: cfg.resource.clone(),
            deployment: cfg.deployment.clone(),
            model_name: cfg.model_name.clone(),
        }
    }
}

/// Source of the random starting index. Injected so tests can pin failover order.
pub trait StartIndexSource: Send + Sync {
    /// Returns a value in `[0, bound)`. `bound` is never zero.
    fn pick(&self, bound: usize) -> usize;
}

pub struct OsStartIndex;

impl StartIndexSource for OsStartIndex {
    fn pick(&self, bound: usize) -> usize {
        if bound <= 1 {
            return 0;
        }
        (OsRng.next_u64() % bound as u64) as usize
    }
}

/// Always picks the same index (clamped into range).
pub struct FixedStartIndex(pub usize);

impl StartIndexSource for FixedStartIndex {
    fn pick(&self, bound: usize) -> usize {
        self.0 % bound.max(1)
    }
}

#[derive(Clone)]
pub struct EndpointPool {
    endpoints: Arc<[Endpoint]>,
    policy: StartPolicy,
    source: Arc<dyn StartIndexSource>,
}

impl std::fmt::Debug for EndpointPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointPool")
            .field("size", &self.endpoints.len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl EndpointPool {
    pub fn new(endpoints: Vec<Endpoint>, policy: StartPolicy) -> Self {
        Self::with_source(endpoints, policy, Arc::new(OsStartIndex))
    }

    pub fn with_source(
        endpoints: Vec<Endpoint>,
        policy: StartPolicy,
        source: Arc<dyn StartIndexSource>,
    ) -> Self {
        assert!(!endpoints.is_empty(), "endpoint pool must not be empty");
        Self {
            endpoints: endpoints.into(),
            policy,
            source,
        }
    }

    pub fn from_configs(configs: &[EndpointConfig], policy: StartPolicy) -> Self {
        Self::new(configs.iter().map(Endpoint::from).collect(), policy)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn policy(&self) -> StartPolicy {
        self.policy
    }

    /// Panics on an out-of-range index; callers only ever hold indices produced by this pool.
    pub fn select(&self, index: usize) -> &Endpoint {
        assert!(
            index < self.endpoints.len(),
            "endpoint index {index} out of range for pool of {}",
            self.endpoints.len()
        );
        &self.endpoints[index]
    }

    pub fn next(&self, index: usize) -> usize {
        (index + 1) % self.endpoints.len()
    }

    pub fn initial_index(&self) -> usize {
        match self.policy {
            StartPolicy::Fixed => 0,
            StartPolicy::Random => self.source.pick(self.endpoints.len()) % self.endpoints.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str) -> Endpoint {
        Endpoint {
            credential: format!("key-{name}"),
            resource: name.to_string(),
            deployment: format!("dep-{name}"),
            model_name: "gpt-4".to_string(),
        }
    }

    fn pool_of_three(policy: StartPolicy, start: usize) -> EndpointPool {
        EndpointPool::with_source(
            vec![endpoint("a"), endpoint("b"), endpoint("c")],
            policy,
            Arc::new(FixedStartIndex(start)),
        )
    }

    #[test]
    fn next_cycles_back_to_start() {
        let pool = pool_of_three(StartPolicy::Fixed, 0);
        for i in 0..3 {
            assert_eq!(pool.next(pool.next(pool.next(i))), i);
        }
        assert_eq!(pool.next(2), 0);
    }

    #[test]
    fn fixed_policy_always_starts_at_zero() {
        let pool = pool_of_three(StartPolicy::Fixed, 2);
        assert_eq!(pool.initial_index(), 0);
    }

    #[test]
    fn random_policy_uses_injected_source() {
        let pool = pool_of_three(StartPolicy::Random, 2);
        assert_eq!(pool.initial_index(), 2);
    }

    #[test]
    fn os_source_stays_in_range() {
        let source = OsStartIndex;
        for _ in 0..64 {
            assert!(source.pick(3) < 3);
        }
        assert_eq!(source.pick(1), 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn select_out_of_range_panics() {
        let pool = pool_of_three(StartPolicy::Fixed, 0);
        let _ = pool.select(3);
    }

    #[test]
    fn base_url_derives_from_resource() {
        assert_eq!(endpoint("east").base_url(), "https://east.openai.azure.com");
        let custom = Endpoint {
            resource: "http://127.0.0.1:9000/".to_string(),
            ..endpoint("x")
        };
        assert_eq!(custom.base_url(), "http://127.0.0.1:9000");
        assert_eq!(
            custom.deployment_url(),
            "http://127.0.0.1:9000/openai/deployments/dep-x"
        );
    }
}
