use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use keel_reconcile::{BackoffPolicy, ControllerConfig};

use crate::controllers::NodeLifecycleConfig;
use crate::leader::LeaderElectionConfig;
use crate::scheduler::{SchedulerConfig, ScoringWeights};

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub leader_election: LeaderElectionConfig,
    pub controller: ControllerConfig,
    pub scheduler: SchedulerConfig,
    pub node_lifecycle: NodeLifecycleConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any `KEEL_*` variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let listen_addr: SocketAddr =
            vars.parse("KEEL_LISTEN_ADDR", SocketAddr::from(([127, 0, 0, 1], 8080)))?;
        let log_level = vars.get("KEEL_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let identity = vars
            .get("KEEL_IDENTITY")
            .or_else(|| vars.get("HOSTNAME"))
            .unwrap_or_else(|| format!("keel-{}", keel_id::HolderId::new()));
        let mut leader_election = LeaderElectionConfig::new(identity);
        if let Some(name) = vars.get("KEEL_LEASE_NAME") {
            leader_election.lease_name = name;
        }
        if let Some(namespace) = vars.get("KEEL_LEASE_NAMESPACE") {
            leader_election.lease_namespace = namespace;
        }
        leader_election.lease_duration =
            vars.secs("KEEL_LEASE_DURATION_SECS", leader_election.lease_duration)?;
        leader_election.renew_deadline =
            vars.secs("KEEL_LEASE_RENEW_DEADLINE_SECS", leader_election.renew_deadline)?;
        leader_election.retry_period =
            vars.secs("KEEL_LEASE_RETRY_PERIOD_SECS", leader_election.retry_period)?;
        leader_election.validate()?;

        let defaults = ControllerConfig::default();
        let max_retries: u32 = vars.parse("KEEL_MAX_RETRIES", 15)?;
        let controller = ControllerConfig {
            workers: vars.parse("KEEL_WORKERS", defaults.workers)?,
            resync_period: vars.secs("KEEL_RESYNC_SECS", defaults.resync_period)?,
            backoff: BackoffPolicy::new(
                vars.millis("KEEL_BACKOFF_BASE_MS", defaults.backoff.base)?,
                vars.millis("KEEL_BACKOFF_MAX_MS", defaults.backoff.max)?,
            ),
            max_retries: (max_retries > 0).then_some(max_retries),
        };

        let weights = ScoringWeights::default();
        let scheduler = SchedulerConfig {
            weights: ScoringWeights {
                least_allocated: vars.parse("KEEL_SCORE_LEAST_ALLOCATED", weights.least_allocated)?,
                balanced_allocation: vars
                    .parse("KEEL_SCORE_BALANCED_ALLOCATION", weights.balanced_allocation)?,
                node_affinity: vars.parse("KEEL_SCORE_NODE_AFFINITY", weights.node_affinity)?,
                inter_pod_affinity: vars
                    .parse("KEEL_SCORE_INTER_POD_AFFINITY", weights.inter_pod_affinity)?,
                taint_toleration: vars
                    .parse("KEEL_SCORE_TAINT_TOLERATION", weights.taint_toleration)?,
            },
            unschedulable_retry: vars.secs(
                "KEEL_UNSCHEDULABLE_RETRY_SECS",
                SchedulerConfig::default().unschedulable_retry,
            )?,
            seed: vars
                .get("KEEL_SCHEDULER_SEED")
                .map(|s| s.trim().parse::<u64>())
                .transpose()
                .context("invalid KEEL_SCHEDULER_SEED")?,
        };

        let node_defaults = NodeLifecycleConfig::default();
        let node_lifecycle = NodeLifecycleConfig {
            monitor_period: vars.secs("KEEL_NODE_MONITOR_PERIOD_SECS", node_defaults.monitor_period)?,
            grace_period: vars.secs("KEEL_NODE_GRACE_PERIOD_SECS", node_defaults.grace_period)?,
            eviction_timeout: vars
                .secs("KEEL_NODE_EVICTION_TIMEOUT_SECS", node_defaults.eviction_timeout)?,
        };

        Ok(Self {
            listen_addr,
            log_level,
            leader_election,
            controller,
            scheduler,
            node_lifecycle,
        })
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.get(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid {key}: {raw:?}")),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration> {
        Ok(Duration::from_secs(self.parse(key, default.as_secs())?))
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration> {
        let millis = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        Ok(Duration::from_millis(self.parse(key, millis)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("KEEL_IDENTITY", "replica-0")]).unwrap();
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.leader_election.identity, "replica-0");
        assert_eq!(config.leader_election.lease_duration, Duration::from_secs(15));
        assert_eq!(config.controller.max_retries, Some(15));
        assert_eq!(config.scheduler.weights.taint_toleration, 3);
        assert_eq!(config.scheduler.seed, None);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("KEEL_IDENTITY", "replica-1"),
            ("KEEL_WORKERS", "8"),
            ("KEEL_MAX_RETRIES", "0"),
            ("KEEL_SCORE_LEAST_ALLOCATED", "0"),
            ("KEEL_SCHEDULER_SEED", "42"),
            ("KEEL_NODE_GRACE_PERIOD_SECS", "10"),
        ])
        .unwrap();
        assert_eq!(config.controller.workers, 8);
        assert_eq!(config.controller.max_retries, None);
        assert_eq!(config.scheduler.weights.least_allocated, 0);
        assert_eq!(config.scheduler.seed, Some(42));
        assert_eq!(config.node_lifecycle.grace_period, Duration::from_secs(10));
    }

    #[test]
    fn test_identity_falls_back_to_hostname() {
        let config = config(&[("HOSTNAME", "host-a")]).unwrap();
        assert_eq!(config.leader_election.identity, "host-a");
    }

    #[test]
    fn test_rejects_garbage_and_unsafe_lease_timing() {
        assert!(config(&[("KEEL_WORKERS", "many")]).is_err());
        assert!(config(&[("KEEL_LEASE_RENEW_DEADLINE_SECS", "20")]).is_err());
    }
}
