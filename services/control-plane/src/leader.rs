//! Lease-based leader election.
//!
//! Replicas race to hold one [`Lease`] object. The holder renews it every
//! `retry_period`; everyone else polls at the same period and takes over
//! once the record has gone unchanged for a full `lease_duration`.
//!
//! Expiry is judged against the local monotonic clock at the moment a
//! replica first observed the current record, never against the
//! timestamps inside it, so wall-clock skew between replicas cannot make a
//! lease look expired early.
//!
//! A leader that cannot renew within `renew_deadline` demotes itself and
//! [`LeaderElector::run`] returns [`LeaderError::Lost`]; the caller must
//! stop all reconciliation. The deadline runs from when the last successful
//! request was sent, not from when its reply arrived. `renew_deadline + retry_period` must stay below
//! `lease_duration` so demotion always precedes takeover.

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use keel_api::{id::ResourceVersion, Lease, LeaseSpec};
use keel_store::{Api, BackoffPolicy, StoreError};
use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Leadership as seen by this replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Follower,
    Leader,
    /// Renewal failed; reconciliation is being stopped.
    Demoting,
}

#[derive(Debug, thiserror::Error)]
pub enum LeaderError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("leadership lost: {0}")]
    Lost(String),

    #[error("invalid leader election config: {0}")]
    Config(String),
}

#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub lease_namespace: String,
    pub lease_name: String,
    /// Unique per replica.
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            lease_namespace: "keel-system".to_string(),
            lease_name: "keel-control-plane".to_string(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }

    pub fn validate(&self) -> Result<(), LeaderError> {
        if self.identity.is_empty() {
            return Err(LeaderError::Config("identity must not be empty".into()));
        }
        if self.retry_period.is_zero() {
            return Err(LeaderError::Config("retry period must be positive".into()));
        }
        if self.renew_deadline + self.retry_period >= self.lease_duration {
            return Err(LeaderError::Config(format!(
                "renew deadline ({:?}) plus retry period ({:?}) must be less than lease duration ({:?})",
                self.renew_deadline, self.retry_period, self.lease_duration
            )));
        }
        Ok(())
    }
}

/// The last lease record seen and when it was first seen.
#[derive(Debug, Clone)]
struct Observed {
    spec: LeaseSpec,
    resource_version: Option<ResourceVersion>,
    at: Instant,
}

pub struct LeaderElector {
    api: Api<Lease>,
    config: LeaderElectionConfig,
    state: watch::Sender<LeaderState>,
    observed: Mutex<Option<Observed>>,
}

impl LeaderElector {
    /// `api` should not retry internally: a stalled renewal must surface
    /// within the renew deadline.
    pub fn new(api: Api<Lease>, config: LeaderElectionConfig) -> Result<Self, LeaderError> {
        config.validate()?;
        let (state, _) = watch::channel(LeaderState::Follower);
        let api = api
            .within(&config.lease_namespace)
            .with_actor(config.identity.clone())
            .with_retry(1, BackoffPolicy::default());
        Ok(Self {
            api,
            config,
            state,
            observed: Mutex::new(None),
        })
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == LeaderState::Leader
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: LeaderState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!(identity = %self.config.identity, from = ?prev, to = ?next, "Leadership changed");
        }
    }

    fn observe(&self, lease: &Lease) -> Observed {
        let mut observed = self
            .observed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match observed.as_ref() {
            Some(o) if o.resource_version == lease.metadata.resource_version => o.clone(),
            _ => {
                let fresh = Observed {
                    spec: lease.spec.clone(),
                    resource_version: lease.metadata.resource_version,
                    at: Instant::now(),
                };
                *observed = Some(fresh.clone());
                fresh
            }
        }
    }

    fn record_own(&self, lease: &Lease) {
        *self
            .observed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Observed {
            spec: lease.spec.clone(),
            resource_version: lease.metadata.resource_version,
            at: Instant::now(),
        });
    }

    /// One attempt to take or renew the lease. `Ok(true)` means this replica
    /// holds it now.
    #[instrument(skip(self), fields(identity = %self.config.identity))]
    pub async fn try_acquire_or_renew(&self) -> Result<bool, LeaderError> {
        let now = Utc::now();
        let lease_secs = self.config.lease_duration.as_secs().max(1);

        let Some(current) = self.api.get_opt(&self.config.lease_name).await? else {
            let lease = Lease::new(
                self.config.lease_namespace.clone(),
                self.config.lease_name.clone(),
                LeaseSpec {
                    holder_identity: Some(self.config.identity.clone()),
                    lease_duration_seconds: lease_secs,
                    acquire_time: Some(now),
                    renew_time: Some(now),
                    lease_transitions: 0,
                },
            );
            return match self.api.create(&lease).await {
                Ok(created) => {
                    self.record_own(&created);
                    Ok(true)
                }
                Err(e) if e.is_conflict() || matches!(e, StoreError::AlreadyExists(_)) => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let observed = self.observe(&current);
        let held_by_me = current.spec.is_held_by(&self.config.identity);
        let held_by_other = !held_by_me && current.spec.holder_identity.is_some();
        if held_by_other && observed.at.elapsed() < self.config.lease_duration {
            debug!(holder = ?observed.spec.holder_identity, "Lease held by another replica");
            return Ok(false);
        }

        let mut next = current.clone();
        next.spec.renew_time = Some(now);
        next.spec.lease_duration_seconds = lease_secs;
        if !held_by_me {
            next.spec.holder_identity = Some(self.config.identity.clone());
            next.spec.acquire_time = Some(now);
            next.spec.lease_transitions = current.spec.lease_transitions.saturating_add(1);
        }

        match self.api.update(&next).await {
            Ok(updated) => {
                self.record_own(&updated);
                if !held_by_me {
                    info!(
                        previous = ?current.spec.holder_identity,
                        transitions = updated.spec.lease_transitions,
                        "Acquired lease"
                    );
                }
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Campaign for the lease and hold it until shutdown.
    ///
    /// Returns `Ok` after a clean shutdown (releasing the lease if held) and
    /// `Err(Lost)` once renewal fails, with the state left at `Demoting`.
    #[instrument(skip_all, fields(identity = %self.config.identity))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), LeaderError> {
        info!(
            lease = %self.config.lease_name,
            lease_secs = self.config.lease_duration.as_secs(),
            "Starting leader election"
        );

        // Campaign. Leadership is dated from when the winning request was
        // sent, since the store may have recorded it long before the reply.
        let mut last_renew = loop {
            let sent = Instant::now();
            let attempt =
                tokio::time::timeout(self.config.renew_deadline, self.try_acquire_or_renew()).await;
            match attempt {
                Ok(Ok(true)) => break sent,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!(error = %e, "Failed to acquire lease"),
                Err(_) => warn!("Lease request timed out"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.jittered_retry()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        };
        self.set_state(LeaderState::Leader);

        // Renew.
        let mut ticker = tokio::time::interval(self.config.retry_period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.release().await;
                        self.set_state(LeaderState::Follower);
                        return Ok(());
                    }
                    continue;
                }
            }

            let sent = Instant::now();
            let remaining = self
                .config
                .renew_deadline
                .saturating_sub(sent.duration_since(last_renew));
            let attempt = tokio::time::timeout(remaining, self.try_acquire_or_renew()).await;
            let reason = match attempt {
                Ok(Ok(true)) => {
                    last_renew = sent;
                    continue;
                }
                Ok(Ok(false)) => "lease taken by another replica".to_string(),
                Ok(Err(e)) if last_renew.elapsed() < self.config.renew_deadline => {
                    warn!(error = %e, "Failed to renew lease; retrying");
                    continue;
                }
                Ok(Err(e)) => format!("renew deadline exceeded: {e}"),
                Err(_) => "renew deadline exceeded".to_string(),
            };
            self.set_state(LeaderState::Demoting);
            warn!(reason = %reason, "Lost leadership");
            return Err(LeaderError::Lost(reason));
        }
    }

    /// Give the lease up so another replica can take over without waiting.
    pub async fn release(&self) {
        let Ok(Some(mut lease)) = self.api.get_opt(&self.config.lease_name).await else {
            return;
        };
        if !lease.spec.is_held_by(&self.config.identity) {
            return;
        }
        lease.spec.holder_identity = None;
        lease.spec.renew_time = Some(Utc::now());
        match self.api.update(&lease).await {
            Ok(_) => info!("Released lease"),
            Err(e) => warn!(error = %e, "Failed to release lease"),
        }
    }

    fn jittered_retry(&self) -> Duration {
        let base = self.config.retry_period;
        base + base.mul_f64(rand::rng().random_range(0.0..0.2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store::{MemoryStore, ObjectStore};
    use std::sync::Arc;

    fn elector(store: Arc<dyn ObjectStore>, identity: &str) -> LeaderElector {
        LeaderElector::new(Api::all(store), LeaderElectionConfig::new(identity)).unwrap()
    }

    #[test]
    fn test_config_rejects_deadline_past_duration() {
        let mut config = LeaderElectionConfig::new("a");
        config.renew_deadline = Duration::from_secs(14);
        assert!(matches!(config.validate(), Err(LeaderError::Config(_))));
        assert!(LeaderElectionConfig::new("a").validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_replica_creates_lease() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::default());
        let a = elector(store.clone(), "a");
        let b = elector(store.clone(), "b");

        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!b.try_acquire_or_renew().await.unwrap());
        // Renewal by the holder succeeds.
        assert!(a.try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_takeover_only_after_record_goes_stale() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::default());
        let a = elector(store.clone(), "a");
        let b = elector(store.clone(), "b");
        assert!(a.try_acquire_or_renew().await.unwrap());

        assert!(!b.try_acquire_or_renew().await.unwrap());
        tokio::time::advance(Duration::from_secs(14)).await;
        assert!(!b.try_acquire_or_renew().await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(b.try_acquire_or_renew().await.unwrap());

        let lease = Api::<Lease>::namespaced(store, "keel-system")
            .get("keel-control-plane")
            .await
            .unwrap();
        assert!(lease.spec.is_held_by("b"));
        assert_eq!(lease.spec.lease_transitions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_lease_is_free_immediately() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::default());
        let a = elector(store.clone(), "a");
        let b = elector(store.clone(), "b");
        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!b.try_acquire_or_renew().await.unwrap());

        a.release().await;
        assert!(b.try_acquire_or_renew().await.unwrap());
    }
}
