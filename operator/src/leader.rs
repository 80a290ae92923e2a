use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::{api::ObjectMeta, Api, Client};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::util::{self, Error};

/// What this instance should do with the lease right now.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum LeaseDecision {
    /// No lease, or the holder's renewal expired: take it.
    Acquire,
    /// We hold the lease: extend it.
    Renew,
    /// Someone else holds a live lease: stay ready-not-active.
    Follow,
}

/// Lease-based leader election. At most one instance runs the control
/// loops per cluster; the rest stay ready so failover lands within one
/// lease interval.
pub struct LeaderElector {
    client: Client,
    namespace: String,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
}

impl LeaderElector {
    pub fn new(
        client: Client,
        namespace: String,
        lease_name: String,
        identity: String,
        lease_duration: Duration,
    ) -> Self {
        LeaderElector {
            client,
            namespace,
            lease_name,
            identity,
            lease_duration,
        }
    }

    /// Spawns the election loop. The receiver reflects the current
    /// leadership state; it starts as follower until the first tick.
    pub fn start(self) -> (watch::Receiver<bool>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);
        let interval = self.lease_duration / 3;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let is_leader = match self.tick().await {
                    Ok(is_leader) => is_leader,
                    Err(err) => {
                        warn!(error = %err, "leader election tick failed");
                        false
                    }
                };
                if *tx.borrow() != is_leader {
                    info!(leader = is_leader, identity = %self.identity, "leadership changed");
                }
                if tx.send(is_leader).is_err() {
                    return;
                }
            }
        });
        (rx, handle)
    }

    async fn tick(&self) -> Result<bool, Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();
        let current = match api.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(err) if util::is_not_found(&err) => None,
            Err(err) => return Err(err.into()),
        };

        let holder = current
            .as_ref()
            .and_then(|l| l.spec.as_ref())
            .and_then(|s| s.holder_identity.as_deref());
        let renew_time = current
            .as_ref()
            .and_then(|l| l.spec.as_ref())
            .and_then(|s| s.renew_time.as_ref())
            .map(|t| t.0);

        match decide(holder, renew_time, &self.identity, now, self.lease_duration) {
            LeaseDecision::Follow => Ok(false),
            LeaseDecision::Renew => {
                let mut lease = current.unwrap();
                if let Some(spec) = lease.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                match api.replace(&self.lease_name, &Default::default(), &lease).await {
                    Ok(_) => Ok(true),
                    // A conflict means another instance won a race on
                    // the lease object; fall back to follower for this
                    // tick rather than fighting.
                    Err(err) if util::is_conflict(&err) => Ok(false),
                    Err(err) => Err(err.into()),
                }
            }
            LeaseDecision::Acquire => match current {
                None => {
                    let lease = self.fresh_lease(now, 1);
                    match api.create(&Default::default(), &lease).await {
                        Ok(_) => Ok(true),
                        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                        Err(err) => Err(err.into()),
                    }
                }
                Some(mut lease) => {
                    let transitions = lease
                        .spec
                        .as_ref()
                        .and_then(|s| s.lease_transitions)
                        .unwrap_or(0);
                    lease.spec = Some(self.lease_spec(now, transitions + 1));
                    match api.replace(&self.lease_name, &Default::default(), &lease).await {
                        Ok(_) => Ok(true),
                        Err(err) if util::is_conflict(&err) => Ok(false),
                        Err(err) => Err(err.into()),
                    }
                }
            },
        }
    }

    fn fresh_lease(&self, now: DateTime<Utc>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, transitions)),
        }
    }

    fn lease_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            lease_transitions: Some(transitions),
        }
    }
}

/// Pure decision over the observed lease state.
pub(crate) fn decide(
    holder: Option<&str>,
    renew_time: Option<DateTime<Utc>>,
    identity: &str,
    now: DateTime<Utc>,
    lease_duration: Duration,
) -> LeaseDecision {
    let holder = match holder {
        None => return LeaseDecision::Acquire,
        Some(holder) => holder,
    };
    if holder == identity {
        return LeaseDecision::Renew;
    }
    let ttl = ChronoDuration::from_std(lease_duration).unwrap_or_else(|_| ChronoDuration::seconds(15));
    match renew_time {
        Some(renewed) if now.signed_duration_since(renewed) <= ttl => {
            debug!(%holder, "following live leader");
            LeaseDecision::Follow
        }
        _ => LeaseDecision::Acquire,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    const TTL: Duration = Duration::from_secs(15);

    #[test]
    fn missing_lease_is_acquired() {
        assert_eq!(decide(None, None, "me", at("2026-03-01T00:00:00Z"), TTL), LeaseDecision::Acquire);
    }

    #[test]
    fn own_lease_is_renewed() {
        assert_eq!(
            decide(Some("me"), Some(at("2026-03-01T00:00:00Z")), "me", at("2026-03-01T00:00:05Z"), TTL),
            LeaseDecision::Renew
        );
    }

    #[test]
    fn live_foreign_lease_is_followed() {
        assert_eq!(
            decide(Some("other"), Some(at("2026-03-01T00:00:00Z")), "me", at("2026-03-01T00:00:10Z"), TTL),
            LeaseDecision::Follow
        );
    }

    #[test]
    fn expired_foreign_lease_is_taken_over() {
        assert_eq!(
            decide(Some("other"), Some(at("2026-03-01T00:00:00Z")), "me", at("2026-03-01T00:00:20Z"), TTL),
            LeaseDecision::Acquire
        );
        // A foreign lease that never renewed is also up for grabs.
        assert_eq!(
            decide(Some("other"), None, "me", at("2026-03-01T00:00:00Z"), TTL),
            LeaseDecision::Acquire
        );
    }
}
