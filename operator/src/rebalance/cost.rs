use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::util::{clock::Clock, Error};
use crate::vpsie::VpsieApi;
use vpsie_types::NodeGroup;

/// Cache entries are considered fresh for this long.
pub const DEFAULT_COST_TTL: Duration = Duration::from_secs(15 * 60);

/// Hours used to project hourly prices to monthly savings.
pub const HOURS_PER_MONTH: f64 = 730.0;

/// Cached pricing for one offering. Entries are immutable once
/// written; expiry triggers a wholesale refetch.
#[derive(Clone, Debug, PartialEq)]
pub struct OfferingCost {
    pub offering_id: String,
    pub hourly_price: f64,
    pub cpu: i32,
    pub memory_mb: i64,
    pub disk_gb: i64,
    pub datacenter: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// A ranked savings comparison against the current offering.
#[derive(Clone, Debug, PartialEq)]
pub struct CostComparison {
    pub offering_id: String,
    pub hourly_saving: f64,
    pub monthly_saving: f64,
}

/// Constraints for [`CostCalculator::cheapest`].
#[derive(Clone, Debug, Default)]
pub struct CostConstraints {
    pub min_cpu: i32,
    pub min_memory_mb: i64,
    pub datacenter: Option<String>,
}

/// Per-offering pricing with a TTL cache in front of the cloud API.
/// The read path checks expiry while still holding the read lock; a
/// stale entry sends the caller through an async refresh guard that
/// re-checks before fetching, so contending readers trigger a single
/// refetch.
pub struct CostCalculator {
    api: Arc<dyn VpsieApi>,
    cache: RwLock<HashMap<String, OfferingCost>>,
    refresh_guard: Mutex<()>,
    ttl: ChronoDuration,
    clock: Arc<dyn Clock>,
}

impl CostCalculator {
    pub fn new(api: Arc<dyn VpsieApi>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        CostCalculator {
            api,
            cache: RwLock::new(HashMap::new()),
            refresh_guard: Mutex::new(()),
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::minutes(15)),
            clock,
        }
    }

    fn fresh(&self, entry: &OfferingCost) -> bool {
        self.clock.now() - entry.last_updated < self.ttl
    }

    /// Returns the cached cost of one offering, refreshing the whole
    /// price list when the entry is missing or expired.
    pub async fn offering_cost(&self, offering_id: &str) -> Result<OfferingCost, Error> {
        {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(offering_id) {
                if self.fresh(entry) {
                    return Ok(entry.clone());
                }
            }
        }
        self.refresh(Some(offering_id)).await?;
        self.cache
            .read()
            .get(offering_id)
            .cloned()
            .ok_or_else(|| Error::UserInputError(format!("unknown offering {}", offering_id)))
    }

    /// Returns all fresh offering costs, refreshing if anything is
    /// missing or stale.
    pub async fn all_costs(&self) -> Result<HashMap<String, OfferingCost>, Error> {
        {
            let cache = self.cache.read();
            if !cache.is_empty() && cache.values().all(|entry| self.fresh(entry)) {
                return Ok(cache.clone());
            }
        }
        self.refresh(None).await?;
        Ok(self.cache.read().clone())
    }

    async fn refresh(&self, wanted: Option<&str>) -> Result<(), Error> {
        let _guard = self.refresh_guard.lock().await;
        // Double-check under the guard: a contending caller may have
        // already refreshed while this one waited.
        {
            let cache = self.cache.read();
            match wanted {
                Some(id) => {
                    if cache.get(id).map(|e| self.fresh(e)).unwrap_or(false) {
                        return Ok(());
                    }
                }
                None => {
                    if !cache.is_empty() && cache.values().all(|e| self.fresh(e)) {
                        return Ok(());
                    }
                }
            }
        }
        let offerings = self.api.list_offerings().await.map_err(Error::from)?;
        let now = self.clock.now();
        let mut cache = self.cache.write();
        cache.clear();
        for offering in offerings {
            cache.insert(
                offering.id.clone(),
                OfferingCost {
                    offering_id: offering.id,
                    hourly_price: offering.hourly_price,
                    cpu: offering.cpu,
                    memory_mb: offering.memory_mb,
                    disk_gb: offering.disk_gb,
                    datacenter: offering.datacenter_id,
                    last_updated: now,
                },
            );
        }
        Ok(())
    }

    /// Sums the hourly cost of every node listed in the group status.
    pub async fn group_cost(&self, group: &NodeGroup) -> Result<f64, Error> {
        let mut total = 0.0;
        if let Some(nodes) = group.status.as_ref().and_then(|s| s.nodes.as_ref()) {
            for node in nodes {
                total += self.offering_cost(&node.offering).await?.hourly_price;
            }
        }
        Ok(total)
    }

    /// Ranks candidate offerings by the savings they realize against
    /// the current one, best first. Negative savings are kept so the
    /// caller sees the full picture.
    pub async fn compare(
        &self,
        current: &str,
        candidates: &[String],
    ) -> Result<Vec<CostComparison>, Error> {
        let current = self.offering_cost(current).await?;
        let mut comparisons = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let cost = self.offering_cost(candidate).await?;
            let hourly = current.hourly_price - cost.hourly_price;
            comparisons.push(CostComparison {
                offering_id: cost.offering_id,
                hourly_saving: hourly,
                monthly_saving: hourly * HOURS_PER_MONTH,
            });
        }
        comparisons.sort_by(|a, b| {
            b.monthly_saving
                .partial_cmp(&a.monthly_saving)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.offering_id.cmp(&b.offering_id))
        });
        Ok(comparisons)
    }

    /// Cheapest offering satisfying the constraints, if any.
    pub async fn cheapest(
        &self,
        constraints: &CostConstraints,
    ) -> Result<Option<OfferingCost>, Error> {
        let costs = self.all_costs().await?;
        let mut viable: Vec<OfferingCost> = costs
            .into_iter()
            .map(|(_, cost)| cost)
            .filter(|cost| {
                cost.cpu >= constraints.min_cpu
                    && cost.memory_mb >= constraints.min_memory_mb
                    && match constraints.datacenter.as_deref() {
                        Some(dc) => cost.datacenter.as_deref() == Some(dc) || cost.datacenter.is_none(),
                        None => true,
                    }
            })
            .collect();
        viable.sort_by(|a, b| {
            a.hourly_price
                .partial_cmp(&b.hourly_price)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.offering_id.cmp(&b.offering_id))
        });
        Ok(viable.into_iter().next())
    }
}
