use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::config::{PriorityWeights, QueueConfig, SchoolQueuePolicy};
use crate::types::SchoolId;

use super::job::JobPriority;

/// Permission for one worker to try leasing a job of `school_id` at
/// `priority`. Must be confirmed or cancelled.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SchedulingReservation {
    pub id: Uuid,
    pub school_id: SchoolId,
    pub priority: JobPriority,
}

/// Number of leasable jobs a school has in one priority band.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadyCountEntry {
    pub school_id: SchoolId,
    pub priority: JobPriority,
    pub count: usize,
}

/// Work a school currently holds: leased jobs plus outstanding reservations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchoolLoad {
    pub inflight: usize,
    pub reserved: usize,
}

#[derive(Debug)]
struct Tenancy {
    cap: usize,
    weight: i64,
    load: SchoolLoad,
}

impl Tenancy {
    fn has_room(&self) -> bool {
        self.load.inflight + self.load.reserved < self.cap
    }
}

#[derive(Debug, Default)]
struct Ledger {
    tenants: HashMap<SchoolId, Tenancy>,
    /// Smooth weighted round robin credit per band.
    credit: HashMap<(SchoolId, JobPriority), i64>,
    /// Reservations not yet confirmed, so two workers do not chase one job.
    claimed: HashMap<(SchoolId, JobPriority), usize>,
    outstanding: HashMap<Uuid, (SchoolId, JobPriority)>,
    cursor: usize,
}

/// Shares one queue's workers between schools.
///
/// Priority bands are visited along a ring in which each band appears as often
/// as its weight, so urgent work dominates without starving the rest. Within a
/// band, schools are picked by smooth weighted round robin and skipped while
/// they are at their in-flight cap.
///
/// The scheduler does not track queue contents itself: callers pass the
/// queue's current ready counts to [`reserve`](Self::reserve).
#[derive(Clone)]
pub struct WeightedFairScheduler {
    default_cap: usize,
    default_weight: u32,
    policies: Arc<HashMap<SchoolId, SchoolQueuePolicy>>,
    ring: Arc<[JobPriority]>,
    ledger: Arc<Mutex<Ledger>>,
}

impl fmt::Debug for WeightedFairScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ledger = self.ledger.lock();
        f.debug_struct("WeightedFairScheduler")
            .field("default_cap", &self.default_cap)
            .field("default_weight", &self.default_weight)
            .field("ring", &self.ring)
            .field("schools", &ledger.tenants.len())
            .field("outstanding", &ledger.outstanding.len())
            .finish()
    }
}

impl WeightedFairScheduler {
    pub fn new(config: &QueueConfig, priority_weights: PriorityWeights) -> Self {
        let ring: Vec<JobPriority> = JobPriority::all()
            .iter()
            .flat_map(|band| {
                std::iter::repeat_n(*band, usize::from(band.weight(&priority_weights).max(1)))
            })
            .collect();
        Self {
            default_cap: config.default_school_cap.max(1),
            default_weight: config.default_school_weight.max(1),
            policies: Arc::new(config.school_overrides.clone()),
            ring: ring.into(),
            ledger: Arc::new(Mutex::new(Ledger::default())),
        }
    }

    fn tenancy(&self, school_id: SchoolId) -> Tenancy {
        let policy = self.policies.get(&school_id);
        Tenancy {
            cap: policy
                .and_then(|p| p.max_inflight)
                .unwrap_or(self.default_cap)
                .max(1),
            weight: i64::from(
                policy
                    .and_then(|p| p.weight)
                    .unwrap_or(self.default_weight)
                    .max(1),
            ),
            load: SchoolLoad::default(),
        }
    }

    /// Picks the next (school, priority) to serve out of `ready`.
    pub fn reserve(&self, ready: &[ReadyCountEntry]) -> Option<SchedulingReservation> {
        let mut ledger = self.ledger.lock();
        for _ in 0..self.ring.len() {
            let band = self.ring[ledger.cursor % self.ring.len()];
            ledger.cursor = (ledger.cursor + 1) % self.ring.len();

            let mut candidates: Vec<SchoolId> = Vec::new();
            for entry in ready.iter().filter(|entry| entry.priority == band) {
                let claimed = ledger
                    .claimed
                    .get(&(entry.school_id, band))
                    .copied()
                    .unwrap_or(0);
                if entry.count <= claimed {
                    continue;
                }
                let tenancy = ledger
                    .tenants
                    .entry(entry.school_id)
                    .or_insert_with(|| self.tenancy(entry.school_id));
                if tenancy.has_room() {
                    candidates.push(entry.school_id);
                }
            }
            if candidates.is_empty() {
                continue;
            }
            candidates.sort();

            let mut total = 0i64;
            let mut best: Option<(SchoolId, i64)> = None;
            for school_id in candidates {
                let weight = ledger.tenants.get(&school_id).map_or(1, |t| t.weight);
                let credit = ledger.credit.entry((school_id, band)).or_insert(0);
                *credit += weight;
                total += weight;
                if best.is_none_or(|(_, top)| *credit > top) {
                    best = Some((school_id, *credit));
                }
            }
            let (school_id, _) = best?;
            if let Some(credit) = ledger.credit.get_mut(&(school_id, band)) {
                *credit -= total;
            }
            *ledger.claimed.entry((school_id, band)).or_insert(0) += 1;
            if let Some(tenancy) = ledger.tenants.get_mut(&school_id) {
                tenancy.load.reserved += 1;
            }
            let id = Uuid::now_v7();
            ledger.outstanding.insert(id, (school_id, band));
            return Some(SchedulingReservation {
                id,
                school_id,
                priority: band,
            });
        }
        None
    }

    fn settle(&self, reservation_id: Uuid, leased: bool) -> Option<(SchoolId, JobPriority)> {
        let mut ledger = self.ledger.lock();
        let (school_id, band) = ledger.outstanding.remove(&reservation_id)?;
        if let Some(claimed) = ledger.claimed.get_mut(&(school_id, band)) {
            *claimed = claimed.saturating_sub(1);
            if *claimed == 0 {
                ledger.claimed.remove(&(school_id, band));
            }
        }
        if let Some(tenancy) = ledger.tenants.get_mut(&school_id) {
            tenancy.load.reserved = tenancy.load.reserved.saturating_sub(1);
            if leased {
                tenancy.load.inflight += 1;
            }
        }
        Some((school_id, band))
    }

    /// The reserved job was leased; it now counts against the school's cap.
    pub fn confirm(&self, reservation_id: Uuid) -> bool {
        self.settle(reservation_id, true).is_some()
    }

    /// Nothing matching the reservation could be leased.
    pub fn cancel(&self, reservation_id: Uuid) {
        self.settle(reservation_id, false);
    }

    /// A confirmed job finished (in any outcome).
    pub fn release(&self, school_id: SchoolId) {
        let mut ledger = self.ledger.lock();
        let idle = match ledger.tenants.get_mut(&school_id) {
            Some(tenancy) => {
                tenancy.load.inflight = tenancy.load.inflight.saturating_sub(1);
                tenancy.load.inflight == 0 && tenancy.load.reserved == 0
            }
            None => false,
        };
        if idle {
            ledger.tenants.remove(&school_id);
            ledger.credit.retain(|(school, _), _| *school != school_id);
        }
    }

    pub fn load(&self) -> HashMap<SchoolId, SchoolLoad> {
        self.ledger
            .lock()
            .tenants
            .iter()
            .map(|(school_id, tenancy)| (*school_id, tenancy.load))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(cap: usize) -> WeightedFairScheduler {
        let config = QueueConfig {
            default_school_cap: cap,
            ..QueueConfig::default()
        };
        WeightedFairScheduler::new(&config, PriorityWeights::default())
    }

    fn ready(school_id: SchoolId, priority: JobPriority, count: usize) -> ReadyCountEntry {
        ReadyCountEntry {
            school_id,
            priority,
            count,
        }
    }

    #[test]
    fn school_cap_limits_reservations_until_release() {
        let scheduler = scheduler(1);
        let school = SchoolId::new();
        let counts = [ready(school, JobPriority::P2, 3)];

        let first = scheduler.reserve(&counts).unwrap();
        assert!(scheduler.reserve(&counts).is_none());

        assert!(scheduler.confirm(first.id));
        assert!(scheduler.reserve(&counts).is_none());

        scheduler.release(school);
        assert!(scheduler.reserve(&counts).is_some());
    }

    #[test]
    fn equal_weights_alternate_between_schools() {
        let scheduler = scheduler(64);
        let a = SchoolId::new();
        let b = SchoolId::new();
        let counts = [ready(a, JobPriority::P2, 10), ready(b, JobPriority::P2, 10)];

        let mut picks = Vec::new();
        for _ in 0..6 {
            let reservation = scheduler.reserve(&counts).unwrap();
            scheduler.confirm(reservation.id);
            picks.push(reservation.school_id);
        }
        assert_eq!(picks.iter().filter(|id| **id == a).count(), 3);
        assert!(picks.windows(2).all(|pair| pair[0] != pair[1]));
    }

    #[test]
    fn heavier_school_gets_proportional_share() {
        let heavy = SchoolId::new();
        let light = SchoolId::new();
        let mut config = QueueConfig {
            default_school_cap: 64,
            ..QueueConfig::default()
        };
        config.school_overrides.insert(
            heavy,
            SchoolQueuePolicy {
                max_inflight: None,
                weight: Some(3),
            },
        );
        let scheduler = WeightedFairScheduler::new(&config, PriorityWeights::default());
        let counts = [
            ready(heavy, JobPriority::P1, 100),
            ready(light, JobPriority::P1, 100),
        ];

        let mut heavy_picks = 0;
        for _ in 0..8 {
            let reservation = scheduler.reserve(&counts).unwrap();
            scheduler.confirm(reservation.id);
            if reservation.school_id == heavy {
                heavy_picks += 1;
            }
        }
        assert_eq!(heavy_picks, 6);
    }

    #[test]
    fn outstanding_reservations_cover_the_ready_count() {
        let scheduler = scheduler(8);
        let school = SchoolId::new();
        let counts = [ready(school, JobPriority::P0, 1)];

        let reservation = scheduler.reserve(&counts).unwrap();
        assert_eq!(reservation.priority, JobPriority::P0);
        assert!(scheduler.reserve(&counts).is_none());

        scheduler.cancel(reservation.id);
        assert_eq!(
            scheduler.load()[&school],
            SchoolLoad {
                inflight: 0,
                reserved: 0
            }
        );
        assert!(scheduler.reserve(&counts).is_some());
    }

    #[test]
    fn lower_bands_are_served_when_urgent_work_exists() {
        let scheduler = scheduler(64);
        let school = SchoolId::new();
        let counts = [
            ready(school, JobPriority::P0, 100),
            ready(school, JobPriority::P3, 100),
        ];

        let mut low = 0;
        for _ in 0..15 {
            let reservation = scheduler.reserve(&counts).unwrap();
            scheduler.confirm(reservation.id);
            if reservation.priority == JobPriority::P3 {
                low += 1;
            }
        }
        assert!(low >= 1);
        assert!(low < 8);
    }
}
