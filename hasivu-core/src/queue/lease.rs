use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    job::{JobPriority, JobRecord, QueueName},
    scheduler::SchedulingReservation,
};
use crate::types::{LeaseId, SchoolId};

/// A job handed to one worker until `expires_at`, unless renewed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobLease {
    pub lease_id: LeaseId,
    pub job: JobRecord,
    pub lease_owner: String,
    pub expires_at: DateTime<Utc>,
    pub renewals: u32,
}

impl JobLease {
    /// Time left before the housekeeper may reclaim the job; zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        (self.expires_at - now).max(chrono::Duration::zero())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Ask for the next job of `queue`, optionally pinned to one school and band.
#[derive(Clone, Debug)]
pub struct DequeueRequest {
    pub queue: QueueName,
    pub worker_id: String,
    pub lease_ttl: chrono::Duration,
    pub selector: Option<QueueSelector>,
}

impl DequeueRequest {
    pub fn any(queue: QueueName, worker_id: impl Into<String>, lease_ttl: chrono::Duration) -> Self {
        Self {
            queue,
            worker_id: worker_id.into(),
            lease_ttl,
            selector: None,
        }
    }

    pub fn reserved(mut self, reservation: &SchedulingReservation) -> Self {
        self.selector = Some(QueueSelector::from(reservation));
        self
    }
}

/// Only jobs of this school at exactly this priority match.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueSelector {
    pub school_id: SchoolId,
    pub priority: JobPriority,
}

impl QueueSelector {
    pub fn matches(&self, job: &JobRecord) -> bool {
        job.school_id == self.school_id && job.priority == self.priority
    }
}

impl From<&SchedulingReservation> for QueueSelector {
    fn from(reservation: &SchedulingReservation) -> Self {
        Self {
            school_id: reservation.school_id,
            priority: reservation.priority,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LeaseRenewal {
    pub lease_id: LeaseId,
    pub worker_id: String,
    pub extend_by: chrono::Duration,
}
