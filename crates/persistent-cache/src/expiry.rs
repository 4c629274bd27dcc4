//! Expiration policy
//!
//! `created_at + ttl` is the only liveness boundary. The current time is
//! always passed in so decisions are deterministic.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

use crate::codec::RecordHeader;
use crate::types::CacheRecord;

/// Instant at which a record stops being live. `None` means never, either
/// because there is no TTL or because the deadline is beyond chrono's range.
pub fn expires_at(created_at: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = TimeDelta::from_std(ttl?).ok()?;
    created_at.checked_add_signed(ttl)
}

pub fn is_expired_at(created_at: DateTime<Utc>, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
    match expires_at(created_at, ttl) {
        Some(deadline) => now >= deadline,
        None => false,
    }
}

pub fn is_expired(record: &CacheRecord, now: DateTime<Utc>) -> bool {
    is_expired_at(record.created_at, record.ttl, now)
}

impl RecordHeader {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        is_expired_at(self.created_at, self.ttl, now)
    }
}
