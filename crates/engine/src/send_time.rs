//! Engagement clock. Resolves `optimal_send_time` delay nodes against a
//! store's historical hourly engagement profile.

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use flowline_core::types::StoreId;

/// Per-store hourly engagement rates, refreshed by the analytics pipeline.
/// Read-only to the engine; staleness only degrades delay timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementProfile {
    pub store_id: StoreId,
    /// Engagement rate per UTC hour of day, all non-negative.
    pub hourly_rates: [f32; 24],
    /// Minimum rate an hour must reach to qualify. `None` means only the
    /// profile's best hours qualify.
    pub rate_threshold: Option<f32>,
}

impl EngagementProfile {
    pub fn new(store_id: StoreId, hourly_rates: [f32; 24]) -> Self {
        Self {
            store_id,
            hourly_rates,
            rate_threshold: None,
        }
    }

    /// Profile with no signal; the clock degrades to "send immediately".
    pub fn flat(store_id: StoreId) -> Self {
        Self::new(store_id, [0.0; 24])
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.rate_threshold = Some(threshold);
        self
    }

    /// The effective qualifying rate: the configured threshold, or the
    /// profile's maximum rate.
    pub fn threshold(&self) -> f32 {
        match self.rate_threshold {
            Some(t) => t,
            None => self.hourly_rates.iter().copied().fold(0.0f32, f32::max),
        }
    }
}

/// First timestamp at or after `earliest_allowed` whose hour of day meets
/// the profile's threshold, scanning forward up to `horizon_days` calendar
/// days. Ties between equally rated hours resolve to the earliest. A
/// profile that never qualifies (flat or with an unreachable threshold)
/// yields `earliest_allowed` unchanged, so the clock always terminates.
///
/// Pure function: idempotent, and monotonic in `earliest_allowed`.
pub fn next_optimal_time(
    profile: &EngagementProfile,
    earliest_allowed: DateTime<Utc>,
    horizon_days: u32,
) -> DateTime<Utc> {
    let threshold = profile.threshold();
    if threshold <= 0.0 {
        return earliest_allowed;
    }

    let start = earliest_allowed
        .duration_trunc(Duration::hours(1))
        .unwrap_or(earliest_allowed);
    let horizon_hours = i64::from(horizon_days) * 24;
    for offset in 0..=horizon_hours {
        let slot = start + Duration::hours(offset);
        if profile.hourly_rates[slot.hour() as usize] >= threshold {
            // The first slot is the floor of the earliest allowed time;
            // never return into the past.
            return slot.max(earliest_allowed);
        }
    }
    earliest_allowed
}

/// Source of engagement profiles, keyed by store.
#[async_trait]
pub trait ProfileProvider: Send + Sync {
    async fn profile(&self, store_id: &StoreId) -> Option<EngagementProfile>;
}

/// In-memory profile table for tests and the demo binary.
#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: DashMap<StoreId, EngagementProfile>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, profile: EngagementProfile) {
        self.profiles.insert(profile.store_id.clone(), profile);
    }
}

#[async_trait]
impl ProfileProvider for MemoryProfileStore {
    async fn profile(&self, store_id: &StoreId) -> Option<EngagementProfile> {
        self.profiles.get(store_id).map(|p| p.clone())
    }
}
