//! Resolves real-time trip descriptors to scheduled trips.
//!
//! Every lookup stage is memoized for the lifetime of one [`TripMatcher`].
//! Cache entries are `OnceCell`s so that concurrent lookups of the same key
//! share a single store read.

use std::collections::BTreeSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use cached::{Cached, SizedCache};
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{MatchError, StoreError};
use crate::model::{ScheduledTrip, TransitSystem, TripDescriptor, VehiclePosition};
use crate::store::StaticScheduleStore;
use crate::trip_id::TripId;

pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

type Slot<V> = Arc<OnceCell<V>>;
type Lru<K, V> = Mutex<SizedCache<K, Slot<V>>>;

fn slot<K, V>(cache: &Lru<K, V>, key: K) -> Slot<V>
where
    K: Hash + Eq + Clone,
{
    let mut guard = cache.lock().unwrap_or_else(PoisonError::into_inner);
    guard
        .cache_get_or_set_with(key, || Arc::new(OnceCell::new()))
        .clone()
}

pub struct TripMatcher {
    system: TransitSystem,
    store: Arc<dyn StaticScheduleStore>,
    descriptors: Lru<TripDescriptor, Option<ScheduledTrip>>,
    trips: Lru<String, Option<ScheduledTrip>>,
    stop_sequences: Lru<(String, u32), Option<String>>,
    stops: DashMap<String, Slot<bool>>,
}

impl TripMatcher {
    pub fn new(system: TransitSystem, store: Arc<dyn StaticScheduleStore>) -> Self {
        Self::with_capacity(system, store, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(
        system: TransitSystem,
        store: Arc<dyn StaticScheduleStore>,
        capacity: usize,
    ) -> Self {
        Self {
            system,
            store,
            descriptors: Mutex::new(SizedCache::with_size(capacity)),
            trips: Mutex::new(SizedCache::with_size(capacity)),
            stop_sequences: Mutex::new(SizedCache::with_size(capacity)),
            stops: DashMap::new(),
        }
    }

    pub fn system(&self) -> TransitSystem {
        self.system
    }

    /// Scheduled trip for a real-time descriptor, or `None` when there is no
    /// unambiguous match.
    ///
    /// A trip id that does not follow the compound grammar is an error, not a
    /// miss.
    pub async fn resolve(
        &self,
        descriptor: &TripDescriptor,
    ) -> Result<Option<ScheduledTrip>, MatchError> {
        let cell = slot(&self.descriptors, descriptor.clone());
        let trip = cell
            .get_or_try_init(|| self.resolve_uncached(descriptor))
            .await?;
        Ok(trip.clone())
    }

    async fn resolve_uncached(
        &self,
        descriptor: &TripDescriptor,
    ) -> Result<Option<ScheduledTrip>, MatchError> {
        if let Some(trip) = self.trip_by_id(&descriptor.trip_id).await? {
            return Ok(Some(trip));
        }
        if !self.system.uses_compound_trip_ids() {
            return Ok(None);
        }

        let parsed = TripId::parse(&descriptor.trip_id)?;
        let service_day = parsed.service_day_on(&descriptor.trip_id, descriptor.service_date)?;

        // Most specific key first; the bare key is only a fallback
        for short_id in parsed.short_ids() {
            let trip_ids: BTreeSet<String> = self
                .store
                .alternate_trip_ids(self.system, &short_id, service_day)
                .await?
                .into_iter()
                .collect();

            let mut candidates = trip_ids.into_iter();
            match (candidates.next(), candidates.next()) {
                (None, _) => continue,
                (Some(trip_id), None) => return Ok(self.trip_by_id(&trip_id).await?),
                (Some(_), Some(_)) => {
                    info!(
                        trip_id = %descriptor.trip_id,
                        short_id = %short_id,
                        service_date = %descriptor.service_date,
                        %service_day,
                        "Multiple scheduled trips match real-time trip id"
                    );
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    pub async fn trip_by_id(&self, trip_id: &str) -> Result<Option<ScheduledTrip>, StoreError> {
        let cell = slot(&self.trips, trip_id.to_string());
        let trip = cell
            .get_or_try_init(|| self.store.trip_by_id(self.system, trip_id))
            .await?;
        Ok(trip.clone())
    }

    pub async fn stop_exists(&self, stop_id: &str) -> Result<bool, StoreError> {
        let cell = self.stops.entry(stop_id.to_string()).or_default().clone();
        let exists = cell
            .get_or_try_init(|| self.store.stop_exists(self.system, stop_id))
            .await?;
        Ok(*exists)
    }

    pub async fn stop_id_from_sequence(
        &self,
        trip_id: &str,
        stop_sequence: u32,
    ) -> Result<Option<String>, StoreError> {
        let cell = slot(&self.stop_sequences, (trip_id.to_string(), stop_sequence));
        let stop_id = cell
            .get_or_try_init(|| {
                self.store
                    .stop_id_from_sequence(self.system, trip_id, stop_sequence)
            })
            .await?;
        Ok(stop_id.clone())
    }

    /// Stop a vehicle is at or heading to, if it can be determined and exists
    /// in the stop table.
    pub async fn locate_vehicle(
        &self,
        position: &VehiclePosition,
    ) -> Result<Option<String>, MatchError> {
        let stop_id = match (&position.stop_id, position.current_stop_sequence) {
            (Some(stop_id), _) => Some(stop_id.clone()),
            (None, Some(sequence)) if self.system.trusts_stop_sequences() => {
                match self.resolve(&position.trip).await? {
                    Some(trip) => self.stop_id_from_sequence(&trip.trip_id, sequence).await?,
                    None => None,
                }
            }
            (None, _) => None,
        };

        let Some(stop_id) = stop_id else {
            return Ok(None);
        };
        if self.stop_exists(&stop_id).await? {
            Ok(Some(stop_id))
        } else {
            debug!(%stop_id, trip_id = %position.trip.trip_id, "Vehicle stop not in schedule");
            Ok(None)
        }
    }
}
