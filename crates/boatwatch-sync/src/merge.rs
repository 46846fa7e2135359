//! Folds per-region device lists into one record per boat.

use std::collections::BTreeMap;

use boatwatch_core::{
    normalize_observed_at, AtollSet, BoatRecord, BoatRegistry, RawDeviceRecord, Region,
};
use tracing::debug;

/// Accumulates decoded regions in configured order.
///
/// The first sighting of a boat seeds its record. Later sightings overwrite a
/// field only when they carry a non-empty value for it, and append their
/// region code to the boat's atolls. Timestamps are merged as upstream text
/// and normalized once in [`BoatMerger::finish`].
#[derive(Debug, Default)]
pub struct BoatMerger {
    boats: BTreeMap<String, PendingBoat>,
    skipped: usize,
}

#[derive(Debug)]
struct PendingBoat {
    record: BoatRecord,
    observed_at_raw: Option<String>,
}

impl BoatMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fold_region(&mut self, region: &Region, records: &[RawDeviceRecord]) {
        for record in records {
            self.fold_record(&region.code, record);
        }
    }

    pub fn fold_record(&mut self, region_code: &str, record: &RawDeviceRecord) {
        let boat_id = record.external_id.trim();
        if boat_id.is_empty() {
            self.skipped += 1;
            return;
        }

        match self.boats.get_mut(boat_id) {
            Some(PendingBoat {
                record: existing,
                observed_at_raw,
            }) => {
                existing.atolls.insert(region_code);
                override_text(&mut existing.name, &record.name);
                override_value(&mut existing.latitude, record.latitude);
                override_value(&mut existing.longitude, record.longitude);
                override_value(&mut existing.speed_knots, record.speed_knots);
                override_value(&mut existing.heading_degrees, record.heading_degrees);
                override_text(observed_at_raw, &record.observed_at);
                override_text(&mut existing.contact, &record.contact);
                override_text(&mut existing.boat_type, &record.boat_type);
            }
            None => {
                self.boats.insert(
                    boat_id.to_string(),
                    PendingBoat {
                        record: BoatRecord {
                            boat_id: boat_id.to_string(),
                            name: text_or_none(&record.name),
                            latitude: record.latitude,
                            longitude: record.longitude,
                            speed_knots: record.speed_knots,
                            heading_degrees: record.heading_degrees,
                            observed_at: None,
                            contact: text_or_none(&record.contact),
                            atolls: AtollSet::with_first(region_code),
                            boat_type: text_or_none(&record.boat_type),
                        },
                        observed_at_raw: text_or_none(&record.observed_at),
                    },
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.boats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boats.is_empty()
    }

    pub fn finish(self) -> BoatRegistry {
        if self.skipped > 0 {
            debug!(skipped = self.skipped, "dropped devices without an id");
        }
        let mut registry = BoatRegistry::new();
        for PendingBoat {
            mut record,
            observed_at_raw,
        } in self.boats.into_values()
        {
            // unparseable text ends up unknown, never "now"
            record.observed_at = observed_at_raw.as_deref().and_then(normalize_observed_at);
            registry.insert(record);
        }
        registry
    }
}

/// Merges `(region, records)` pairs in the order given.
pub fn merge_regions<'a, I>(decoded: I) -> BoatRegistry
where
    I: IntoIterator<Item = (&'a Region, &'a [RawDeviceRecord])>,
{
    let mut merger = BoatMerger::new();
    for (region, records) in decoded {
        merger.fold_region(region, records);
    }
    merger.finish()
}

fn override_value<T>(slot: &mut Option<T>, value: Option<T>) {
    if let Some(value) = value {
        *slot = Some(value);
    }
}

fn override_text(slot: &mut Option<String>, value: &Option<String>) {
    override_value(slot, text_or_none(value));
}

fn text_or_none(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
