//! Core domain model for BoatWatch: regions, raw device observations, merged
//! boat records and the persisted row shape served to the map client.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "boatwatch-core";

/// Layout used for `datetime` on the wire and in CLI output.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One upstream partition ("atoll") of the tracking feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub id: u32,
    pub code: String,
}

impl Region {
    pub fn new(id: u32, code: impl Into<String>) -> Self {
        Self {
            id,
            code: code.into(),
        }
    }
}

/// A single device as decoded from one region response.
///
/// Every optional field distinguishes "absent" from a real value: an empty
/// upstream string decodes to `None`, never to zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawDeviceRecord {
    pub external_id: String,
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed_knots: Option<f64>,
    pub heading_degrees: Option<i32>,
    /// Upstream-native timestamp text (numeric epoch or free text).
    pub observed_at: Option<String>,
    pub contact: Option<String>,
    pub boat_type: Option<String>,
}

/// Region codes a boat was observed in, in first-seen order, without duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AtollSet(Vec<String>);

impl AtollSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with_first(code: impl Into<String>) -> Self {
        Self(vec![code.into()])
    }

    /// Appends `code` unless already present. Returns whether it was added.
    pub fn insert(&mut self, code: &str) -> bool {
        if self.contains(code) {
            return false;
        }
        self.0.push(code.to_string());
        true
    }

    pub fn contains(&self, code: &str) -> bool {
        self.0.iter().any(|c| c == code)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Comma-joined form stored in the `atolls` column.
    pub fn joined(&self) -> String {
        self.0.join(",")
    }
}

/// Canonical merged boat for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoatRecord {
    pub boat_id: String,
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed_knots: Option<f64>,
    pub heading_degrees: Option<i32>,
    pub observed_at: Option<DateTime<Utc>>,
    pub contact: Option<String>,
    pub atolls: AtollSet,
    pub boat_type: Option<String>,
}

impl BoatRecord {
    pub fn to_row(&self) -> BoatRow {
        BoatRow {
            boat_id: self.boat_id.clone(),
            name: self.name.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            speed: self.speed_knots,
            heading: self.heading_degrees,
            datetime: self.observed_at,
            contact: self.contact.clone(),
            atolls: self.atolls.joined(),
            boat_type: self.boat_type.clone(),
        }
    }
}

/// Merged boats keyed by `boat_id`. Iteration order is the key order, so two
/// registries built from the same input serialize identically.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoatRegistry {
    boats: BTreeMap<String, BoatRecord>,
}

impl BoatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: BoatRecord) -> Option<BoatRecord> {
        self.boats.insert(record.boat_id.clone(), record)
    }

    pub fn get(&self, boat_id: &str) -> Option<&BoatRecord> {
        self.boats.get(boat_id)
    }

    pub fn len(&self) -> usize {
        self.boats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boats.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoatRecord> {
        self.boats.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BoatRecord> {
        self.boats.values_mut()
    }

    pub fn to_rows(&self) -> Vec<BoatRow> {
        self.boats.values().map(BoatRecord::to_row).collect()
    }
}

/// Persisted row shape, also the payload of the read API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoatRow {
    pub boat_id: String,
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<i32>,
    #[serde(with = "row_datetime")]
    pub datetime: Option<DateTime<Utc>>,
    pub contact: Option<String>,
    pub atolls: String,
    #[serde(rename = "type")]
    pub boat_type: Option<String>,
}

mod row_datetime {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    use super::DATETIME_FORMAT;

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&ts.format(DATETIME_FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(text) => NaiveDateTime::parse_from_str(&text, DATETIME_FORMAT)
                .map(|naive| Some(naive.and_utc()))
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

const NAIVE_DATETIME_LAYOUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
];

/// Normalizes an upstream timestamp.
///
/// Numeric text is epoch seconds; other text is parsed as a calendar timestamp
/// (UTC when no offset is given). Anything unparseable is `None`: a missing
/// timestamp is reported as unknown, never replaced by the current time.
pub fn normalize_observed_at(raw: &str) -> Option<DateTime<Utc>> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(number) = text.parse::<f64>() {
        if !number.is_finite() {
            return None;
        }
        return DateTime::from_timestamp(number.trunc() as i64, 0);
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for layout in NAIVE_DATETIME_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, layout) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
