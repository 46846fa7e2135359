//! Upstream feed decoding and the static boat type lookup table.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use boatwatch_core::{RawDeviceRecord, Region};
use boatwatch_storage::{FetchedResponse, StatusCode};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "boatwatch-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("HTTP {0}")]
    HttpStatus(u16),
    #[error("bad json/devices")]
    BadDevices,
    #[error("invalid CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("{0}")]
    Message(String),
}

/// Decodes one region's response into raw device records.
pub trait FeedAdapter: Send + Sync {
    fn feed_id(&self) -> &'static str;

    fn parse_region(
        &self,
        region: &Region,
        response: &FetchedResponse,
    ) -> Result<Vec<RawDeviceRecord>, AdapterError>;
}

/// The tracking API's `devices` envelope with two-letter field keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbbreviatedDeviceFeed;

impl FeedAdapter for AbbreviatedDeviceFeed {
    fn feed_id(&self) -> &'static str {
        "followme-devices"
    }

    fn parse_region(
        &self,
        region: &Region,
        response: &FetchedResponse,
    ) -> Result<Vec<RawDeviceRecord>, AdapterError> {
        if response.status != StatusCode::OK {
            return Err(AdapterError::HttpStatus(response.status.as_u16()));
        }
        let records = parse_devices(&response.body)?;
        debug!(atoll = %region.code, devices = records.len(), "decoded region devices");
        Ok(records)
    }
}

/// Per-device payload. Keys are fixed by the third party; values arrive as
/// numbers, numeric strings or empty strings, so they stay loose until
/// converted.
#[derive(Debug, Default, Deserialize)]
struct WireDevice {
    #[serde(default)]
    id: Option<JsonValue>,
    #[serde(default)]
    na: Option<JsonValue>,
    #[serde(default)]
    la: Option<JsonValue>,
    #[serde(default)]
    lo: Option<JsonValue>,
    #[serde(default)]
    sp: Option<JsonValue>,
    #[serde(default)]
    he: Option<JsonValue>,
    #[serde(default)]
    dt: Option<JsonValue>,
    #[serde(default)]
    co: Option<JsonValue>,
    #[serde(default)]
    ty: Option<JsonValue>,
}

impl WireDevice {
    /// `fallback_id` is the upstream key the device was listed under; it is
    /// used only when the record carries no `id` of its own.
    fn into_record(self, fallback_id: Option<&str>) -> Option<RawDeviceRecord> {
        let external_id = loose_text(self.id.as_ref())
            .or_else(|| fallback_id.map(str::trim).filter(|k| !k.is_empty()).map(str::to_string))?;

        Some(RawDeviceRecord {
            external_id,
            name: loose_text(self.na.as_ref()),
            latitude: loose_f64(self.la.as_ref()),
            longitude: loose_f64(self.lo.as_ref()),
            speed_knots: loose_f64(self.sp.as_ref()),
            heading_degrees: loose_i32(self.he.as_ref()),
            observed_at: loose_text(self.dt.as_ref()),
            contact: loose_text(self.co.as_ref()),
            boat_type: loose_text(self.ty.as_ref()),
        })
    }
}

fn loose_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn loose_f64(value: Option<&JsonValue>) -> Option<f64> {
    let number = match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn loose_i32(value: Option<&JsonValue>) -> Option<i32> {
    let truncated = loose_f64(value)?.trunc();
    (truncated >= f64::from(i32::MIN) && truncated <= f64::from(i32::MAX)).then(|| truncated as i32)
}

/// Decodes a response body into device records.
///
/// The body must be a JSON object whose `devices` member is a non-empty
/// object or list; anything else, including a collection with no usable
/// device, is a region failure rather than an empty region. Records come
/// back in feed order.
pub fn parse_devices(body: &[u8]) -> Result<Vec<RawDeviceRecord>, AdapterError> {
    let value: JsonValue = serde_json::from_slice(body).map_err(|_| AdapterError::BadDevices)?;
    let JsonValue::Object(mut top) = value else {
        return Err(AdapterError::BadDevices);
    };

    let entries: Vec<(Option<String>, JsonValue)> = match top.remove("devices") {
        Some(JsonValue::Object(map)) => map.into_iter().map(|(k, v)| (Some(k), v)).collect(),
        Some(JsonValue::Array(items)) => items.into_iter().map(|v| (None, v)).collect(),
        _ => return Err(AdapterError::BadDevices),
    };
    if entries.is_empty() {
        return Err(AdapterError::BadDevices);
    }

    let mut records = Vec::with_capacity(entries.len());
    let mut skipped = 0usize;
    for (key, value) in entries {
        if !value.is_object() {
            skipped += 1;
            continue;
        }
        let record = serde_json::from_value::<WireDevice>(value)
            .ok()
            .and_then(|wire| wire.into_record(key.as_deref()));
        match record {
            Some(record) => records.push(record),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(skipped, "dropped devices without a usable id");
    }
    if records.is_empty() {
        return Err(AdapterError::BadDevices);
    }
    Ok(records)
}

/// Canonical labels plus the spellings seen in the wild.
const TYPE_SYNONYMS: &[(&str, &str)] = &[
    ("supply boat", "supply boat"),
    ("speed boat", "speed boat"),
    ("safari", "safari"),
    ("landing craft", "landing craft"),
    ("fishing boat", "fishing boat"),
    ("dinghy", "dinghy"),
    ("excursion boat", "excursion boat"),
    ("passenger ferry", "passenger ferry"),
    ("tug boat", "tug boat"),
    ("ferry", "passenger ferry"),
    ("landing-craft", "landing craft"),
    ("speedboat", "speed boat"),
];

/// Lowercases and trims a free-text label, mapping known synonyms. Unknown
/// labels pass through lowercased; blank labels are `None`.
pub fn normalize_type_label(value: &str) -> Option<String> {
    let lowered = value.trim().to_lowercase();
    if lowered.is_empty() {
        return None;
    }
    let canonical = TYPE_SYNONYMS
        .iter()
        .find(|(from, _)| *from == lowered)
        .map(|(_, to)| (*to).to_string());
    Some(canonical.unwrap_or(lowered))
}

/// Boat id to normalized type, loaded from a two-column CSV.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeLookupTable {
    by_boat: HashMap<String, String>,
}

impl TypeLookupTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, boat_id: &str) -> Option<&str> {
        self.by_boat.get(boat_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_boat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_boat.is_empty()
    }

    /// `(boat_id, type)` pairs sorted by id.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = self
            .by_boat
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Vec<_>>();
        pairs.sort();
        pairs
    }

    /// Parses CSV text. A first row naming `device_id` or `boat_id` is a
    /// header and must also name `boat_type`; otherwise columns 0 and 1 are
    /// used and the first row is data. Rows with a blank id or label are
    /// skipped; a later row for the same id wins.
    pub fn from_csv_str(text: &str) -> Result<Self, AdapterError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());
        let mut rows = reader.records();
        let Some(first) = rows.next().transpose()? else {
            return Ok(Self::empty());
        };

        let header = first
            .iter()
            .map(|cell| cell.to_lowercase())
            .collect::<Vec<_>>();
        let position = |name: &str| header.iter().position(|h| h == name);

        let mut table = Self::empty();
        let (col_device, col_type) = if position("device_id").is_some() || position("boat_id").is_some() {
            let device = position("device_id").or_else(|| position("boat_id"));
            match (device, position("boat_type")) {
                (Some(device), Some(kind)) => (device, kind),
                _ => {
                    return Err(AdapterError::Message(
                        "header must include device_id (or boat_id) and boat_type".to_string(),
                    ))
                }
            }
        } else {
            table.insert_row(&first, 0, 1);
            (0, 1)
        };

        for row in rows {
            table.insert_row(&row?, col_device, col_type);
        }
        Ok(table)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_csv_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Like [`Self::load`], but a missing file yields an empty table.
    pub fn load_if_present(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "type CSV not found; skipping type enrichment");
            return Ok(Self::empty());
        }
        Self::load(path)
    }

    fn insert_row(&mut self, row: &csv::StringRecord, col_device: usize, col_type: usize) {
        let boat_id = row.get(col_device).unwrap_or_default();
        let label = row.get(col_type).and_then(normalize_type_label);
        match label {
            Some(label) if !boat_id.is_empty() => {
                self.by_boat.insert(boat_id.to_string(), label);
            }
            _ => {}
        }
    }
}
