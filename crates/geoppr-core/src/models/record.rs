//! Raw API records and tolerant field lookup.
//!
//! Records arrive either as GeoJSON features (`{geometry, properties}`) or
//! as flat objects, and the same logical attribute can live under several
//! field names depending on the serializer that produced it. Lookups go
//! through ordered accessor lists: the first accessor that yields a value
//! wins.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{GlobalStats, ResourceType};

/// A single API record, kept as loosely-typed JSON.
pub type Record = Value;

/// Owner shown when a piste has no resolvable user.
pub const UNASSIGNED_OWNER: &str = "Non assigne";

/// Commune shown when a piste has no resolvable commune.
pub const UNKNOWN_COMMUNE: &str = "N/A";

/// All collections of one load, keyed by resource type.
///
/// A type absent from the map reads as an empty collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawCollectionSet(BTreeMap<ResourceType, Vec<Record>>);

impl RawCollectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, resource: ResourceType, records: Vec<Record>) {
        self.0.insert(resource, records);
    }

    pub fn collection(&self, resource: ResourceType) -> &[Record] {
        self.0.get(&resource).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Cardinality of each dashboard collection.
    pub fn counts(&self) -> GlobalStats {
        ResourceType::DASHBOARD
            .into_iter()
            .map(|t| (t, self.collection(t).len()))
            .collect()
    }

    pub fn total_records(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceType, &Vec<Record>)> {
        self.0.iter()
    }
}

impl FromIterator<(ResourceType, Vec<Record>)> for RawCollectionSet {
    fn from_iter<I: IntoIterator<Item = (ResourceType, Vec<Record>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Flat, borrowed view over a record's business fields.
///
/// Top-level fields win; `properties` fills in whatever is absent or
/// `null` at top level.
#[derive(Debug, Clone, Copy)]
pub struct PropertyBag<'a> {
    top: &'a Map<String, Value>,
    properties: Option<&'a Map<String, Value>>,
}

impl<'a> PropertyBag<'a> {
    /// Returns `None` for records that are not JSON objects.
    pub fn from_record(record: &'a Record) -> Option<Self> {
        let top = record.as_object()?;
        let properties = top.get("properties").and_then(Value::as_object);
        Some(Self { top, properties })
    }

    pub fn get(&self, key: &str) -> Option<&'a Value> {
        if key == "properties" {
            return None;
        }
        match self.top.get(key) {
            Some(v) if !v.is_null() => Some(v),
            _ => self
                .properties
                .and_then(|p| p.get(key))
                .filter(|v| !v.is_null()),
        }
    }
}

/// One way of reading a logical attribute out of a record.
pub type Accessor<T> = fn(&PropertyBag<'_>) -> Option<T>;

/// Try each accessor in order and return the first value found.
pub fn first_present<T>(bag: &PropertyBag<'_>, accessors: &[Accessor<T>]) -> Option<T> {
    accessors.iter().find_map(|accessor| accessor(bag))
}

pub const CODE_PISTE: &[Accessor<String>] = &[code_piste_field];

pub const RECORD_ID: &[Accessor<String>] = &[fid_field, id_field];

pub const OWNER: &[Accessor<String>] = &[utilisateur_field, login_id_field];

pub const COMMUNE: &[Accessor<String>] = &[commune_field, communes_rurales_field];

pub const KILOMETRAGE: &[Accessor<f64>] = &[kilometrage_field, length_km_field];

pub const CHAUSSEE_LENGTH: &[Accessor<f64>] = &[length_km_field, longueur_km_field];

pub const CREATED_AT: &[Accessor<String>] = &[created_at_field, date_creation_field];

fn code_piste_field(bag: &PropertyBag<'_>) -> Option<String> {
    identifier(bag.get("code_piste")?)
}

fn fid_field(bag: &PropertyBag<'_>) -> Option<String> {
    identifier(bag.get("fid")?)
}

fn id_field(bag: &PropertyBag<'_>) -> Option<String> {
    identifier(bag.get("id")?)
}

fn utilisateur_field(bag: &PropertyBag<'_>) -> Option<String> {
    person_name(bag.get("utilisateur")?)
}

fn login_id_field(bag: &PropertyBag<'_>) -> Option<String> {
    person_name(bag.get("login_id")?)
}

fn commune_field(bag: &PropertyBag<'_>) -> Option<String> {
    person_name(bag.get("commune")?)
}

fn communes_rurales_field(bag: &PropertyBag<'_>) -> Option<String> {
    person_name(bag.get("communes_rurales_id")?)
}

fn kilometrage_field(bag: &PropertyBag<'_>) -> Option<f64> {
    parse_decimal(bag.get("kilometrage")?)
}

fn length_km_field(bag: &PropertyBag<'_>) -> Option<f64> {
    parse_decimal(bag.get("length_km")?)
}

fn longueur_km_field(bag: &PropertyBag<'_>) -> Option<f64> {
    parse_decimal(bag.get("longueur_km")?)
}

fn created_at_field(bag: &PropertyBag<'_>) -> Option<String> {
    non_empty(bag.get("created_at")?.as_str()?)
}

fn date_creation_field(bag: &PropertyBag<'_>) -> Option<String> {
    non_empty(bag.get("date_creation")?.as_str()?)
}

/// Render a key-like value (string or integer) as a string.
pub fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Render a string, or a `{nom, prenom}` / `{nom}` object, as a display name.
pub fn person_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(s),
        Value::Object(obj) => {
            let nom = obj.get("nom").and_then(Value::as_str).unwrap_or("");
            let prenom = obj.get("prenom").and_then(Value::as_str).unwrap_or("");
            non_empty(&format!("{} {}", nom, prenom))
        }
        _ => None,
    }
}

/// Lenient numeric parse: numbers, numeric strings with an optional comma
/// decimal separator, and strings with a trailing unit such as `"3.2 km"`.
pub fn parse_decimal(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            let numeric: String = s
                .chars()
                .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-' | '+'))
                .map(|c| if c == ',' { '.' } else { c })
                .collect();
            numeric.parse::<f64>().ok()
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
