//! Derived views consumed by the dashboard, charts and map.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ResourceType;

/// Road segments attached to a piste: how many, and their summed length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ChausseeTally {
    pub count: u64,
    pub km: f64,
}

/// Per-type counters of the infrastructures attached to one piste.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PisteCounts {
    pub chaussees: ChausseeTally,
    pub buses: u64,
    pub dalots: u64,
    pub ponts: u64,
    pub passages_submersibles: u64,
    pub bacs: u64,
    pub ecoles: u64,
    pub marches: u64,
    pub services_santes: u64,
    pub batiments_administratifs: u64,
    pub infrastructures_hydrauliques: u64,
    pub localites: u64,
    pub autres_infrastructures: u64,
}

impl PisteCounts {
    /// Count one attached record. `km` is only used for chaussees.
    pub fn record(&mut self, resource: ResourceType, km: f64) {
        match resource {
            ResourceType::Chaussees => {
                self.chaussees.count += 1;
                self.chaussees.km += km;
            }
            other => {
                if let Some(counter) = self.counter_mut(other) {
                    *counter += 1;
                }
            }
        }
    }

    /// Number of records of `resource` attached to this piste.
    pub fn get(&self, resource: ResourceType) -> u64 {
        match resource {
            ResourceType::Chaussees => self.chaussees.count,
            ResourceType::Buses => self.buses,
            ResourceType::Dalots => self.dalots,
            ResourceType::Ponts => self.ponts,
            ResourceType::PassagesSubmersibles => self.passages_submersibles,
            ResourceType::Bacs => self.bacs,
            ResourceType::Ecoles => self.ecoles,
            ResourceType::Marches => self.marches,
            ResourceType::ServicesSantes => self.services_santes,
            ResourceType::BatimentsAdministratifs => self.batiments_administratifs,
            ResourceType::InfrastructuresHydrauliques => self.infrastructures_hydrauliques,
            ResourceType::Localites => self.localites,
            ResourceType::AutresInfrastructures => self.autres_infrastructures,
            ResourceType::Pistes | ResourceType::PointsCoupures | ResourceType::PointsCritiques => 0,
        }
    }

    pub fn total(&self) -> u64 {
        ResourceType::attached().map(|t| self.get(t)).sum()
    }

    fn counter_mut(&mut self, resource: ResourceType) -> Option<&mut u64> {
        let counter = match resource {
            ResourceType::Buses => &mut self.buses,
            ResourceType::Dalots => &mut self.dalots,
            ResourceType::Ponts => &mut self.ponts,
            ResourceType::PassagesSubmersibles => &mut self.passages_submersibles,
            ResourceType::Bacs => &mut self.bacs,
            ResourceType::Ecoles => &mut self.ecoles,
            ResourceType::Marches => &mut self.marches,
            ResourceType::ServicesSantes => &mut self.services_santes,
            ResourceType::BatimentsAdministratifs => &mut self.batiments_administratifs,
            ResourceType::InfrastructuresHydrauliques => &mut self.infrastructures_hydrauliques,
            ResourceType::Localites => &mut self.localites,
            ResourceType::AutresInfrastructures => &mut self.autres_infrastructures,
            _ => return None,
        };
        Some(counter)
    }
}

/// Everything known about one piste after aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PisteAggregate {
    pub id: Option<String>,
    pub code_piste: String,
    pub created_at: Option<String>,
    pub utilisateur: String,
    pub commune: String,
    pub kilometrage: f64,
    #[serde(flatten)]
    pub counts: PisteCounts,
}

/// Cardinality of each dashboard collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(transparent)]
pub struct GlobalStats(BTreeMap<ResourceType, usize>);

impl GlobalStats {
    pub fn get(&self, resource: ResourceType) -> usize {
        self.0.get(&resource).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceType, usize)> + '_ {
        self.0.iter().map(|(t, n)| (*t, *n))
    }
}

impl FromIterator<(ResourceType, usize)> for GlobalStats {
    fn from_iter<I: IntoIterator<Item = (ResourceType, usize)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Output of one aggregation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ProcessedData {
    /// One entry per distinct `code_piste` of the pistes collection.
    pub pistes_counts: BTreeMap<String, PisteAggregate>,
    pub global_stats: GlobalStats,
    /// Chaussee identifier to the `code_piste` it belongs to.
    pub chaussees_mapping: BTreeMap<String, String>,
}

impl ProcessedData {
    pub fn piste(&self, code_piste: &str) -> Option<&PisteAggregate> {
        self.pistes_counts.get(code_piste)
    }

    /// Sum of attached counters over every piste, per type.
    pub fn totals(&self) -> PisteCounts {
        let mut totals = PisteCounts::default();
        for aggregate in self.pistes_counts.values() {
            let c = &aggregate.counts;
            totals.chaussees.count += c.chaussees.count;
            totals.chaussees.km += c.chaussees.km;
            for resource in ResourceType::attached().filter(|t| *t != ResourceType::Chaussees) {
                if let Some(counter) = totals.counter_mut(resource) {
                    *counter += c.get(resource);
                }
            }
        }
        totals
    }

    /// Total kilometrage declared on the pistes themselves.
    pub fn total_kilometrage(&self) -> f64 {
        self.pistes_counts.values().map(|p| p.kilometrage).sum()
    }
}

/// Lightweight record kept beside the cached dataset, readable without
/// deserializing the full payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub stored_at: DateTime<Utc>,
    pub counts: GlobalStats,
}
