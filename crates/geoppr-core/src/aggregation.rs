//! Aggregation of raw collections into the dashboard views.
//!
//! Pure and infallible: malformed records are skipped or zero-filled and
//! tallied in an [`AggregationReport`], never returned as errors.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::debug;

use crate::models::record::{
    first_present, CHAUSSEE_LENGTH, CODE_PISTE, COMMUNE, CREATED_AT, KILOMETRAGE, OWNER, RECORD_ID,
};
use crate::models::{
    PisteAggregate, PisteCounts, ProcessedData, PropertyBag, RawCollectionSet, Record, ResourceType,
    UNASSIGNED_OWNER, UNKNOWN_COMMUNE,
};

/// Records left out of per-piste aggregation, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationReport {
    /// Not a JSON object.
    pub malformed: usize,
    /// No resolvable `code_piste`.
    pub unlinked: usize,
    /// `code_piste` matches no known piste.
    pub orphaned: usize,
    /// Pistes whose `code_piste` was already seeded.
    pub duplicate_pistes: usize,
}

impl AggregationReport {
    pub fn skipped(&self) -> usize {
        self.malformed + self.unlinked + self.orphaned + self.duplicate_pistes
    }
}

/// Aggregate `raw` into per-piste counters and global counts.
pub fn aggregate(raw: &RawCollectionSet) -> ProcessedData {
    aggregate_with_report(raw).0
}

pub fn aggregate_with_report(raw: &RawCollectionSet) -> (ProcessedData, AggregationReport) {
    let started = Instant::now();
    let mut report = AggregationReport::default();

    let mut pistes_counts = seed_pistes(raw.collection(ResourceType::Pistes), &mut report);

    for resource in ResourceType::attached() {
        for record in raw.collection(resource) {
            let Some(bag) = PropertyBag::from_record(record) else {
                report.malformed += 1;
                continue;
            };
            let Some(code) = first_present(&bag, CODE_PISTE) else {
                report.unlinked += 1;
                continue;
            };
            match pistes_counts.get_mut(&code) {
                Some(piste) => {
                    let km = match resource {
                        ResourceType::Chaussees => chaussee_km(&bag),
                        _ => 0.0,
                    };
                    piste.counts.record(resource, km);
                }
                None => report.orphaned += 1,
            }
        }
    }

    let data = ProcessedData {
        pistes_counts,
        global_stats: raw.counts(),
        chaussees_mapping: chaussees_mapping(raw.collection(ResourceType::Chaussees)),
    };

    debug!(
        pistes = data.pistes_counts.len(),
        records = raw.total_records(),
        malformed = report.malformed,
        unlinked = report.unlinked,
        orphaned = report.orphaned,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Aggregation complete"
    );

    (data, report)
}

fn seed_pistes(
    pistes: &[Record],
    report: &mut AggregationReport,
) -> BTreeMap<String, PisteAggregate> {
    let mut seeded = BTreeMap::new();
    for record in pistes {
        let Some(bag) = PropertyBag::from_record(record) else {
            report.malformed += 1;
            continue;
        };
        let Some(code_piste) = first_present(&bag, CODE_PISTE) else {
            report.unlinked += 1;
            continue;
        };
        if seeded.contains_key(&code_piste) {
            report.duplicate_pistes += 1;
            continue;
        }
        let aggregate = PisteAggregate {
            id: first_present(&bag, RECORD_ID),
            code_piste: code_piste.clone(),
            created_at: first_present(&bag, CREATED_AT),
            utilisateur: first_present(&bag, OWNER).unwrap_or_else(|| UNASSIGNED_OWNER.to_string()),
            commune: first_present(&bag, COMMUNE).unwrap_or_else(|| UNKNOWN_COMMUNE.to_string()),
            kilometrage: first_present(&bag, KILOMETRAGE).unwrap_or(0.0),
            counts: PisteCounts::default(),
        };
        seeded.insert(code_piste, aggregate);
    }
    seeded
}

/// Length of a chaussee in km; missing, unparsable or negative reads as 0.
fn chaussee_km(bag: &PropertyBag<'_>) -> f64 {
    first_present(bag, CHAUSSEE_LENGTH)
        .filter(|km| *km >= 0.0)
        .unwrap_or(0.0)
}

fn chaussees_mapping(chaussees: &[Record]) -> BTreeMap<String, String> {
    chaussees
        .iter()
        .filter_map(PropertyBag::from_record)
        .filter_map(|bag| Some((first_present(&bag, RECORD_ID)?, first_present(&bag, CODE_PISTE)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChausseeTally;
    use serde_json::json;

    fn raw(entries: Vec<(ResourceType, serde_json::Value)>) -> RawCollectionSet {
        entries
            .into_iter()
            .map(|(t, v)| (t, v.as_array().cloned().unwrap_or_default()))
            .collect()
    }

    #[test]
    fn test_chaussees_scenario() {
        let input = raw(vec![
            (ResourceType::Pistes, json!([{"code_piste": "P1"}, {"code_piste": "P2"}])),
            (
                ResourceType::Chaussees,
                json!([
                    {"code_piste": "P1", "length_km": "12.5"},
                    {"code_piste": "P1", "length_km": "bad"},
                    {"code_piste": "X9", "length_km": "5"}
                ]),
            ),
        ]);

        let (data, report) = aggregate_with_report(&input);

        assert_eq!(data.pistes_counts["P1"].counts.chaussees, ChausseeTally { count: 2, km: 12.5 });
        assert_eq!(data.pistes_counts["P2"].counts.chaussees, ChausseeTally { count: 0, km: 0.0 });
        assert_eq!(data.global_stats.get(ResourceType::Chaussees), 3);
        assert_eq!(report.orphaned, 1);
    }

    #[test]
    fn test_keys_are_exactly_the_piste_codes() {
        let input = raw(vec![
            (
                ResourceType::Pistes,
                json!([
                    {"properties": {"code_piste": "A"}},
                    {"code_piste": "B"},
                    {"code_piste": "A"},
                    {"nom": "sans code"}
                ]),
            ),
            (ResourceType::Ponts, json!([{"code_piste": "C"}])),
        ]);

        let (data, report) = aggregate_with_report(&input);

        let keys: Vec<_> = data.pistes_counts.keys().cloned().collect();
        assert_eq!(keys, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(report.duplicate_pistes, 1);
        assert_eq!(report.unlinked, 1);
        assert_eq!(data.global_stats.get(ResourceType::Pistes), 4);
    }

    #[test]
    fn test_orphans_count_globally_only() {
        let input = raw(vec![
            (ResourceType::Pistes, json!([{"code_piste": "P1"}])),
            (ResourceType::Ecoles, json!([{"code_piste": "P1"}, {"code_piste": "ZZ"}, {}])),
        ]);

        let data = aggregate(&input);

        assert_eq!(data.pistes_counts["P1"].counts.ecoles, 1);
        assert_eq!(data.global_stats.get(ResourceType::Ecoles), 3);
        for resource in ResourceType::attached() {
            let attached: u64 = data.pistes_counts.values().map(|p| p.counts.get(resource)).sum();
            assert!(data.global_stats.get(resource) as u64 >= attached);
        }
    }

    #[test]
    fn test_aggregation_is_idempotent() {
        let input = raw(vec![
            (
                ResourceType::Pistes,
                json!([
                    {"type": "Feature", "geometry": null,
                     "properties": {"code_piste": "P1", "login_id": {"nom": "Sow", "prenom": "Fatou"}}},
                    {"code_piste": "P2", "kilometrage": "7,5"}
                ]),
            ),
            (ResourceType::Chaussees, json!([{"fid": 4, "code_piste": "P2", "length_km": 1.25}])),
            (ResourceType::Bacs, json!([{"code_piste": "P1"}])),
        ]);

        assert_eq!(aggregate(&input), aggregate(&input));
    }

    #[test]
    fn test_piste_identity_fields_and_sentinels() {
        let input = raw(vec![(
            ResourceType::Pistes,
            json!([
                {"id": 10, "code_piste": "P1", "created_at": "2024-03-01T10:00:00Z",
                 "properties": {"utilisateur": "Keita", "communes_rurales_id": {"nom": "Labé"}, "length_km": "3.5"}},
                {"code_piste": "P2"}
            ]),
        )]);

        let data = aggregate(&input);

        let p1 = &data.pistes_counts["P1"];
        assert_eq!(p1.id.as_deref(), Some("10"));
        assert_eq!(p1.created_at.as_deref(), Some("2024-03-01T10:00:00Z"));
        assert_eq!(p1.utilisateur, "Keita");
        assert_eq!(p1.commune, "Labé");
        assert_eq!(p1.kilometrage, 3.5);

        let p2 = &data.pistes_counts["P2"];
        assert_eq!(p2.utilisateur, UNASSIGNED_OWNER);
        assert_eq!(p2.commune, UNKNOWN_COMMUNE);
        assert_eq!(p2.kilometrage, 0.0);
    }

    #[test]
    fn test_malformed_records_do_not_abort() {
        let input = raw(vec![
            (ResourceType::Pistes, json!([{"code_piste": "P1"}, 42, "oops", null])),
            (
                ResourceType::Chaussees,
                json!([
                    {"code_piste": "P1", "length_km": -3},
                    {"code_piste": "P1", "length_km": {"value": 2}},
                    {"code_piste": "P1"},
                    [1, 2, 3]
                ]),
            ),
        ]);

        let (data, report) = aggregate_with_report(&input);

        assert_eq!(data.pistes_counts["P1"].counts.chaussees, ChausseeTally { count: 3, km: 0.0 });
        assert_eq!(report.malformed, 4);
        assert_eq!(data.global_stats.get(ResourceType::Pistes), 4);
    }

    #[test]
    fn test_chaussees_mapping() {
        let input = raw(vec![(
            ResourceType::Chaussees,
            json!([
                {"fid": 1, "code_piste": "P1"},
                {"properties": {"id": "c-2", "code_piste": "P2"}},
                {"fid": 3}
            ]),
        )]);

        let data = aggregate(&input);

        assert_eq!(data.chaussees_mapping.len(), 2);
        assert_eq!(data.chaussees_mapping["1"], "P1");
        assert_eq!(data.chaussees_mapping["c-2"], "P2");
    }

    #[test]
    fn test_global_stats_cover_all_dashboard_types() {
        let data = aggregate(&RawCollectionSet::new());
        assert!(data.pistes_counts.is_empty());
        assert_eq!(data.global_stats.iter().count(), 14);
        assert_eq!(data.global_stats.total(), 0);
    }
}
