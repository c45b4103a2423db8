use serde::{Deserialize, Serialize};

use super::{PisteAggregate, ProcessedData};

/// Filter state a view applies to the aggregated pistes.
///
/// Empty fields match everything. Text comparisons ignore case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PisteFilter {
    pub commune: Option<String>,
    pub utilisateur: Option<String>,
    pub code_prefix: Option<String>,
}

impl PisteFilter {
    pub fn is_empty(&self) -> bool {
        self.commune.is_none() && self.utilisateur.is_none() && self.code_prefix.is_none()
    }

    pub fn matches(&self, piste: &PisteAggregate) -> bool {
        let field_matches = |wanted: &Option<String>, actual: &str| {
            wanted
                .as_deref()
                .map(|w| w.trim().eq_ignore_ascii_case(actual.trim()))
                .unwrap_or(true)
        };

        let prefix_matches = self
            .code_prefix
            .as_deref()
            .map(|p| {
                piste
                    .code_piste
                    .to_ascii_lowercase()
                    .starts_with(&p.trim().to_ascii_lowercase())
            })
            .unwrap_or(true);

        field_matches(&self.commune, &piste.commune)
            && field_matches(&self.utilisateur, &piste.utilisateur)
            && prefix_matches
    }
}

impl ProcessedData {
    /// Pistes matching `filter`, ordered by `code_piste`.
    pub fn filter_pistes(&self, filter: &PisteFilter) -> Vec<&PisteAggregate> {
        self.pistes_counts
            .values()
            .filter(|p| filter.matches(p))
            .collect()
    }
}
