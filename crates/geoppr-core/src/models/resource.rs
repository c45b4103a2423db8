use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One table exposed by the infrastructure API.
///
/// The first fourteen variants are the dashboard types that get fetched,
/// aggregated and cached. The last two only exist on the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Pistes,
    Chaussees,
    Buses,
    Dalots,
    Ponts,
    PassagesSubmersibles,
    Bacs,
    Ecoles,
    Marches,
    ServicesSantes,
    BatimentsAdministratifs,
    InfrastructuresHydrauliques,
    Localites,
    AutresInfrastructures,
    PointsCoupures,
    PointsCritiques,
}

impl ResourceType {
    /// The fourteen types loaded for the dashboard, in canonical order.
    pub const DASHBOARD: [ResourceType; 14] = [
        ResourceType::Pistes,
        ResourceType::Chaussees,
        ResourceType::Buses,
        ResourceType::Dalots,
        ResourceType::Ponts,
        ResourceType::PassagesSubmersibles,
        ResourceType::Bacs,
        ResourceType::Ecoles,
        ResourceType::Marches,
        ResourceType::ServicesSantes,
        ResourceType::BatimentsAdministratifs,
        ResourceType::InfrastructuresHydrauliques,
        ResourceType::Localites,
        ResourceType::AutresInfrastructures,
    ];

    /// Dashboard types plus the surveillance points drawn on the map.
    pub const MAP: [ResourceType; 16] = [
        ResourceType::Pistes,
        ResourceType::Chaussees,
        ResourceType::Buses,
        ResourceType::Dalots,
        ResourceType::Ponts,
        ResourceType::PassagesSubmersibles,
        ResourceType::Bacs,
        ResourceType::Ecoles,
        ResourceType::Marches,
        ResourceType::ServicesSantes,
        ResourceType::BatimentsAdministratifs,
        ResourceType::InfrastructuresHydrauliques,
        ResourceType::Localites,
        ResourceType::AutresInfrastructures,
        ResourceType::PointsCoupures,
        ResourceType::PointsCritiques,
    ];

    /// The thirteen types counted against a piste (everything but pistes).
    pub fn attached() -> impl Iterator<Item = ResourceType> {
        Self::DASHBOARD.into_iter().filter(|t| *t != ResourceType::Pistes)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Pistes => "pistes",
            ResourceType::Chaussees => "chaussees",
            ResourceType::Buses => "buses",
            ResourceType::Dalots => "dalots",
            ResourceType::Ponts => "ponts",
            ResourceType::PassagesSubmersibles => "passages_submersibles",
            ResourceType::Bacs => "bacs",
            ResourceType::Ecoles => "ecoles",
            ResourceType::Marches => "marches",
            ResourceType::ServicesSantes => "services_santes",
            ResourceType::BatimentsAdministratifs => "batiments_administratifs",
            ResourceType::InfrastructuresHydrauliques => "infrastructures_hydrauliques",
            ResourceType::Localites => "localites",
            ResourceType::AutresInfrastructures => "autres_infrastructures",
            ResourceType::PointsCoupures => "points_coupures",
            ResourceType::PointsCritiques => "points_critiques",
        }
    }

    /// Read-all endpoint path, relative to the API base URL.
    pub fn endpoint(&self) -> String {
        format!("/{}/", self.as_str())
    }

    pub fn is_dashboard(&self) -> bool {
        !matches!(self, ResourceType::PointsCoupures | ResourceType::PointsCritiques)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ResourceType::Pistes => "Pistes",
            ResourceType::Chaussees => "Chaussées",
            ResourceType::Buses => "Buses",
            ResourceType::Dalots => "Dalots",
            ResourceType::Ponts => "Ponts",
            ResourceType::PassagesSubmersibles => "Passages submersibles",
            ResourceType::Bacs => "Bacs",
            ResourceType::Ecoles => "Écoles",
            ResourceType::Marches => "Marchés",
            ResourceType::ServicesSantes => "Services de santé",
            ResourceType::BatimentsAdministratifs => "Bâtiments administratifs",
            ResourceType::InfrastructuresHydrauliques => "Infrastructures hydrauliques",
            ResourceType::Localites => "Localités",
            ResourceType::AutresInfrastructures => "Autres infrastructures",
            ResourceType::PointsCoupures => "Points de coupure",
            ResourceType::PointsCritiques => "Points critiques",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown resource type: {0}")]
pub struct UnknownResourceType(pub String);

impl FromStr for ResourceType {
    type Err = UnknownResourceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        ResourceType::MAP
            .into_iter()
            .find(|t| t.as_str() == key)
            .ok_or(UnknownResourceType(s.to_string()))
    }
}
