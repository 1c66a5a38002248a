//! Static per-vendor scope tables for the client-credentials grant.

use serde::Deserialize;

/// Resource types eClinicalWorks requires explicit system scopes for.
const ECW_RESOURCES: &[&str] = &[
    "Group",
    "Medication",
    "AllergyIntolerance",
    "CarePlan",
    "CareTeam",
    "Condition",
    "Device",
    "DiagnosticReport",
    "DocumentReference",
    "Encounter",
    "Goal",
    "Immunization",
    "Location",
    "MedicationRequest",
    "Observation",
    "Organization",
    "Patient",
    "Practitioner",
    "PractitionerRole",
    "Procedure",
    "Provenance",
];

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VendorPreset {
    Default,
    AdvancedMd,
    Ecw,
    Epic,
}

impl VendorPreset {
    pub fn scopes(&self) -> Vec<String> {
        match self {
            VendorPreset::Default | VendorPreset::Epic => vec!["system/Group.read".to_owned()],
            VendorPreset::AdvancedMd => vec!["system/*.read".to_owned()],
            VendorPreset::Ecw => ECW_RESOURCES
                .iter()
                .map(|resource| format!("system/{}.read", resource))
                .collect(),
        }
    }
}

/// `scopes:` accepts either a preset name or an explicit list.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ScopeSet {
    Preset(VendorPreset),
    List(Vec<String>),
}

impl Default for ScopeSet {
    fn default() -> Self {
        ScopeSet::Preset(VendorPreset::Default)
    }
}

impl ScopeSet {
    pub fn resolve(&self) -> Vec<String> {
        match self {
            ScopeSet::Preset(preset) => preset.scopes(),
            ScopeSet::List(scopes) => scopes.clone(),
        }
    }
}
