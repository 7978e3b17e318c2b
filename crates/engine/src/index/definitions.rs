//! Search parameter definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// FHIR search parameter types supported by the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchParamType {
    /// A simple string, like a name or description.
    String,
    /// A search against a URI.
    Uri,
    /// A search for a number.
    Number,
    /// A search for a date, dateTime, or period.
    Date,
    /// A quantity, with a number and units.
    Quantity,
    /// A code from a code system or value set.
    Token,
    /// A reference to another resource.
    Reference,
    /// A geographic position (Location.position).
    Special,
}

impl fmt::Display for SearchParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchParamType::String => "string",
            SearchParamType::Uri => "uri",
            SearchParamType::Number => "number",
            SearchParamType::Date => "date",
            SearchParamType::Quantity => "quantity",
            SearchParamType::Token => "token",
            SearchParamType::Reference => "reference",
            SearchParamType::Special => "special",
        };
        f.write_str(s)
    }
}

impl FromStr for SearchParamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "string" => Ok(SearchParamType::String),
            "uri" => Ok(SearchParamType::Uri),
            "number" => Ok(SearchParamType::Number),
            "date" => Ok(SearchParamType::Date),
            "quantity" => Ok(SearchParamType::Quantity),
            "token" => Ok(SearchParamType::Token),
            "reference" => Ok(SearchParamType::Reference),
            "special" => Ok(SearchParamType::Special),
            _ => Err(format!("unknown search parameter type: {}", s)),
        }
    }
}

/// Where to find a search parameter's values in a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParamDefinition {
    /// Resource type the parameter applies to; `Resource` applies to all.
    pub resource_type: String,
    /// Parameter name.
    pub name: String,
    /// Parameter type.
    pub param_type: SearchParamType,
    /// Dotted path expression, e.g. `Patient.name.given`.
    pub path: String,
}

impl SearchParamDefinition {
    /// Creates a definition.
    pub fn new(
        resource_type: impl Into<String>,
        name: impl Into<String>,
        param_type: SearchParamType,
        path: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            param_type,
            path: path.into(),
        }
    }

    /// Returns true if the definition applies to the resource type.
    pub fn applies_to(&self, resource_type: &str) -> bool {
        self.resource_type == resource_type || self.resource_type == "Resource"
    }
}

/// Parameters indexed on every resource.
pub(crate) fn common_definitions() -> Vec<SearchParamDefinition> {
    use SearchParamType::*;
    vec![
        SearchParamDefinition::new("Resource", "_lastUpdated", Date, "Resource.meta.lastUpdated"),
        SearchParamDefinition::new("Resource", "_tag", Token, "Resource.meta.tag"),
        SearchParamDefinition::new("Resource", "_profile", Uri, "Resource.meta.profile"),
    ]
}

/// A commonly searched R4 subset.
pub(crate) fn default_definitions() -> Vec<SearchParamDefinition> {
    use SearchParamType::*;
    let mut defs = common_definitions();
    defs.extend([
        SearchParamDefinition::new("Patient", "name", String, "Patient.name"),
        SearchParamDefinition::new("Patient", "family", String, "Patient.name.family"),
        SearchParamDefinition::new("Patient", "given", String, "Patient.name.given"),
        SearchParamDefinition::new("Patient", "address-city", String, "Patient.address.city"),
        SearchParamDefinition::new("Patient", "gender", Token, "Patient.gender"),
        SearchParamDefinition::new("Patient", "identifier", Token, "Patient.identifier"),
        SearchParamDefinition::new("Patient", "telecom", Token, "Patient.telecom"),
        SearchParamDefinition::new("Patient", "active", Token, "Patient.active"),
        SearchParamDefinition::new("Patient", "birthdate", Date, "Patient.birthDate"),
        SearchParamDefinition::new(
            "Patient",
            "general-practitioner",
            Reference,
            "Patient.generalPractitioner",
        ),
        SearchParamDefinition::new(
            "Patient",
            "organization",
            Reference,
            "Patient.managingOrganization",
        ),
        SearchParamDefinition::new("Practitioner", "name", String, "Practitioner.name"),
        SearchParamDefinition::new("Organization", "name", String, "Organization.name"),
        SearchParamDefinition::new("Observation", "code", Token, "Observation.code"),
        SearchParamDefinition::new("Observation", "status", Token, "Observation.status"),
        SearchParamDefinition::new("Observation", "subject", Reference, "Observation.subject"),
        SearchParamDefinition::new("Observation", "encounter", Reference, "Observation.encounter"),
        SearchParamDefinition::new("Observation", "date", Date, "Observation.effective"),
        SearchParamDefinition::new(
            "Observation",
            "value-quantity",
            Quantity,
            "Observation.valueQuantity",
        ),
        SearchParamDefinition::new("Encounter", "subject", Reference, "Encounter.subject"),
        SearchParamDefinition::new("Encounter", "status", Token, "Encounter.status"),
        SearchParamDefinition::new("Encounter", "date", Date, "Encounter.period"),
        SearchParamDefinition::new("Condition", "subject", Reference, "Condition.subject"),
        SearchParamDefinition::new("Condition", "code", Token, "Condition.code"),
        SearchParamDefinition::new("RiskAssessment", "probability", Number, "RiskAssessment.prediction.probability"),
        SearchParamDefinition::new("Questionnaire", "url", Uri, "Questionnaire.url"),
        SearchParamDefinition::new("Location", "near", Special, "Location.position"),
    ]);
    defs
}
