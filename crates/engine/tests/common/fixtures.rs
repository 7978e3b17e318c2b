//! Resource fixtures.

use serde_json::{Value, json};

/// A patient with a family name and gender.
pub fn patient(id: &str, family: &str, gender: &str) -> Value {
    json!({
        "resourceType": "Patient",
        "id": id,
        "gender": gender,
        "name": [{"family": family, "given": ["Test"]}]
    })
}

/// A patient as the server returns it, with `meta`.
pub fn remote_patient(id: &str, family: &str, version: &str, last_updated: &str) -> Value {
    json!({
        "resourceType": "Patient",
        "id": id,
        "meta": {"versionId": version, "lastUpdated": last_updated},
        "gender": "unknown",
        "name": [{"family": family}]
    })
}

/// An observation about `subject` (a `Type/id` reference).
pub fn observation(id: &str, subject: &str) -> Value {
    json!({
        "resourceType": "Observation",
        "id": id,
        "status": "final",
        "code": {"coding": [{"system": "http://loinc.org", "code": "8867-4"}]},
        "subject": {"reference": subject},
        "effectiveDateTime": "2024-03-01T10:00:00Z",
        "valueQuantity": {
            "value": 72,
            "unit": "beats/minute",
            "system": "http://unitsofmeasure.org",
            "code": "/min"
        }
    })
}

/// An observation as the server returns it, with `meta`.
pub fn remote_observation(id: &str, subject: &str, last_updated: &str) -> Value {
    let mut obs = observation(id, subject);
    obs["meta"] = json!({"versionId": "1", "lastUpdated": last_updated});
    obs
}
