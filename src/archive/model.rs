use serde::{Deserialize, Serialize};

/// FHIR `batch` Bundle carrying one DELETE per remote id.
#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub resource_type: &'static str,
    #[serde(rename = "type")]
    pub typ: &'static str,
    pub entry: Vec<BatchRequestEntry>,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct BatchRequestEntry {
    pub request: EntryRequest,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct EntryRequest {
    pub method: &'static str,
    pub url: String,
}

#[derive(Deserialize, Debug)]
pub struct BatchResponse {
    #[serde(default)]
    pub entry: Vec<BatchResponseEntry>,
}

#[derive(Deserialize, Debug)]
pub struct BatchResponseEntry {
    pub response: EntryResponse,
}

#[derive(Deserialize, Debug)]
pub struct EntryResponse {
    pub status: String,
    #[serde(default)]
    pub outcome: Option<OperationOutcome>,
}

#[derive(Deserialize, Debug, Default)]
pub struct OperationOutcome {
    #[serde(default)]
    pub issue: Vec<OutcomeIssue>,
}

#[derive(Deserialize, Debug)]
pub struct OutcomeIssue {
    #[serde(default)]
    pub diagnostics: Option<String>,
}

impl OperationOutcome {
    /// Issue diagnostics joined into one line, if the server sent any.
    pub fn diagnostics(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .issue
            .iter()
            .filter_map(|i| i.diagnostics.as_deref())
            .filter(|d| !d.trim().is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join("; "))
    }
}

#[derive(Deserialize, Debug)]
pub struct CreatedResource {
    #[serde(default)]
    pub id: Option<String>,
}
