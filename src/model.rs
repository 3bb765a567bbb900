use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of resource kinds held by the local store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Bundle,
    Binary,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Bundle, ResourceKind::Binary];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Bundle => "bundle",
            ResourceKind::Binary => "binary",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bundle" => Some(ResourceKind::Bundle),
            "binary" => Some(ResourceKind::Binary),
            _ => None,
        }
    }

    /// Name used in resource references (`Bundle/<id>`).
    pub fn resource_type(&self) -> &'static str {
        match self {
            ResourceKind::Bundle => "Bundle",
            ResourceKind::Binary => "Binary",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            ResourceKind::Bundle => "bundles",
            ResourceKind::Binary => "binaries",
        }
    }

    /// Whether writes of this kind get an outbox record.
    pub fn requires_archival(&self) -> bool {
        matches!(self, ResourceKind::Bundle)
    }

    pub fn handler(&self) -> &'static ResourceHandler {
        match self {
            ResourceKind::Bundle => &HANDLERS[0],
            ResourceKind::Binary => &HANDLERS[1],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag {
    pub system: String,
    pub code: String,
    #[serde(default)]
    pub display: Option<String>,
}

/// Fields every stored resource carries regardless of its kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceMeta {
    #[serde(default)]
    pub responsible_department: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub source_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BundleDocument {
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub notification_bundle_id: Option<String>,
    #[serde(default)]
    pub notification_id: Option<String>,
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinaryDocument {
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A parsed resource ready to be written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Resource {
    Bundle {
        #[serde(default)]
        meta: ResourceMeta,
        #[serde(flatten)]
        doc: BundleDocument,
    },
    Binary {
        #[serde(default)]
        meta: ResourceMeta,
        #[serde(flatten)]
        doc: BinaryDocument,
    },
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Bundle { .. } => ResourceKind::Bundle,
            Resource::Binary { .. } => ResourceKind::Binary,
        }
    }

    pub fn meta(&self) -> &ResourceMeta {
        match self {
            Resource::Bundle { meta, .. } | Resource::Binary { meta, .. } => meta,
        }
    }
}

/// Column values for a resource row, produced by the kind's handler.
#[derive(Debug, Clone, PartialEq)]
pub enum NewRecord {
    Bundle {
        profile: Option<String>,
        notification_bundle_id: Option<String>,
        notification_id: Option<String>,
        content: String,
    },
    Binary {
        content_type: String,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} resource handed to the {1} handler")]
    KindMismatch(&'static str, &'static str),
    #[error("bundle content must be a non-empty JSON object")]
    EmptyBundle,
    #[error("binary content type must be 1..=255 characters")]
    InvalidContentType,
    #[error("binary data must not be empty")]
    EmptyBinary,
}

/// Per-kind behaviour table entry.
pub struct ResourceHandler {
    pub kind: ResourceKind,
    pub validate: fn(&Resource) -> Result<(), ValidationError>,
    pub to_record: fn(&Resource) -> Result<NewRecord, ValidationError>,
}

static HANDLERS: [ResourceHandler; 2] = [
    ResourceHandler {
        kind: ResourceKind::Bundle,
        validate: validate_bundle,
        to_record: bundle_record,
    },
    ResourceHandler {
        kind: ResourceKind::Binary,
        validate: validate_binary,
        to_record: binary_record,
    },
];

fn validate_bundle(resource: &Resource) -> Result<(), ValidationError> {
    let Resource::Bundle { doc, .. } = resource else {
        return Err(ValidationError::KindMismatch(resource.kind().as_str(), "bundle"));
    };
    match doc.content.as_object() {
        Some(obj) if !obj.is_empty() => Ok(()),
        _ => Err(ValidationError::EmptyBundle),
    }
}

fn bundle_record(resource: &Resource) -> Result<NewRecord, ValidationError> {
    let Resource::Bundle { doc, .. } = resource else {
        return Err(ValidationError::KindMismatch(resource.kind().as_str(), "bundle"));
    };
    Ok(NewRecord::Bundle {
        profile: doc.profile.clone(),
        notification_bundle_id: doc.notification_bundle_id.clone(),
        notification_id: doc.notification_id.clone(),
        content: doc.content.to_string(),
    })
}

fn validate_binary(resource: &Resource) -> Result<(), ValidationError> {
    let Resource::Binary { doc, .. } = resource else {
        return Err(ValidationError::KindMismatch(resource.kind().as_str(), "binary"));
    };
    let len = doc.content_type.trim().len();
    if len == 0 || doc.content_type.len() > 255 {
        return Err(ValidationError::InvalidContentType);
    }
    if doc.data.is_empty() {
        return Err(ValidationError::EmptyBinary);
    }
    Ok(())
}

fn binary_record(resource: &Resource) -> Result<NewRecord, ValidationError> {
    let Resource::Binary { doc, .. } = resource else {
        return Err(ValidationError::KindMismatch(resource.kind().as_str(), "binary"));
    };
    Ok(NewRecord::Binary {
        content_type: doc.content_type.clone(),
        data: doc.data.clone(),
    })
}

/// Delivery state of an outbox record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum SyncStatus {
    NEW,
    SYNCED,
    ERROR,
    SERVER_UNAVAILABLE,
    SERVER_TIMEOUT,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::NEW => "NEW",
            SyncStatus::SYNCED => "SYNCED",
            SyncStatus::ERROR => "ERROR",
            SyncStatus::SERVER_UNAVAILABLE => "SERVER_UNAVAILABLE",
            SyncStatus::SERVER_TIMEOUT => "SERVER_TIMEOUT",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(SyncStatus::NEW),
            "SYNCED" => Some(SyncStatus::SYNCED),
            "ERROR" => Some(SyncStatus::ERROR),
            "SERVER_UNAVAILABLE" => Some(SyncStatus::SERVER_UNAVAILABLE),
            "SERVER_TIMEOUT" => Some(SyncStatus::SERVER_TIMEOUT),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle(content: serde_json::Value) -> Resource {
        Resource::Bundle {
            meta: ResourceMeta::default(),
            doc: BundleDocument {
                profile: None,
                notification_bundle_id: None,
                notification_id: None,
                content,
            },
        }
    }

    #[test]
    fn handler_table_matches_kind() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.handler().kind, kind);
        }
    }

    #[test]
    fn only_bundles_are_archived() {
        assert!(ResourceKind::Bundle.requires_archival());
        assert!(!ResourceKind::Binary.requires_archival());
    }

    #[test]
    fn bundle_validation() {
        let h = ResourceKind::Bundle.handler();
        assert!((h.validate)(&bundle(json!({"resourceType": "Bundle"}))).is_ok());
        assert_eq!((h.validate)(&bundle(json!({}))), Err(ValidationError::EmptyBundle));
        assert_eq!((h.validate)(&bundle(json!("x"))), Err(ValidationError::EmptyBundle));
    }

    #[test]
    fn binary_validation() {
        let h = ResourceKind::Binary.handler();
        let mut res = Resource::Binary {
            meta: ResourceMeta::default(),
            doc: BinaryDocument { content_type: "application/pdf".into(), data: vec![1, 2] },
        };
        assert!((h.validate)(&res).is_ok());
        if let Resource::Binary { doc, .. } = &mut res {
            doc.content_type = " ".into();
        }
        assert_eq!((h.validate)(&res), Err(ValidationError::InvalidContentType));
        assert!(matches!(
            (ResourceKind::Bundle.handler().validate)(&res),
            Err(ValidationError::KindMismatch(_, _))
        ));
    }

    #[test]
    fn resource_json_shape() {
        let res: Resource = serde_json::from_value(json!({
            "kind": "bundle",
            "meta": {"responsible_department": "1.01.0.53.", "tags": [{"system": "s", "code": "c"}]},
            "profile": "p",
            "content": {"resourceType": "Bundle"}
        }))
        .unwrap();
        assert_eq!(res.kind(), ResourceKind::Bundle);
        assert_eq!(res.meta().tags[0].display, None);
    }

    #[test]
    fn status_round_trip() {
        assert_eq!(SyncStatus::parse_status("SERVER_TIMEOUT"), Some(SyncStatus::SERVER_TIMEOUT));
        assert_eq!(SyncStatus::parse_status("bogus"), None);
    }
}
