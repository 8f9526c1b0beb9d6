//! Core image catalog model: provider records, canonical records and the rules between them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "imgcat-core";

/// Resource kind under which image records are filed.
pub const KIND_IMAGE: &str = "image";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("the {kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },
    #[error("failed to check the existence of the {kind} {id}: {reason}")]
    ExistenceCheckFailed {
        kind: &'static str,
        id: String,
        reason: String,
    },
    #[error("the {kind} {id} does not exist")]
    NotFound { kind: &'static str, id: String },
    #[error("provider driver error: {0}")]
    Provider(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("'{0}' is immutable and must not be specified in an update")]
    ImmutableField(&'static str),
    #[error("invalid provider record: {0}")]
    InvalidProviderRecord(String),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Ordered attribute pair as emitted by provider drivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KeyValue {
    #[serde(alias = "Key")]
    pub key: String,
    #[serde(alias = "Value")]
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// First value stored under `key`, or `""` when absent.
pub fn lookup_key_value<'a>(list: &'a [KeyValue], key: &str) -> &'a str {
    list.iter()
        .find(|kv| kv.key == key)
        .map(|kv| kv.value.as_str())
        .unwrap_or_default()
}

/// Provider-assigned identifier pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Iid {
    #[serde(rename = "NameId", alias = "nameId", default)]
    pub name_id: String,
    #[serde(rename = "SystemId", alias = "systemId", default)]
    pub system_id: String,
}

/// Raw image description returned by a cloud driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProviderImageRecord {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "IId")]
    pub iid: Iid,
    #[serde(rename = "GuestOS")]
    pub guest_os: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "KeyValueList")]
    pub key_value_list: Vec<KeyValue>,
}

/// One credential/region pair a driver can be pointed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConnectionTarget {
    pub config_name: String,
    pub provider_name: String,
    pub driver_name: String,
    pub credential_name: String,
    pub region_name: String,
}

/// Persisted catalog entry. Default-valued fields are omitted on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CanonicalImageRecord {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub connection_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub csp_image_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub csp_image_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub creation_date: String,
    #[serde(rename = "guestOS", skip_serializing_if = "String::is_empty")]
    pub guest_os: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub key_value_list: Vec<KeyValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub associated_object_list: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_auto_generated: bool,
}

/// Explicit registration input; the image details are looked up live from the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrationRequest {
    pub name: String,
    pub connection_name: String,
    pub csp_image_id: String,
    pub description: String,
}

impl RegistrationRequest {
    pub fn validate(&self) -> CatalogResult<()> {
        for (field, value) in [
            ("name", &self.name),
            ("connectionName", &self.connection_name),
            ("cspImageId", &self.csp_image_id),
        ] {
            if value.is_empty() {
                return Err(CatalogError::Validation(format!("'{field}' is required")));
            }
        }
        check_name(&self.name)
    }
}

/// A record kind stored in the key-value store under `/ns/{ns}/resources/{KIND}/{id}`.
pub trait Resource: Serialize + DeserializeOwned + Send + Sync {
    const KIND: &'static str;

    fn id(&self) -> &str;
}

impl Resource for CanonicalImageRecord {
    const KIND: &'static str = KIND_IMAGE;

    fn id(&self) -> &str {
        &self.id
    }
}

pub fn resource_key(namespace: &str, kind: &str, id: &str) -> String {
    format!("{}{id}", resource_prefix(namespace, kind))
}

pub fn resource_prefix(namespace: &str, kind: &str) -> String {
    format!("/ns/{namespace}/resources/{kind}/")
}

/// Naming convention for namespaces and catalog names: `[a-z]([-a-z0-9]*[a-z0-9])?`, case-insensitive.
pub fn check_name(name: &str) -> CatalogResult<()> {
    let Some(first) = name.chars().next() else {
        return Err(CatalogError::Validation("the provided name is empty".to_string()));
    };
    if !first.is_ascii_alphabetic() {
        return Err(CatalogError::Validation(format!(
            "{name}: the first character must be a letter"
        )));
    }
    if name.ends_with('-') || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(CatalogError::Validation(format!(
            "{name} does not follow the naming convention [a-z]([-a-z0-9]*[a-z0-9])?"
        )));
    }
    Ok(())
}

/// Lower-cases and maps `.`, `_`, `:` and `/` to `-`. Runs of separators are kept, not collapsed.
pub fn normalize_image_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| match c {
            '.' | '_' | ':' | '/' => '-',
            other => other,
        })
        .collect()
}

/// Id under which synchronization files a provider image for `connection_name`.
pub fn sync_image_id(connection_name: &str, image_name: &str) -> String {
    format!("{connection_name}-{}", normalize_image_name(image_name))
}

/// Maps a provider record onto the canonical shape. Namespace, id and connection are left to the caller.
pub fn convert_provider_image(provider: ProviderImageRecord) -> CatalogResult<CanonicalImageRecord> {
    if provider.iid.name_id.is_empty() {
        return Err(CatalogError::InvalidProviderRecord(
            "provider image IId.NameId is empty".to_string(),
        ));
    }

    let kv = &provider.key_value_list;
    let display_name = lookup_key_value(kv, "Name");
    let name = if display_name.is_empty() {
        provider.iid.name_id.clone()
    } else {
        display_name.to_string()
    };

    Ok(CanonicalImageRecord {
        name,
        csp_image_id: provider.iid.name_id.clone(),
        csp_image_name: display_name.to_string(),
        description: lookup_key_value(kv, "Description").to_string(),
        creation_date: lookup_key_value(kv, "CreationDate").to_string(),
        guest_os: provider.guest_os,
        status: provider.status,
        key_value_list: provider.key_value_list,
        ..Default::default()
    })
}

/// Namespace and id are fixed at creation; a partial record must leave both empty.
pub fn check_immutable_fields(partial: &CanonicalImageRecord) -> CatalogResult<()> {
    if !partial.namespace.is_empty() {
        return Err(CatalogError::ImmutableField("namespace"));
    }
    if !partial.id.is_empty() {
        return Err(CatalogError::ImmutableField("id"));
    }
    Ok(())
}

fn overwrite_if_set<T: Default + PartialEq>(slot: &mut T, value: T) {
    if value != T::default() {
        *slot = value;
    }
}

/// Applies the non-default fields of `partial` onto `existing`.
///
/// A default value in `partial` means "leave unchanged", so a field cannot be reset to its
/// empty value through a merge.
pub fn merge_image(
    existing: &CanonicalImageRecord,
    partial: CanonicalImageRecord,
) -> CatalogResult<CanonicalImageRecord> {
    check_immutable_fields(&partial)?;

    let mut merged = existing.clone();
    overwrite_if_set(&mut merged.name, partial.name);
    overwrite_if_set(&mut merged.connection_name, partial.connection_name);
    overwrite_if_set(&mut merged.csp_image_id, partial.csp_image_id);
    overwrite_if_set(&mut merged.csp_image_name, partial.csp_image_name);
    overwrite_if_set(&mut merged.description, partial.description);
    overwrite_if_set(&mut merged.creation_date, partial.creation_date);
    overwrite_if_set(&mut merged.guest_os, partial.guest_os);
    overwrite_if_set(&mut merged.status, partial.status);
    overwrite_if_set(&mut merged.key_value_list, partial.key_value_list);
    overwrite_if_set(&mut merged.associated_object_list, partial.associated_object_list);
    overwrite_if_set(&mut merged.is_auto_generated, partial.is_auto_generated);
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name_id: &str, kv: &[(&str, &str)]) -> ProviderImageRecord {
        ProviderImageRecord {
            name: String::new(),
            iid: Iid {
                name_id: name_id.to_string(),
                system_id: format!("sys-{name_id}"),
            },
            guest_os: "Ubuntu".to_string(),
            status: "available".to_string(),
            key_value_list: kv.iter().map(|(k, v)| KeyValue::new(*k, *v)).collect(),
        }
    }

    #[test]
    fn normalize_maps_separators_to_hyphens() {
        assert_eq!(normalize_image_name("Ubuntu_20.04:LTS/x64"), "ubuntu-20-04-lts-x64");
    }

    #[test]
    fn normalize_keeps_runs_and_edges() {
        assert_eq!(normalize_image_name("..a__b//"), "--a--b--");
        assert_eq!(normalize_image_name("Win Server (2019)"), "win server (2019)");
    }

    #[test]
    fn sync_id_prefixes_connection() {
        assert_eq!(
            sync_image_id("aws-us-east-1", "Amazon.Linux_2"),
            "aws-us-east-1-amazon-linux-2"
        );
    }

    #[test]
    fn naming_convention() {
        assert!(check_name("tb-unit-test").is_ok());
        assert!(check_name("Ns1").is_ok());
        assert!(check_name("a").is_ok());
        assert!(check_name("").is_err());
        assert!(check_name("1abc").is_err());
        assert!(check_name("abc-").is_err());
        assert!(check_name("ab_c").is_err());
        assert!(check_name("ab.c").is_err());
    }

    #[test]
    fn registration_request_requires_fields() {
        let mut req = RegistrationRequest {
            name: "img-1".into(),
            connection_name: "aws-conn".into(),
            csp_image_id: "ami-123".into(),
            description: String::new(),
        };
        assert!(req.validate().is_ok());

        req.csp_image_id.clear();
        assert!(matches!(req.validate(), Err(CatalogError::Validation(msg)) if msg.contains("cspImageId")));

        req.csp_image_id = "ami-123".into();
        req.name = "Bad_Name".into();
        assert!(matches!(req.validate(), Err(CatalogError::Validation(_))));
    }

    #[test]
    fn convert_prefers_name_attribute() {
        let record = convert_provider_image(provider(
            "ami-0abc",
            &[
                ("Name", "ubuntu-20.04"),
                ("Description", "Canonical Ubuntu"),
                ("CreationDate", "2021-01-01T00:00:00Z"),
            ],
        ))
        .unwrap();

        assert_eq!(record.name, "ubuntu-20.04");
        assert_eq!(record.csp_image_id, "ami-0abc");
        assert_eq!(record.csp_image_name, "ubuntu-20.04");
        assert_eq!(record.description, "Canonical Ubuntu");
        assert_eq!(record.creation_date, "2021-01-01T00:00:00Z");
        assert_eq!(record.guest_os, "Ubuntu");
        assert_eq!(record.status, "available");
        assert_eq!(record.key_value_list.len(), 3);
        assert!(record.namespace.is_empty());
        assert!(record.id.is_empty());
        assert!(record.connection_name.is_empty());
    }

    #[test]
    fn convert_falls_back_to_name_id() {
        let record = convert_provider_image(provider("img-xyz", &[])).unwrap();
        assert_eq!(record.name, "img-xyz");
        assert_eq!(record.csp_image_name, "");
        assert_eq!(record.description, "");
    }

    #[test]
    fn convert_rejects_empty_name_id() {
        let err = convert_provider_image(provider("", &[("Name", "x")])).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidProviderRecord(_)));
    }

    #[test]
    fn merge_overwrites_only_set_fields() {
        let existing = CanonicalImageRecord {
            namespace: "ns1".into(),
            id: "img".into(),
            name: "img".into(),
            status: "available".into(),
            description: "old".into(),
            associated_object_list: vec!["vm-1".into()],
            ..Default::default()
        };
        let partial = CanonicalImageRecord {
            description: "new".into(),
            ..Default::default()
        };

        let merged = merge_image(&existing, partial).unwrap();
        assert_eq!(merged.status, "available");
        assert_eq!(merged.description, "new");
        assert_eq!(merged.namespace, "ns1");
        assert_eq!(merged.id, "img");
        assert_eq!(merged.associated_object_list, vec!["vm-1".to_string()]);
    }

    #[test]
    fn merge_rejects_immutable_fields() {
        let existing = CanonicalImageRecord::default();
        let ns_patch = CanonicalImageRecord {
            namespace: "other".into(),
            ..Default::default()
        };
        let id_patch = CanonicalImageRecord {
            id: "other".into(),
            ..Default::default()
        };
        assert_eq!(
            merge_image(&existing, ns_patch).unwrap_err(),
            CatalogError::ImmutableField("namespace")
        );
        assert_eq!(
            merge_image(&existing, id_patch).unwrap_err(),
            CatalogError::ImmutableField("id")
        );
    }

    #[test]
    fn resource_keys_are_scoped() {
        assert_eq!(
            resource_key("ns1", KIND_IMAGE, "img-1"),
            "/ns/ns1/resources/image/img-1"
        );
        assert!(resource_key("ns1", KIND_IMAGE, "x").starts_with(&resource_prefix("ns1", KIND_IMAGE)));
    }

    #[test]
    fn canonical_json_omits_defaults() {
        let record = CanonicalImageRecord {
            name: "img".into(),
            guest_os: "Ubuntu".into(),
            is_auto_generated: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"name": "img", "guestOS": "Ubuntu", "isAutoGenerated": true})
        );

        let back: CanonicalImageRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn provider_record_reads_driver_wire_shape() {
        let raw = r#"{
            "IId": {"NameId": "ami-1", "SystemId": "ami-1"},
            "GuestOS": "Ubuntu",
            "Status": "available",
            "KeyValueList": [{"Key": "Name", "Value": "ubuntu"}]
        }"#;
        let record: ProviderImageRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.iid.name_id, "ami-1");
        assert_eq!(record.name, "");
        assert_eq!(record.key_value_list, vec![KeyValue::new("Name", "ubuntu")]);
    }
}
