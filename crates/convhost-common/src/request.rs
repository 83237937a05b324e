//! Migration request model and validation
//!
//! A request is a JSON document naming the VM to migrate, the source and
//! destination platforms with their (opaque) credentials, and the storage and
//! network mappings. Validation runs on the raw JSON so that every problem is
//! reported at once instead of failing on the first missing key.

use crate::error::{CommonError, Result};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Supported source platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Vmware,
    Local,
}

impl SourceKind {
    const ALL: [(&'static str, SourceKind); 2] =
        [("vmware", SourceKind::Vmware), ("local", SourceKind::Local)];

    fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, kind)| *kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Vmware => "vmware",
            SourceKind::Local => "local",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported destination platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Ovirt,
    Openstack,
    Local,
}

impl DestinationKind {
    const ALL: [(&'static str, DestinationKind); 3] = [
        ("ovirt", DestinationKind::Ovirt),
        ("openstack", DestinationKind::Openstack),
        ("local", DestinationKind::Local),
    ];

    fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, kind)| *kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::Ovirt => "ovirt",
            DestinationKind::Openstack => "openstack",
            DestinationKind::Local => "local",
        }
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side (source or destination) of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideRequest<K> {
    #[serde(rename = "type")]
    pub kind: K,
    pub transport_method: String,
    /// Credentials, passed through to the provider untouched
    pub authentication: Value,
    /// Provider-specific keys (`root`, `cluster`, `project`, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl<K> SideRequest<K> {
    /// Look up a provider-specific string option
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

/// Storage and network name mappings from source to destination
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mappings {
    #[serde(default)]
    pub storage: BTreeMap<String, String>,
    #[serde(default)]
    pub network: BTreeMap<String, String>,
}

/// A validated migration request. Never mutated after loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRequest {
    /// Id of the staging VM the destination disks get attached to
    pub conversion_host_uuid: String,
    pub vm_name: String,
    pub vm_uuid: String,
    pub source: SideRequest<SourceKind>,
    pub destination: SideRequest<DestinationKind>,
    #[serde(default)]
    pub mappings: Mappings,
}

impl MigrationRequest {
    /// Validate a raw JSON request and convert it into the typed model
    pub fn from_value(value: Value) -> Result<Self> {
        let problems = RequestValidator::new(&value).validate();
        if !problems.is_empty() {
            return Err(CommonError::InvalidRequest(problems));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Read and validate a request file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CommonError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_value(serde_json::from_str(&text)?)
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Collects every problem in a raw request
pub struct RequestValidator<'a> {
    request: &'a Value,
    errors: Vec<String>,
}

impl<'a> RequestValidator<'a> {
    pub fn new(request: &'a Value) -> Self {
        Self {
            request,
            errors: Vec::new(),
        }
    }

    /// Run all checks. Returns the problems in discovery order, without
    /// duplicates; an empty list means the request is valid.
    pub fn validate(mut self) -> Vec<String> {
        for key in ["conversion_host_uuid", "vm_name", "vm_uuid"] {
            if self.request.get(key).is_none() {
                self.errors.push(format!("Missing '{key}' key in request"));
            }
        }

        self.validate_source();
        self.validate_destination();

        let mut seen = std::collections::HashSet::new();
        self.errors.retain(|e| seen.insert(e.clone()));
        self.errors
    }

    fn validate_source(&mut self) {
        let Some(side) = self.request.get("source") else {
            self.errors.push("Missing 'source' key in request".to_string());
            return;
        };
        let kind = self.validate_side(side, "source", |name| {
            SourceKind::parse(name).map(|_| ()).ok_or_else(|| {
                format!("Source type '{name}' is not supported")
            })
        });
        match kind.as_deref().and_then(SourceKind::parse) {
            Some(SourceKind::Vmware) => self.validate_vmware_source(side),
            Some(SourceKind::Local) => {
                self.validate_local_side(side, "source", &["file", "nbdkit"]);
            }
            None => {}
        }
    }

    fn validate_destination(&mut self) {
        let Some(side) = self.request.get("destination") else {
            self.errors
                .push("Missing 'destination' in request".to_string());
            return;
        };
        let kind = self.validate_side(side, "destination", |name| {
            DestinationKind::parse(name).map(|_| ()).ok_or_else(|| {
                format!("Destination type '{name}' is not supported")
            })
        });
        match kind.as_deref().and_then(DestinationKind::parse) {
            Some(DestinationKind::Ovirt) => self.validate_ovirt_destination(side),
            Some(DestinationKind::Openstack) => self.validate_openstack_destination(side),
            Some(DestinationKind::Local) => {
                self.validate_local_side(side, "destination", &["file"]);
            }
            None => {}
        }
    }

    /// Checks common to both sides; returns the type name when present
    fn validate_side(
        &mut self,
        side: &Value,
        label: &str,
        supported: impl Fn(&str) -> std::result::Result<(), String>,
    ) -> Option<String> {
        let kind = match side.get("type").and_then(Value::as_str) {
            Some(name) => {
                if let Err(e) = supported(name) {
                    self.errors.push(e);
                }
                Some(name.to_string())
            }
            None => {
                self.errors
                    .push(format!("Missing 'type' key in request['{label}']"));
                None
            }
        };

        if side.get("transport_method").is_none() {
            self.errors.push(format!(
                "Missing 'transport_method' key in request['{label}']"
            ));
        }
        if side.get("authentication").is_none() {
            self.errors
                .push(format!("Missing 'authentication' in request['{label}']"));
        }
        kind
    }

    fn check_transport(&mut self, side: &Value, supported: &[&str], suffix: &str) -> Option<String> {
        let method = side.get("transport_method").and_then(Value::as_str)?;
        if supported.contains(&method) {
            Some(method.to_string())
        } else {
            self.errors
                .push(format!("Transport method '{method}' is not supported{suffix}"));
            None
        }
    }

    fn require_keys(&mut self, value: Option<&Value>, keys: &[&str], location: &str) {
        for key in keys {
            if value.and_then(|v| v.get(key)).is_none() {
                self.errors
                    .push(format!("Missing '{key}' in {location}"));
            }
        }
    }

    fn validate_vmware_source(&mut self, side: &Value) {
        let auth = side.get("authentication");
        for name in ["manager", "host"] {
            match auth.and_then(|a| a.get(name)) {
                None => self.errors.push(format!(
                    "Missing '{name}' in request['source']['authentication']"
                )),
                Some(section) => {
                    if section.get("hostname").is_none() {
                        self.errors.push(format!(
                            "Missing 'hostname' in request['source']['authentication']['{name}']"
                        ));
                    }
                }
            }
        }

        let host = auth.and_then(|a| a.get("host"));
        let location = "request['source']['authentication']['host']";
        match self.check_transport(side, &["vddk", "ssh"], "").as_deref() {
            Some("vddk") => self.require_keys(host, &["username", "password"], location),
            Some("ssh") => self.require_keys(host, &["username", "ssh_key"], location),
            _ => {}
        }
    }

    fn validate_local_side(&mut self, side: &Value, label: &str, transports: &[&str]) {
        self.require_keys(Some(side), &["root"], &format!("request['{label}']"));
        self.check_transport(side, transports, "");
    }

    fn validate_ovirt_destination(&mut self, side: &Value) {
        let manager = side.get("authentication").and_then(|a| a.get("manager"));
        if manager.is_none() {
            self.errors.push(
                "Missing 'manager' in request['destination']['authentication']".to_string(),
            );
        } else {
            self.require_keys(
                manager,
                &["hostname", "username", "password"],
                "request['destination']['authentication']['manager']",
            );
        }
        self.check_transport(side, &["upload_api"], "");
        self.require_keys(Some(side), &["cluster", "storage"], "request['destination']");
    }

    fn validate_openstack_destination(&mut self, side: &Value) {
        if self
            .check_transport(side, &["cinder"], " with openstack as destination")
            .is_some()
        {
            self.require_keys(
                side.get("authentication"),
                &["domain", "username", "password", "project_name"],
                "request['destination']['authentication']",
            );
        }
        self.require_keys(
            Some(side),
            &[
                "project",
                "volume_type",
                "flavor",
                "security_groups",
                "network_ports",
            ],
            "request['destination']",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn local_request() -> Value {
        json!({
            "conversion_host_uuid": "staging-1",
            "vm_name": "web01",
            "vm_uuid": "4210c3a1-0000-0000-0000-000000000001",
            "source": {
                "type": "local",
                "transport_method": "file",
                "authentication": {},
                "root": "/srv/source"
            },
            "destination": {
                "type": "local",
                "transport_method": "file",
                "authentication": {},
                "root": "/srv/destination"
            },
            "mappings": {
                "storage": {"datastore1": "fast"},
                "network": {"VM Network": "ovirtmgmt"}
            }
        })
    }

    #[test]
    fn test_valid_local_request() {
        let request = MigrationRequest::from_value(local_request()).unwrap();
        assert_eq!(request.vm_name, "web01");
        assert_eq!(request.source.kind, SourceKind::Local);
        assert_eq!(request.destination.kind, DestinationKind::Local);
        assert_eq!(request.source.option_str("root"), Some("/srv/source"));
        assert_eq!(request.mappings.storage["datastore1"], "fast");
    }

    #[test]
    fn test_missing_top_level_keys_are_all_reported() {
        let problems = RequestValidator::new(&json!({})).validate();
        assert_eq!(
            problems,
            vec![
                "Missing 'conversion_host_uuid' key in request",
                "Missing 'vm_name' key in request",
                "Missing 'vm_uuid' key in request",
                "Missing 'source' key in request",
                "Missing 'destination' in request",
            ]
        );
    }

    #[test]
    fn test_unsupported_types() {
        let mut request = local_request();
        request["source"]["type"] = json!("hyperv");
        request["destination"]["type"] = json!("nutanix");
        let problems = RequestValidator::new(&request).validate();
        assert!(problems.contains(&"Source type 'hyperv' is not supported".to_string()));
        assert!(problems.contains(&"Destination type 'nutanix' is not supported".to_string()));
    }

    #[test]
    fn test_vmware_vddk_requires_host_credentials() {
        let mut request = local_request();
        request["source"] = json!({
            "type": "vmware",
            "transport_method": "vddk",
            "authentication": {
                "manager": {"hostname": "vcenter.example.com"},
                "host": {"hostname": "esx1.example.com", "username": "root"}
            }
        });
        let problems = RequestValidator::new(&request).validate();
        assert_eq!(
            problems,
            vec!["Missing 'password' in request['source']['authentication']['host']"]
        );
    }

    #[test]
    fn test_vmware_missing_sections_and_bad_transport() {
        let mut request = local_request();
        request["source"] = json!({
            "type": "vmware",
            "transport_method": "nfc",
            "authentication": {"manager": {}}
        });
        let problems = RequestValidator::new(&request).validate();
        assert_eq!(
            problems,
            vec![
                "Missing 'hostname' in request['source']['authentication']['manager']",
                "Missing 'host' in request['source']['authentication']",
                "Transport method 'nfc' is not supported",
            ]
        );
    }

    #[test]
    fn test_ovirt_destination_requirements() {
        let mut request = local_request();
        request["destination"] = json!({
            "type": "ovirt",
            "transport_method": "upload_api",
            "authentication": {"manager": {"hostname": "engine", "username": "admin@internal"}},
            "cluster": "Default"
        });
        let problems = RequestValidator::new(&request).validate();
        assert_eq!(
            problems,
            vec![
                "Missing 'password' in request['destination']['authentication']['manager']",
                "Missing 'storage' in request['destination']",
            ]
        );
    }

    #[test]
    fn test_openstack_destination_requirements() {
        let mut request = local_request();
        request["destination"] = json!({
            "type": "openstack",
            "transport_method": "cinder",
            "authentication": {"domain": "default", "username": "admin", "password": "x"},
            "project": "p",
            "volume_type": "ceph",
            "flavor": "m1.small",
            "security_groups": []
        });
        let problems = RequestValidator::new(&request).validate();
        assert_eq!(
            problems,
            vec![
                "Missing 'project_name' in request['destination']['authentication']",
                "Missing 'network_ports' in request['destination']",
            ]
        );
    }

    #[test]
    fn test_from_value_rejects_invalid() {
        let mut request = local_request();
        request.as_object_mut().unwrap().remove("vm_uuid");
        request["source"].as_object_mut().unwrap().remove("root");
        let err = MigrationRequest::from_value(request).unwrap_err();
        match err {
            CommonError::InvalidRequest(problems) => {
                assert_eq!(
                    problems,
                    vec![
                        "Missing 'vm_uuid' key in request",
                        "Missing 'root' in request['source']",
                    ]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("request.json");
        std::fs::write(&path, local_request().to_string()).unwrap();
        let request = MigrationRequest::load(&path).unwrap();
        assert_eq!(request.conversion_host_uuid, "staging-1");
    }
}
