//! Keeper wire protocol.
//!
//! Every frame is one JSON document. Decoding never fails: a frame that does
//! not parse, or a field with the wrong type, reads as absent and falls back
//! to its default, so malformed input degrades to a no-op command.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::fields::{FieldMask, MatchField};

/// Keeper protocol version accepted by the `V1` revision.
pub const SUPPORTED_VERSION: u64 = 1;

/// Keeper dialects understood by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolRevision {
    /// Warm-up only dialect: no version handshake, policies only, all of kind WARMUP.
    Legacy,
    #[default]
    V1,
}

impl ProtocolRevision {
    pub fn requires_version_handshake(self) -> bool {
        matches!(self, ProtocolRevision::V1)
    }

    pub fn supports_suspends(self) -> bool {
        matches!(self, ProtocolRevision::V1)
    }

    /// Whether directives that fail before the first SYNCED abort startup.
    /// Legacy keepers are applied best-effort.
    pub fn apply_errors_are_fatal(self) -> bool {
        matches!(self, ProtocolRevision::V1)
    }

    /// Bucket a warm-up predicate is registered under, if any.
    pub fn warmup_address(self, local_ip: Option<&str>) -> Option<String> {
        match (self, local_ip) {
            (_, Some(address)) => Some(address.to_string()),
            (ProtocolRevision::Legacy, None) => Some(String::new()),
            (ProtocolRevision::V1, None) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Policy,
    Suspend,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Policy => f.write_str("policy"),
            Kind::Suspend => f.write_str("suspend"),
        }
    }
}

/// Key of a keeper directive, unique within its kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier {
    pub kind: Kind,
    pub id: String,
}

impl Identifier {
    pub fn policy(id: impl Into<String>) -> Self {
        Identifier {
            kind: Kind::Policy,
            id: id.into(),
        }
    }

    pub fn suspend(id: impl Into<String>) -> Self {
        Identifier {
            kind: Kind::Suspend,
            id: id.into(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PolicyKind {
    #[default]
    Dynamic,
    Warmup,
    Backoff,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RateAlgorithm {
    #[default]
    Default,
    FixedWindow,
    TokenBucket,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rate {
    pub count: u64,
    pub interval: f64,
    pub algorithm: RateAlgorithm,
}

/// Optional selectors shared by the policy `if` object and suspend bodies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pub transport_id: Option<String>,
    pub local_ip: Option<String>,
    pub remote_ip: Option<String>,
    pub remote_mx: Option<String>,
    pub recipient_domain: Option<String>,
    pub job_id: Option<String>,
    pub grouping: Option<String>,
    pub tenant_id: Option<String>,
}

impl Selector {
    pub fn get(&self, field: MatchField) -> Option<&str> {
        let value = match field {
            MatchField::TransportId => &self.transport_id,
            MatchField::LocalIp => &self.local_ip,
            MatchField::RemoteIp => &self.remote_ip,
            MatchField::RemoteMx => &self.remote_mx,
            MatchField::RecipientDomain => &self.recipient_domain,
            MatchField::JobId => &self.job_id,
            MatchField::Grouping => &self.grouping,
            MatchField::TenantId => &self.tenant_id,
        };
        value.as_deref()
    }

    fn slot(&mut self, field: MatchField) -> &mut Option<String> {
        match field {
            MatchField::TransportId => &mut self.transport_id,
            MatchField::LocalIp => &mut self.local_ip,
            MatchField::RemoteIp => &mut self.remote_ip,
            MatchField::RemoteMx => &mut self.remote_mx,
            MatchField::RecipientDomain => &mut self.recipient_domain,
            MatchField::JobId => &mut self.job_id,
            MatchField::Grouping => &mut self.grouping,
            MatchField::TenantId => &mut self.tenant_id,
        }
    }

    fn decode(object: &Value) -> Self {
        let mut selector = Selector::default();
        for field in std::iter::once(MatchField::LocalIp).chain(MatchField::CANONICAL) {
            *selector.slot(field) = string_at(object, field.selector_key());
        }
        selector
    }
}

/// What a policy does once matched. Also the payload of an update.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySettings {
    pub concurrency: u64,
    pub rate: Rate,
    pub connect_interval: f64,
    pub tag: Option<String>,
    pub properties: Vec<(String, String)>,
    pub stop: bool,
    pub cluster: bool,
    pub ttl: f64,
}

impl Default for PolicySettings {
    fn default() -> Self {
        PolicySettings {
            concurrency: 0,
            rate: Rate::default(),
            connect_interval: 0.0,
            tag: None,
            properties: Vec::new(),
            stop: false,
            cluster: true,
            ttl: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRecord {
    pub id: String,
    pub kind: PolicyKind,
    pub fields: FieldMask,
    pub selector: Selector,
    pub settings: PolicySettings,
}

impl PolicyRecord {
    pub fn identifier(&self) -> Identifier {
        Identifier::policy(self.id.clone())
    }

    /// Expected message values for every compared field, in canonical order.
    /// A field without a selector value expects the empty string.
    pub fn match_values(&self) -> Vec<String> {
        self.fields
            .compared()
            .map(|field| self.selector.get(field).unwrap_or_default().to_string())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SuspendRecord {
    pub id: String,
    pub warmup: bool,
    pub selector: Selector,
    pub tag: Option<String>,
    pub properties: Vec<(String, String)>,
    pub ttl: f64,
}

impl SuspendRecord {
    pub fn identifier(&self) -> Identifier {
        Identifier::suspend(self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Policy(PolicyRecord),
    Suspend(SuspendRecord),
    Unsupported,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Version(u64),
    Create(Directive),
    /// `None` when the frame carried no policy payload.
    Update(Option<PolicyRecord>),
    /// `None` when the frame carried neither a policy nor a suspend id.
    Delete(Option<Identifier>),
    Synced,
    Ignored,
}

/// Turns keeper frames into [`Command`]s for one protocol revision.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decoder {
    revision: ProtocolRevision,
}

impl Decoder {
    pub fn new(revision: ProtocolRevision) -> Self {
        Decoder { revision }
    }

    pub fn revision(&self) -> ProtocolRevision {
        self.revision
    }

    pub fn decode(&self, frame: &str) -> Command {
        let root: Value = serde_json::from_str(frame).unwrap_or(Value::Null);

        match root.get("action").and_then(Value::as_str).unwrap_or_default() {
            "VERSION" if self.revision.requires_version_handshake() => {
                Command::Version(u64_at(&root, "/version"))
            }
            "CREATE" => Command::Create(self.directive(&root)),
            "UPDATE" => Command::Update(present(&root, "policy").map(|p| self.policy(p))),
            "DELETE" => Command::Delete(self.identifier(&root)),
            "SYNCED" => Command::Synced,
            _ => Command::Ignored,
        }
    }

    fn directive(&self, root: &Value) -> Directive {
        if let Some(policy) = present(root, "policy") {
            return Directive::Policy(self.policy(policy));
        }
        match present(root, "suspend") {
            Some(suspend) if self.revision.supports_suspends() => {
                Directive::Suspend(suspend_record(suspend))
            }
            _ => Directive::Unsupported,
        }
    }

    fn identifier(&self, root: &Value) -> Option<Identifier> {
        if let Some(policy) = present(root, "policy") {
            return Some(Identifier::policy(id_of(policy)));
        }
        present(root, "suspend")
            .filter(|_| self.revision.supports_suspends())
            .map(|suspend| Identifier::suspend(id_of(suspend)))
    }

    fn policy(&self, policy: &Value) -> PolicyRecord {
        let fields: FieldMask = policy
            .get("fields")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .filter_map(MatchField::from_wire)
            .collect();

        let selector = policy.get("if").map(Selector::decode).unwrap_or_default();

        let (kind, rate) = match self.revision {
            ProtocolRevision::V1 => (
                policy_kind(&string_at(policy, "type").unwrap_or_default()),
                Rate {
                    count: u64_at(policy, "/then/rate/count"),
                    interval: f64_at(policy, "/then/rate/interval"),
                    algorithm: rate_algorithm(
                        &string_at_pointer(policy, "/then/rate/algorithm").unwrap_or_default(),
                    ),
                },
            ),
            ProtocolRevision::Legacy => (
                PolicyKind::Warmup,
                Rate {
                    count: u64_at(policy, "/then/tokens"),
                    interval: f64_at(policy, "/then/interval"),
                    algorithm: RateAlgorithm::Default,
                },
            ),
        };

        PolicyRecord {
            id: id_of(policy),
            kind,
            fields,
            selector,
            settings: PolicySettings {
                concurrency: u64_at(policy, "/then/concurrency"),
                rate,
                connect_interval: f64_at(policy, "/then/connectinterval"),
                tag: string_at_pointer(policy, "/then/tag"),
                properties: properties(policy.pointer("/then/properties")),
                stop: bool_at(policy, "/then/stop", false),
                cluster: bool_at(policy, "/then/cluster", true),
                ttl: f64_at(policy, "/ttl"),
            },
        }
    }
}

fn suspend_record(suspend: &Value) -> SuspendRecord {
    SuspendRecord {
        id: id_of(suspend),
        warmup: string_at(suspend, "type").as_deref() == Some("WARMUP"),
        selector: Selector::decode(suspend),
        tag: string_at(suspend, "tag"),
        properties: properties(suspend.get("properties")),
        ttl: f64_at(suspend, "/ttl"),
    }
}

fn policy_kind(name: &str) -> PolicyKind {
    match name {
        "WARMUP" => PolicyKind::Warmup,
        "BACKOFF" => PolicyKind::Backoff,
        _ => PolicyKind::Dynamic,
    }
}

fn rate_algorithm(name: &str) -> RateAlgorithm {
    match name {
        "FIXEDWINDOW" => RateAlgorithm::FixedWindow,
        "TOKENBUCKET" => RateAlgorithm::TokenBucket,
        _ => RateAlgorithm::Default,
    }
}

fn present<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
    root.get(key).filter(|value| !value.is_null())
}

fn id_of(object: &Value) -> String {
    match object.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        Some(Value::Bool(id)) => id.to_string(),
        _ => String::new(),
    }
}

fn string_at(object: &Value, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}

fn string_at_pointer(object: &Value, pointer: &str) -> Option<String> {
    object
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn u64_at(object: &Value, pointer: &str) -> u64 {
    match object.pointer(pointer) {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        _ => 0,
    }
}

fn f64_at(object: &Value, pointer: &str) -> f64 {
    object
        .pointer(pointer)
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

fn bool_at(object: &Value, pointer: &str, default: bool) -> bool {
    object
        .pointer(pointer)
        .and_then(Value::as_bool)
        .unwrap_or(default)
}

fn properties(object: Option<&Value>) -> Vec<(String, String)> {
    let Some(Value::Object(map)) = object else {
        return Vec::new();
    };
    map.iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(frame: Value) -> Command {
        Decoder::default().decode(&frame.to_string())
    }

    #[test]
    fn test_malformed_frames_are_ignored() {
        let decoder = Decoder::default();
        assert_eq!(decoder.decode("not json at all"), Command::Ignored);
        assert_eq!(decoder.decode(""), Command::Ignored);
        assert_eq!(decoder.decode("[1,2,3]"), Command::Ignored);
        assert_eq!(decoder.decode(r#"{"action": 42}"#), Command::Ignored);
        assert_eq!(decoder.decode(r#"{"action": "REBOOT"}"#), Command::Ignored);
    }

    #[test]
    fn test_version_defaults_to_zero() {
        assert_eq!(decode(json!({"action": "VERSION", "version": 1})), Command::Version(1));
        assert_eq!(decode(json!({"action": "VERSION"})), Command::Version(0));
        assert_eq!(
            decode(json!({"action": "VERSION", "version": "1"})),
            Command::Version(0)
        );
    }

    #[test]
    fn test_create_policy_full() {
        let command = decode(json!({
            "action": "CREATE",
            "policy": {
                "id": "p-1",
                "type": "WARMUP",
                "fields": ["LOCALIP", "RECIPIENTDOMAIN", "REMOTEIP"],
                "if": {
                    "localip": "10.0.0.1",
                    "remoteip": "1.2.3.4",
                    "recipientdomain": "example.com"
                },
                "then": {
                    "concurrency": 5,
                    "rate": {"count": 10, "interval": 60.5, "algorithm": "TOKENBUCKET"},
                    "connectinterval": 2,
                    "tag": "warm",
                    "properties": {"owner": "ops", "tier": 2},
                    "stop": true,
                    "cluster": false
                },
                "ttl": 3600
            }
        }));

        let Command::Create(Directive::Policy(policy)) = command else {
            panic!("Expected policy create, got {command:?}");
        };
        assert_eq!(policy.id, "p-1");
        assert_eq!(policy.kind, PolicyKind::Warmup);
        assert!(policy.fields.contains(MatchField::LocalIp));
        assert_eq!(policy.selector.local_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(policy.match_values(), vec!["1.2.3.4", "example.com"]);
        assert_eq!(policy.settings.concurrency, 5);
        assert_eq!(policy.settings.rate.count, 10);
        assert_eq!(policy.settings.rate.interval, 60.5);
        assert_eq!(policy.settings.rate.algorithm, RateAlgorithm::TokenBucket);
        assert_eq!(policy.settings.connect_interval, 2.0);
        assert_eq!(policy.settings.tag.as_deref(), Some("warm"));
        assert_eq!(
            policy.settings.properties,
            vec![
                ("owner".to_string(), "ops".to_string()),
                ("tier".to_string(), "2".to_string())
            ]
        );
        assert!(policy.settings.stop);
        assert!(!policy.settings.cluster);
        assert_eq!(policy.settings.ttl, 3600.0);
    }

    #[test]
    fn test_create_policy_defaults() {
        let command = decode(json!({
            "action": "CREATE",
            "policy": {"id": 7, "fields": "REMOTEIP", "then": {"concurrency": "lots"}}
        }));
        let Command::Create(Directive::Policy(policy)) = command else {
            panic!("Expected policy create, got {command:?}");
        };
        assert_eq!(policy.id, "7");
        assert_eq!(policy.kind, PolicyKind::Dynamic);
        assert!(policy.fields.is_empty());
        assert_eq!(policy.selector, Selector::default());
        assert_eq!(policy.settings, PolicySettings::default());
        assert!(policy.settings.cluster);
    }

    #[test]
    fn test_missing_selector_value_matches_empty_string() {
        let command = decode(json!({
            "action": "CREATE",
            "policy": {"id": "p", "fields": ["JOBID", "TRANSPORTID"], "if": {"transportid": "mx"}}
        }));
        let Command::Create(Directive::Policy(policy)) = command else {
            panic!("Expected policy create");
        };
        assert_eq!(policy.match_values(), vec!["mx", ""]);
    }

    #[test]
    fn test_create_suspend() {
        let command = decode(json!({
            "action": "CREATE",
            "suspend": {
                "id": "s-1",
                "type": "WARMUP",
                "localip": "10.0.0.9",
                "recipientdomain": "example.org",
                "tag": "hold",
                "properties": {"reason": "bounce"},
                "ttl": 30
            }
        }));
        let Command::Create(Directive::Suspend(suspend)) = command else {
            panic!("Expected suspend create, got {command:?}");
        };
        assert_eq!(suspend.id, "s-1");
        assert!(suspend.warmup);
        assert_eq!(suspend.selector.local_ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(suspend.selector.recipient_domain.as_deref(), Some("example.org"));
        assert_eq!(suspend.tag.as_deref(), Some("hold"));
        assert_eq!(suspend.ttl, 30.0);
    }

    #[test]
    fn test_create_without_payload_is_unsupported() {
        assert_eq!(
            decode(json!({"action": "CREATE"})),
            Command::Create(Directive::Unsupported)
        );
        assert_eq!(
            decode(json!({"action": "CREATE", "policy": null})),
            Command::Create(Directive::Unsupported)
        );
    }

    #[test]
    fn test_update_and_delete() {
        assert_eq!(decode(json!({"action": "UPDATE"})), Command::Update(None));
        assert!(matches!(
            decode(json!({"action": "UPDATE", "policy": {"id": "p"}})),
            Command::Update(Some(ref p)) if p.id == "p"
        ));
        assert_eq!(
            decode(json!({"action": "DELETE", "policy": {"id": "p"}})),
            Command::Delete(Some(Identifier::policy("p")))
        );
        assert_eq!(
            decode(json!({"action": "DELETE", "suspend": {"id": "s"}})),
            Command::Delete(Some(Identifier::suspend("s")))
        );
        assert_eq!(decode(json!({"action": "DELETE"})), Command::Delete(None));
        assert_eq!(decode(json!({"action": "SYNCED"})), Command::Synced);
    }

    #[test]
    fn test_legacy_dialect() {
        let decoder = Decoder::new(ProtocolRevision::Legacy);
        assert_eq!(
            decoder.decode(r#"{"action":"VERSION","version":9}"#),
            Command::Ignored
        );
        assert_eq!(
            decoder.decode(r#"{"action":"CREATE","suspend":{"id":"s"}}"#),
            Command::Create(Directive::Unsupported)
        );
        assert_eq!(
            decoder.decode(r#"{"action":"DELETE","suspend":{"id":"s"}}"#),
            Command::Delete(None)
        );

        let command = decoder.decode(
            r#"{"action":"CREATE","policy":{"id":"p","type":"DYNAMIC","then":{"tokens":4,"interval":1.5}}}"#,
        );
        let Command::Create(Directive::Policy(policy)) = command else {
            panic!("Expected policy create");
        };
        assert_eq!(policy.kind, PolicyKind::Warmup);
        assert_eq!(policy.settings.rate.count, 4);
        assert_eq!(policy.settings.rate.interval, 1.5);
    }

    #[test]
    fn test_warmup_address_per_revision() {
        assert_eq!(ProtocolRevision::V1.warmup_address(None), None);
        assert_eq!(
            ProtocolRevision::Legacy.warmup_address(None),
            Some(String::new())
        );
        assert_eq!(
            ProtocolRevision::V1.warmup_address(Some("10.0.0.1")),
            Some("10.0.0.1".to_string())
        );
    }
}
