use serde::{Deserialize, Serialize};
use std::fmt;

/// Queue fields a policy can be keyed on.
///
/// `LocalIp` selects which warm-up bucket a predicate lives in; it is never
/// compared against a message attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MatchField {
    TransportId,
    LocalIp,
    RemoteIp,
    RemoteMx,
    RecipientDomain,
    JobId,
    Grouping,
    TenantId,
}

impl MatchField {
    /// Fields compared by warm-up predicates, in the order their values are stored.
    pub const CANONICAL: [MatchField; 7] = [
        MatchField::TransportId,
        MatchField::RemoteIp,
        MatchField::RemoteMx,
        MatchField::RecipientDomain,
        MatchField::JobId,
        MatchField::Grouping,
        MatchField::TenantId,
    ];

    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "TRANSPORTID" => Some(MatchField::TransportId),
            "LOCALIP" => Some(MatchField::LocalIp),
            "REMOTEIP" => Some(MatchField::RemoteIp),
            "REMOTEMX" => Some(MatchField::RemoteMx),
            "RECIPIENTDOMAIN" => Some(MatchField::RecipientDomain),
            "JOBID" => Some(MatchField::JobId),
            "GROUPING" => Some(MatchField::Grouping),
            "TENANTID" => Some(MatchField::TenantId),
            _ => None,
        }
    }

    /// Key of the field inside a policy's `if` object (and a suspend's body).
    pub fn selector_key(self) -> &'static str {
        match self {
            MatchField::TransportId => "transportid",
            MatchField::LocalIp => "localip",
            MatchField::RemoteIp => "remoteip",
            MatchField::RemoteMx => "remotemx",
            MatchField::RecipientDomain => "recipientdomain",
            MatchField::JobId => "jobid",
            MatchField::Grouping => "grouping",
            MatchField::TenantId => "tenantid",
        }
    }

    fn bit(self) -> u32 {
        match self {
            MatchField::TransportId => 1 << 0,
            MatchField::LocalIp => 1 << 1,
            MatchField::RemoteIp => 1 << 2,
            MatchField::RemoteMx => 1 << 3,
            MatchField::RecipientDomain => 1 << 4,
            MatchField::JobId => 1 << 5,
            MatchField::Grouping => 1 << 6,
            MatchField::TenantId => 1 << 7,
        }
    }
}

impl fmt::Display for MatchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchField::TransportId => "TRANSPORTID",
            MatchField::LocalIp => "LOCALIP",
            MatchField::RemoteIp => "REMOTEIP",
            MatchField::RemoteMx => "REMOTEMX",
            MatchField::RecipientDomain => "RECIPIENTDOMAIN",
            MatchField::JobId => "JOBID",
            MatchField::Grouping => "GROUPING",
            MatchField::TenantId => "TENANTID",
        })
    }
}

/// Bitmask of [`MatchField`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FieldMask(u32);

impl FieldMask {
    pub const EMPTY: FieldMask = FieldMask(0);

    pub fn with(mut self, field: MatchField) -> Self {
        self.insert(field);
        self
    }

    pub fn insert(&mut self, field: MatchField) {
        self.0 |= field.bit();
    }

    pub fn contains(self, field: MatchField) -> bool {
        self.0 & field.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Compared fields set in this mask, in canonical order.
    pub fn compared(self) -> impl Iterator<Item = MatchField> {
        MatchField::CANONICAL
            .into_iter()
            .filter(move |field| self.contains(*field))
    }
}

impl FromIterator<MatchField> for FieldMask {
    fn from_iter<I: IntoIterator<Item = MatchField>>(iter: I) -> Self {
        iter.into_iter().fold(FieldMask::EMPTY, FieldMask::with)
    }
}
