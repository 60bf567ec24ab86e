//! Capability sets and handshake payloads
//!
//! Each side declares a capability set during the initialize exchange; the
//! negotiated set is the intersection and is frozen for the session's
//! lifetime. Capability names come from the fixed protocol catalog; unknown
//! names are carried through negotiation untouched and simply never
//! intersect unless both sides declare them.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

// Catalog capability names
pub const TOOLS: &str = "tools";
pub const RESOURCES: &str = "resources";
pub const PROMPTS: &str = "prompts";
pub const LOGGING: &str = "logging";
pub const EXPERIMENTAL: &str = "experimental";

// Catalog sub-option flags
pub const LIST_CHANGED: &str = "listChanged";
pub const SUBSCRIBE: &str = "subscribe";

/// Sub-option flags declared for a single capability
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityOptions {
    #[serde(flatten)]
    flags: BTreeMap<String, bool>,
}

impl CapabilityOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flag(mut self, flag: &str) -> Self {
        self.flags.insert(flag.to_string(), true);
        self
    }

    pub fn enabled(&self, flag: &str) -> bool {
        self.flags.get(flag).copied().unwrap_or(false)
    }

    /// Flags both sides declared enabled.
    fn intersect(&self, other: &CapabilityOptions) -> CapabilityOptions {
        let flags = self
            .flags
            .iter()
            .filter(|(flag, on)| **on && other.enabled(flag))
            .map(|(flag, _)| (flag.clone(), true))
            .collect();
        CapabilityOptions { flags }
    }
}

/// A set of declared capabilities, keyed by catalog name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    #[serde(flatten)]
    entries: BTreeMap<String, CapabilityOptions>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a capability with no sub-options.
    pub fn declare(self, name: &str) -> Self {
        self.declare_with(name, CapabilityOptions::new())
    }

    /// Declare a capability with its sub-option flags.
    pub fn declare_with(mut self, name: &str, options: CapabilityOptions) -> Self {
        self.entries.insert(name.to_string(), options);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn options(&self, name: &str) -> Option<&CapabilityOptions> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The agreement between two declared sets: a capability is present only
    /// if both sides declared it, with the intersection of its sub-options.
    pub fn negotiate(&self, other: &CapabilitySet) -> CapabilitySet {
        let entries = self
            .entries
            .iter()
            .filter_map(|(name, options)| {
                other
                    .entries
                    .get(name)
                    .map(|theirs| (name.clone(), options.intersect(theirs)))
            })
            .collect();
        CapabilitySet { entries }
    }
}

/// Identifying information exchanged during the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub version: String,
}

impl PeerInfo {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
        }
    }
}

/// `initialize` request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: CapabilitySet,
    #[serde(rename = "clientInfo")]
    pub client_info: PeerInfo,
}

/// `initialize` response payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: CapabilitySet,
    #[serde(rename = "serverInfo")]
    pub server_info: PeerInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// The frozen outcome of a completed handshake
#[derive(Debug, Clone)]
pub struct NegotiatedCapabilities {
    /// Agreed protocol revision
    pub protocol_version: String,
    /// Intersection of both declared sets
    pub capabilities: CapabilitySet,
    /// The peer's identifying information
    pub peer: PeerInfo,
}

impl NegotiatedCapabilities {
    /// Whether a capability survived negotiation.
    pub fn allows(&self, name: &str) -> bool {
        self.capabilities.contains(name)
    }

    /// Names in the negotiated set, for diagnostics.
    pub fn names(&self) -> BTreeSet<&str> {
        self.capabilities.names().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_is_the_intersection_of_declared_names() {
        let client = CapabilitySet::new().declare(TOOLS);
        let server = CapabilitySet::new().declare(TOOLS).declare(RESOURCES);

        let negotiated = client.negotiate(&server);
        assert!(negotiated.contains(TOOLS));
        assert!(!negotiated.contains(RESOURCES));

        // Negotiation is symmetric.
        assert_eq!(negotiated, server.negotiate(&client));
    }

    #[test]
    fn sub_options_intersect_per_capability() {
        let mine = CapabilitySet::new().declare_with(
            RESOURCES,
            CapabilityOptions::new()
                .with_flag(SUBSCRIBE)
                .with_flag(LIST_CHANGED),
        );
        let theirs = CapabilitySet::new()
            .declare_with(RESOURCES, CapabilityOptions::new().with_flag(SUBSCRIBE));

        let negotiated = mine.negotiate(&theirs);
        let options = negotiated.options(RESOURCES).unwrap();
        assert!(options.enabled(SUBSCRIBE));
        assert!(!options.enabled(LIST_CHANGED));
    }

    #[test]
    fn unknown_capability_names_pass_through_when_shared() {
        let mine = CapabilitySet::new().declare("vendor/streaming");
        let theirs = CapabilitySet::new().declare("vendor/streaming");
        assert!(mine.negotiate(&theirs).contains("vendor/streaming"));

        let unshared = CapabilitySet::new();
        assert!(mine.negotiate(&unshared).is_empty());
    }

    #[test]
    fn capability_set_serializes_as_a_flat_object() {
        let set = CapabilitySet::new()
            .declare_with(TOOLS, CapabilityOptions::new().with_flag(LIST_CHANGED))
            .declare(LOGGING);
        let value = serde_json::to_value(&set).unwrap();
        assert_eq!(value["tools"]["listChanged"], serde_json::json!(true));
        assert!(value["logging"].is_object());

        let back: CapabilitySet = serde_json::from_value(value).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn initialize_payloads_use_wire_field_names() {
        let params = InitializeParams {
            protocol_version: "2025-06-18".to_string(),
            capabilities: CapabilitySet::new().declare(TOOLS),
            client_info: PeerInfo::new("probe", "0.1.0"),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert!(value.get("protocolVersion").is_some());
        assert!(value.get("clientInfo").is_some());
    }
}
