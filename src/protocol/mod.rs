//! Protocol definitions: versions, reserved methods, the capability catalog
//! and the JSON-RPC error code registry.

pub mod capabilities;
pub mod message;

/// Newest protocol revision this implementation speaks
pub const LATEST_VERSION: &str = "2025-06-18";

/// Supported protocol revisions, newest first
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26"];

/// Check whether a protocol revision is one we can speak.
pub fn version_supported(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

/// Responder-side version agreement: echo the requested revision when
/// supported, otherwise answer with our newest and let the initiator decide.
pub fn select_version(requested: &str) -> &'static str {
    SUPPORTED_VERSIONS
        .iter()
        .find(|v| **v == requested)
        .copied()
        .unwrap_or(LATEST_VERSION)
}

/// Reserved protocol method names
pub mod methods {
    // Lifecycle
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const SHUTDOWN: &str = "shutdown";

    // Utilities
    pub const PING: &str = "ping";
    pub const PROGRESS: &str = "notifications/progress";
    pub const CANCELLED: &str = "notifications/cancelled";

    // Gated feature methods (handlers are registered by the host)
    pub const LIST_TOOLS: &str = "tools/list";
    pub const CALL_TOOL: &str = "tools/call";
    pub const LIST_RESOURCES: &str = "resources/list";
    pub const READ_RESOURCE: &str = "resources/read";
    pub const LIST_PROMPTS: &str = "prompts/list";
    pub const GET_PROMPT: &str = "prompts/get";
}

/// Whether a method name is reserved by the engine itself.
///
/// Reserved methods cannot be registered with the dispatcher; they are
/// handled by the session state machine directly.
pub fn is_reserved(method: &str) -> bool {
    matches!(
        method,
        methods::INITIALIZE
            | methods::INITIALIZED
            | methods::SHUTDOWN
            | methods::PING
            | methods::PROGRESS
            | methods::CANCELLED
    )
}

/// The fixed method-to-capability mapping of the protocol catalog.
///
/// Methods outside the catalog carry no implicit gate; hosts may still
/// register them with an explicit required capability.
pub fn required_capability(method: &str) -> Option<&'static str> {
    match method {
        methods::LIST_TOOLS | methods::CALL_TOOL => Some(capabilities::TOOLS),
        methods::LIST_RESOURCES | methods::READ_RESOURCE => Some(capabilities::RESOURCES),
        methods::LIST_PROMPTS | methods::GET_PROMPT => Some(capabilities::PROMPTS),
        _ => None,
    }
}

/// JSON-RPC error codes used on the wire
pub mod error_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid request - The JSON sent is not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found - The method does not exist / is not available
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params - Invalid method parameter(s)
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error - Internal JSON-RPC error
    pub const INTERNAL_ERROR: i32 = -32603;

    // Implementation-defined codes (starting from -32000)
    /// Request received before the initialization handshake completed
    pub const NOT_INITIALIZED: i32 = -32002;
    /// Gated method invoked without the capability in the negotiated set
    pub const CAPABILITY_NOT_NEGOTIATED: i32 = -32003;
    /// Request received while the session is draining
    pub const SHUTTING_DOWN: i32 = -32004;
    /// Initialization failed on the protocol version check
    pub const VERSION_MISMATCH: i32 = -32005;
    /// The request was cancelled before completion
    pub const REQUEST_CANCELLED: i32 = -32800;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_selection_prefers_the_requested_revision() {
        assert_eq!(select_version("2025-03-26"), "2025-03-26");
        assert_eq!(select_version("2025-06-18"), "2025-06-18");
        // Unknown revisions fall back to our newest; the initiator decides.
        assert_eq!(select_version("1999-01-01"), LATEST_VERSION);
    }

    #[test]
    fn reserved_methods_cover_lifecycle_and_utilities() {
        assert!(is_reserved(methods::INITIALIZE));
        assert!(is_reserved(methods::INITIALIZED));
        assert!(is_reserved(methods::CANCELLED));
        assert!(!is_reserved(methods::CALL_TOOL));
        assert!(!is_reserved("vendor/custom"));
    }

    #[test]
    fn catalog_gates_feature_methods() {
        assert_eq!(required_capability(methods::CALL_TOOL), Some("tools"));
        assert_eq!(
            required_capability(methods::READ_RESOURCE),
            Some("resources")
        );
        assert_eq!(required_capability(methods::GET_PROMPT), Some("prompts"));
        assert_eq!(required_capability(methods::PING), None);
        assert_eq!(required_capability("vendor/custom"), None);
    }
}
