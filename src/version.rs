//! Protocol version negotiation table.
//!
//! Games declare a relay protocol version through the version-handshake
//! endpoint after startup. Each supported version maps to the feature set it
//! unlocks; sessions that never negotiate keep every feature disabled.

/// The version the relay itself speaks, suggested on mismatch.
pub const CURRENT_VERSION: &str = "1.0.0";

/// Feature flags unlocked by a negotiated protocol version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VersionFeatures {
    pub health_endpoint: bool,
    pub multiplexing: bool,
    pub custom_routing: bool,
}

const SUPPORTED: &[(&str, VersionFeatures)] = &[(
    "1.0.0",
    VersionFeatures {
        health_endpoint: true,
        multiplexing: true,
        custom_routing: true,
    },
)];

/// Look up the feature set for a declared version.
pub fn features_for(version: &str) -> Option<VersionFeatures> {
    SUPPORTED
        .iter()
        .find(|(v, _)| *v == version)
        .map(|(_, features)| *features)
}

/// All versions the relay accepts, for version-mismatch replies.
pub fn supported_versions() -> Vec<&'static str> {
    SUPPORTED.iter().map(|(v, _)| *v).collect()
}
