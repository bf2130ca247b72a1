//! Wire protocol types shared by both transport directions.
//!
//! Frames are JSON objects with a common envelope:
//!
//! ```json
//! { "command": "<string>", "game": "<optional>", "data": { ... } }
//! ```
//!
//! The same envelope travels downstream (relay <-> games) and upstream
//! (relay <-> agent); only the accepted command set differs per direction.
//! This module owns the envelope, the command strings, the typed payload
//! views, and the builders for every frame the relay emits. Payload fields
//! the peer omits decode to their defaults; a frame that fails to decode at
//! all is dropped by the caller, never answered.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::version::VersionFeatures;

// Downstream -> core.
pub const CMD_STARTUP: &str = "startup";
pub const CMD_CONTEXT: &str = "context";
pub const CMD_ACTIONS_REGISTER: &str = "actions/register";
pub const CMD_ACTIONS_UNREGISTER: &str = "actions/unregister";
pub const CMD_ACTIONS_FORCE: &str = "actions/force";
pub const CMD_ACTION_RESULT: &str = "action/result";
pub const CMD_SHUTDOWN_READY: &str = "shutdown/ready";

// Relay-custom endpoints, namespaced under a shared prefix.
pub const NRC_PREFIX: &str = "nrc-endpoints/";
pub const CMD_NRC_ERROR: &str = "nrc-endpoints/error";
pub const CMD_NRC_STARTUP_ACK: &str = "nrc-endpoints/startup-ack";
pub const CMD_NRC_VERSION_MISMATCH: &str = "nrc-endpoints/version-mismatch";
pub const CMD_NRC_HEALTH_RESPONSE: &str = "nrc-endpoints/health-response";
pub const CMD_RELAY_LOCKED: &str = "nrelay/locked";

// Core -> downstream, upstream -> core.
pub const CMD_ACTION: &str = "action";
pub const CMD_SHUTDOWN_GRACEFUL: &str = "shutdown/graceful";
pub const CMD_REREGISTER_ALL: &str = "actions/reregister_all";

/// Shared frame envelope for both directions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl Envelope {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            game: None,
            data: None,
        }
    }

    pub fn with_game(mut self, game: &str) -> Self {
        self.game = Some(game.to_string());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        if let Value::Object(map) = data {
            self.data = Some(map);
        }
        self
    }

    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn encode(&self) -> String {
        // Envelope contains only JSON-representable types; serialization
        // cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode the data object into a typed payload view.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        let data = self.data.clone().unwrap_or_default();
        serde_json::from_value(Value::Object(data)).ok()
    }
}

/// A single action as a game registers it. The schema is opaque to the
/// relay and forwarded verbatim.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ActionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

// ============================================================================
// Typed payload views (inbound)
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HandshakePayload {
    #[serde(rename = "nr-version")]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HealthPayload {
    pub include: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ContextPayload {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub silent: bool,
}

#[derive(Debug, Deserialize)]
pub struct RegisterPayload {
    pub actions: Vec<ActionSpec>,
}

#[derive(Debug, Deserialize)]
pub struct UnregisterPayload {
    pub action_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ForcePayload {
    #[serde(default)]
    pub query: String,
    pub action_names: Vec<String>,
    #[serde(default)]
    pub ephemeral_context: bool,
    pub priority: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActionResultPayload {
    pub id: String,
    #[serde(default)]
    pub success: bool,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActionPayload {
    pub id: String,
    pub name: String,
    /// Opaque argument payload, forwarded verbatim to the target game.
    pub data: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct GracefulShutdownPayload {
    pub wants_shutdown: bool,
}

// ============================================================================
// Frame builders (outbound)
// ============================================================================

pub fn startup_frame(game_name: &str) -> Envelope {
    Envelope::new(CMD_STARTUP).with_game(game_name)
}

pub fn context_frame(game_name: &str, message: &str, silent: bool) -> Envelope {
    Envelope::new(CMD_CONTEXT)
        .with_game(game_name)
        .with_data(json!({ "message": message, "silent": silent }))
}

pub fn register_frame(game_name: &str, actions: &[ActionSpec]) -> Envelope {
    Envelope::new(CMD_ACTIONS_REGISTER)
        .with_game(game_name)
        .with_data(json!({ "actions": actions }))
}

pub fn unregister_frame(game_name: &str, action_names: &[String]) -> Envelope {
    Envelope::new(CMD_ACTIONS_UNREGISTER)
        .with_game(game_name)
        .with_data(json!({ "action_names": action_names }))
}

pub fn force_frame(
    game_name: &str,
    query: &str,
    action_names: &[String],
    ephemeral_context: bool,
    priority: &str,
    state: Option<&str>,
) -> Envelope {
    let mut data = json!({
        "query": query,
        "action_names": action_names,
        "ephemeral_context": ephemeral_context,
        "priority": priority,
    });
    if let Some(state) = state {
        data["state"] = Value::String(state.to_string());
    }
    Envelope::new(CMD_ACTIONS_FORCE).with_game(game_name).with_data(data)
}

pub fn action_result_frame(
    game_name: &str,
    id: &str,
    success: bool,
    message: Option<&str>,
) -> Envelope {
    let mut data = json!({ "id": id, "success": success });
    if let Some(message) = message {
        data["message"] = Value::String(message.to_string());
    }
    Envelope::new(CMD_ACTION_RESULT).with_game(game_name).with_data(data)
}

pub fn shutdown_ready_frame(game_name: &str) -> Envelope {
    Envelope::new(CMD_SHUTDOWN_READY).with_game(game_name)
}

pub fn action_frame(id: &str, name: &str, data: Option<&Value>) -> Envelope {
    Envelope::new(CMD_ACTION).with_data(json!({
        "id": id,
        "name": name,
        "data": data.cloned().unwrap_or(Value::Null),
    }))
}

pub fn graceful_shutdown_frame(wants_shutdown: bool) -> Envelope {
    Envelope::new(CMD_SHUTDOWN_GRACEFUL).with_data(json!({ "wants_shutdown": wants_shutdown }))
}

pub fn error_frame(command: &str, error: &str) -> Envelope {
    Envelope::new(command).with_data(json!({ "error": error }))
}

pub fn startup_ack_frame(relay_version: &str, features: VersionFeatures) -> Envelope {
    Envelope::new(CMD_NRC_STARTUP_ACK).with_data(json!({
        "nr-version": relay_version,
        "features": {
            "health-endpoint": features.health_endpoint,
            "multiplexing": features.multiplexing,
            "custom-routing": features.custom_routing,
        },
    }))
}

pub fn version_mismatch_frame(requested: &str, available: &[&str], suggestion: &str) -> Envelope {
    Envelope::new(CMD_NRC_VERSION_MISMATCH).with_data(json!({
        "requested": requested,
        "available": available,
        "suggestion": suggestion,
    }))
}

pub fn health_response_frame(fields: Map<String, Value>) -> Envelope {
    Envelope {
        command: CMD_NRC_HEALTH_RESPONSE.to_string(),
        game: None,
        data: Some(fields),
    }
}
