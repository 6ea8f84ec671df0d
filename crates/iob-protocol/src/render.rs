//! Inspection of render instructions sent by hosts.
//!
//! The broker relays render instructions verbatim; it only looks inside
//! them for two things: the input-group key (the idempotency marker of a
//! render step) and whether any component expects user input.
//!
//! Fields other than those are ignored so hosts on newer SDKs can add
//! props without breaking the broker.

use iob_core::InputGroupKey;
use serde::Deserialize;

/// Method-name prefix of components that only display data.
const DISPLAY_PREFIX: &str = "DISPLAY_";

/// One component of a render instruction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderComponent {
    pub method_name: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl RenderComponent {
    /// Returns true if the component collects input from the user.
    pub fn is_interactive(&self) -> bool {
        !self.method_name.starts_with(DISPLAY_PREFIX)
    }
}

/// The parts of a render instruction the broker cares about.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderInstruction {
    pub input_group_key: InputGroupKey,
    #[serde(default)]
    pub to_render: Vec<RenderComponent>,
}

impl RenderInstruction {
    /// Inspects a raw render payload.
    ///
    /// Returns `None` when the payload is not a recognizable render
    /// instruction; callers treat that as a malformed message.
    pub fn inspect(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Returns true if at least one component is interactive.
    pub fn is_interactive(&self) -> bool {
        self.to_render.iter().any(RenderComponent::is_interactive)
    }
}
