//! Permission request and decision types.
//!
//! A [`PermissionDecision`] is a tagged union: `allow` optionally carries a
//! rewritten tool input and permission-rule updates for the caller to apply;
//! `deny` carries a message for the model and whether the run should stop.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_DENY_MESSAGE: &str = "Permission denied by user";
pub const CANCELLED_MESSAGE: &str = "Permission request was cancelled";
pub const NO_BOUNDARY_MESSAGE: &str = "No UI is connected to answer the permission request";
pub const RUN_ENDED_MESSAGE: &str = "Run ended";

/// What the task runner asks about: one gated tool invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct PermissionRequest {
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
    /// Identity of the tool call, echoed back in the [`PermissionResult`].
    pub tool_use_id: String,
    /// Owning run, for [`super::PermissionBroker::end_run`].
    #[serde(default)]
    pub run_id: Option<String>,
    /// Why the runner is asking (e.g. the rule that matched).
    #[serde(default)]
    pub decision_reason: Option<String>,
    /// Path outside the allowed directories, if that is the reason.
    #[serde(default)]
    pub blocked_path: Option<String>,
    /// Rule updates the UI may offer as "always allow" choices.
    #[serde(default)]
    pub suggestions: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_input: Option<Value>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        updated_permissions: Vec<Value>,
    },
    Deny {
        message: String,
        #[serde(default)]
        interrupt: bool,
    },
}

impl PermissionDecision {
    pub fn allow() -> Self {
        Self::Allow {
            updated_input: None,
            updated_permissions: Vec::new(),
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
            interrupt: false,
        }
    }

    /// Deny and tell the runner to stop the current turn.
    pub fn deny_and_interrupt(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
            interrupt: true,
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    pub fn behavior(&self) -> &'static str {
        match self {
            Self::Allow { .. } => "allow",
            Self::Deny { .. } => "deny",
        }
    }
}

/// What the task runner gets back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionResult {
    pub tool_use_id: String,
    #[serde(flatten)]
    pub decision: PermissionDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Behavior {
    Allow,
    Deny,
}

/// The operator's answer as sent by the UI, before normalisation.
#[derive(Debug, Clone, Deserialize)]
pub struct PermissionResponse {
    pub decision: Behavior,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub permission_updates: Vec<Value>,
    #[serde(default)]
    pub updated_input: Option<Value>,
    #[serde(default)]
    pub interrupt: bool,
}

impl PermissionResponse {
    pub fn allow() -> Self {
        Self {
            decision: Behavior::Allow,
            message: None,
            permission_updates: Vec::new(),
            updated_input: None,
            interrupt: false,
        }
    }

    pub fn deny(message: Option<&str>) -> Self {
        Self {
            decision: Behavior::Deny,
            message: message.map(ToString::to_string),
            ..Self::allow()
        }
    }

    /// Normalise into a [`PermissionDecision`]. Fields that do not belong to
    /// the chosen behavior are dropped; a missing or blank deny message gets
    /// [`DEFAULT_DENY_MESSAGE`].
    pub fn into_decision(self) -> PermissionDecision {
        match self.decision {
            Behavior::Allow => PermissionDecision::Allow {
                updated_input: self.updated_input,
                updated_permissions: self.permission_updates,
            },
            Behavior::Deny => PermissionDecision::Deny {
                message: self
                    .message
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_DENY_MESSAGE.to_string()),
                interrupt: self.interrupt,
            },
        }
    }
}
