//! Usage alerts.

use serde::{Deserialize, Serialize};

use crate::ratelimit::LimitType;

/// What an alert is about, with a fixed payload per kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "alertType", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    /// A caller was denied while close to (or past) its limit.
    #[serde(rename_all = "camelCase")]
    HighUsage {
        /// Budget left when the alert fired
        remaining: u64,
        /// Limit in force
        limit: u64,
    },
}

/// A recorded alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// When the alert fired (ms epoch)
    pub timestamp: u64,
    /// The caller identity
    pub identifier: String,
    /// The limit type of the bucket
    #[serde(rename = "type")]
    pub limit_type: LimitType,
    /// Kind and payload
    #[serde(flatten)]
    pub kind: AlertKind,
}
