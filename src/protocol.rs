// SPDX-FileCopyrightText: 2026 The wavesync authors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Messages exchanged with the transport boundary.
//!
//! The transport (WebSocket, STOMP, ...) only ever sees these shapes; the
//! engine hands it fully serialized operation batches and receives them
//! back the same way.

use crate::types::{InvalidOperation, Operation, WireOperation};
use serde::{Deserialize, Serialize};

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum ServerMessage {
    /// A broadcast delta that moved the wavelet to `version`.
    ApplyOperations {
        version: u64,
        operations: Vec<WireOperation>,
    },
    /// Confirms the client's outstanding batch; the wavelet is now at
    /// `version`.
    Acknowledge { version: u64 },
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Requests to apply the batch on top of `version`.
    ProcessOperations {
        version: u64,
        operations: Vec<WireOperation>,
    },
}

impl ServerMessage {
    pub fn from_json(json: &str) -> Result<Self, anyhow::Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, anyhow::Error> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ClientMessage {
    pub fn from_json(json: &str) -> Result<Self, anyhow::Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, anyhow::Error> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Validates a whole wire batch. Any invalid member rejects the batch.
pub fn parse_batch(operations: &[WireOperation]) -> Result<Vec<Operation>, InvalidOperation> {
    operations
        .iter()
        .cloned()
        .map(Operation::try_from)
        .collect()
}
