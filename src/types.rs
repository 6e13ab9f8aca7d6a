// SPDX-FileCopyrightText: 2026 The wavesync authors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type JsonMap = Map<String, Value>;

/// The six operation kinds the engine transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    DocumentInsert,
    DocumentDelete,
    DocumentElementInsert,
    DocumentElementDelete,
    DocumentElementDelta,
    DocumentElementSetpref,
}

impl OpKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::DocumentInsert => "DOCUMENT_INSERT",
            Self::DocumentDelete => "DOCUMENT_DELETE",
            Self::DocumentElementInsert => "DOCUMENT_ELEMENT_INSERT",
            Self::DocumentElementDelete => "DOCUMENT_ELEMENT_DELETE",
            Self::DocumentElementDelta => "DOCUMENT_ELEMENT_DELTA",
            Self::DocumentElementSetpref => "DOCUMENT_ELEMENT_SETPREF",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "DOCUMENT_INSERT" => Some(Self::DocumentInsert),
            "DOCUMENT_DELETE" => Some(Self::DocumentDelete),
            "DOCUMENT_ELEMENT_INSERT" => Some(Self::DocumentElementInsert),
            "DOCUMENT_ELEMENT_DELETE" => Some(Self::DocumentElementDelete),
            "DOCUMENT_ELEMENT_DELTA" => Some(Self::DocumentElementDelta),
            "DOCUMENT_ELEMENT_SETPREF" => Some(Self::DocumentElementSetpref),
            _ => None,
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An element placed in the text stream (gadget, image, ...). Occupies one
/// position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: JsonMap,
}

/// A state delta addressed to one element by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDelta {
    pub id: String,
    pub delta: JsonMap,
}

/// A single user preference on an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementPref {
    pub key: String,
    pub value: Value,
}

/// Operation payload, tagged by the operation kind.
#[derive(Debug, Clone, PartialEq)]
pub enum OpPayload {
    Insert(String),
    Delete(usize),
    ElementInsert(Element),
    ElementDelete,
    ElementDelta(ElementDelta),
    ElementSetpref(ElementPref),
}

impl OpPayload {
    pub const fn kind(&self) -> OpKind {
        match self {
            Self::Insert(_) => OpKind::DocumentInsert,
            Self::Delete(_) => OpKind::DocumentDelete,
            Self::ElementInsert(_) => OpKind::DocumentElementInsert,
            Self::ElementDelete => OpKind::DocumentElementDelete,
            Self::ElementDelta(_) => OpKind::DocumentElementDelta,
            Self::ElementSetpref(_) => OpKind::DocumentElementSetpref,
        }
    }

    fn from_value(kind: OpKind, property: Value) -> Result<Self, InvalidOperation> {
        let mismatch = || InvalidOperation::PropertyShape { kind: kind.name() };
        match kind {
            OpKind::DocumentInsert => match property {
                Value::String(text) => Ok(Self::Insert(text)),
                _ => Err(mismatch()),
            },
            OpKind::DocumentDelete => property
                .as_u64()
                .map(|count| Self::Delete(count as usize))
                .ok_or_else(mismatch),
            OpKind::DocumentElementInsert => {
                serde_json::from_value(property).map(Self::ElementInsert).map_err(|_| mismatch())
            }
            OpKind::DocumentElementDelete => match property {
                Value::Null => Ok(Self::ElementDelete),
                _ => Err(mismatch()),
            },
            OpKind::DocumentElementDelta => {
                serde_json::from_value(property).map(Self::ElementDelta).map_err(|_| mismatch())
            }
            OpKind::DocumentElementSetpref => {
                serde_json::from_value(property).map(Self::ElementSetpref).map_err(|_| mismatch())
            }
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Insert(text) => Value::String(text.clone()),
            Self::Delete(count) => Value::from(*count as u64),
            Self::ElementInsert(element) => serde_json::to_value(element)
                .expect("Failed to convert element payload to a JSON value"),
            Self::ElementDelete => Value::Null,
            Self::ElementDelta(delta) => serde_json::to_value(delta)
                .expect("Failed to convert element delta payload to a JSON value"),
            Self::ElementSetpref(pref) => serde_json::to_value(pref)
                .expect("Failed to convert element pref payload to a JSON value"),
        }
    }
}

/// A single edit on one blip of one wavelet.
///
/// The `index` addresses a position in the blip's text stream in characters;
/// `None` (wire `-1`) marks an operation that is not position-based and takes
/// no part in positional transformation.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub wave_id: String,
    pub wavelet_id: String,
    pub blip_id: String,
    pub index: Option<usize>,
    pub payload: OpPayload,
}

impl Operation {
    pub fn new(
        wave_id: &str,
        wavelet_id: &str,
        blip_id: &str,
        index: usize,
        payload: OpPayload,
    ) -> Self {
        Self {
            wave_id: wave_id.to_string(),
            wavelet_id: wavelet_id.to_string(),
            blip_id: blip_id.to_string(),
            index: Some(index),
            payload,
        }
    }

    pub const fn kind(&self) -> OpKind {
        self.payload.kind()
    }

    pub const fn is_insert(&self) -> bool {
        matches!(
            self.payload,
            OpPayload::Insert(_) | OpPayload::ElementInsert(_)
        )
    }

    pub const fn is_delete(&self) -> bool {
        matches!(self.payload, OpPayload::Delete(_) | OpPayload::ElementDelete)
    }

    pub const fn is_change(&self) -> bool {
        matches!(
            self.payload,
            OpPayload::ElementDelta(_) | OpPayload::ElementSetpref(_)
        )
    }

    /// An operation that does not change anything.
    pub fn is_null(&self) -> bool {
        match &self.payload {
            OpPayload::Insert(text) => text.is_empty(),
            OpPayload::Delete(count) => *count == 0,
            _ => false,
        }
    }

    /// Two operations can influence each other only when they address the
    /// same blip of the same wavelet.
    pub fn is_compatible_to(&self, other: &Self) -> bool {
        self.wave_id == other.wave_id
            && self.wavelet_id == other.wavelet_id
            && self.blip_id == other.blip_id
    }

    /// The distance a concurrent operation's index must move to account for
    /// the effects of this operation.
    pub fn length(&self) -> usize {
        match &self.payload {
            OpPayload::Insert(text) => text.chars().count(),
            OpPayload::Delete(count) => *count,
            OpPayload::ElementInsert(_) | OpPayload::ElementDelete => 1,
            OpPayload::ElementDelta(_) | OpPayload::ElementSetpref(_) => 0,
        }
    }

    /// Sets the number of deleted characters. No effect on other kinds.
    pub fn resize(&mut self, value: usize) {
        if let OpPayload::Delete(count) = &mut self.payload {
            *count = value;
        }
    }

    pub fn serialize(&self) -> WireOperation {
        WireOperation::from(self)
    }

    pub fn unserialize(wire: WireOperation) -> Result<Self, InvalidOperation> {
        Self::try_from(wire)
    }
}

/// The robots-API shape an operation takes on the wire: exactly the keys
/// `type`, `waveId`, `waveletId`, `blipId`, `index`, `property`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOperation {
    #[serde(rename = "type")]
    pub kind: String,
    pub wave_id: String,
    pub wavelet_id: String,
    pub blip_id: String,
    pub index: i64,
    pub property: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidOperation {
    #[error("unknown operation type `{0}`")]
    UnknownType(String),
    #[error("operation index {0} is out of range")]
    IndexOutOfRange(i64),
    #[error("property has the wrong shape for a {kind} operation")]
    PropertyShape { kind: &'static str },
}

impl TryFrom<WireOperation> for Operation {
    type Error = InvalidOperation;

    fn try_from(wire: WireOperation) -> Result<Self, Self::Error> {
        let kind = OpKind::from_name(&wire.kind)
            .ok_or_else(|| InvalidOperation::UnknownType(wire.kind.clone()))?;
        let index = match wire.index {
            -1 => None,
            index if index < -1 => return Err(InvalidOperation::IndexOutOfRange(index)),
            index => Some(index as usize),
        };
        let payload = OpPayload::from_value(kind, wire.property)?;
        Ok(Self {
            wave_id: wire.wave_id,
            wavelet_id: wire.wavelet_id,
            blip_id: wire.blip_id,
            index,
            payload,
        })
    }
}

impl From<&Operation> for WireOperation {
    fn from(op: &Operation) -> Self {
        Self {
            kind: op.kind().name().to_string(),
            wave_id: op.wave_id.clone(),
            wavelet_id: op.wavelet_id.clone(),
            blip_id: op.blip_id.clone(),
            index: op.index.map_or(-1, |index| index as i64),
            property: op.payload.to_value(),
        }
    }
}

/// Byte position of the given character offset, clamped to the end.
pub(crate) fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices().nth(chars).map_or(text.len(), |(byte, _)| byte)
}

pub mod factories {
    use super::*;

    pub const WAVE: &str = "wave";
    pub const WAVELET: &str = "wavelet";
    pub const BLIP: &str = "root_blip";

    pub fn insert(at: usize, text: &str) -> Operation {
        Operation::new(WAVE, WAVELET, BLIP, at, OpPayload::Insert(text.to_string()))
    }

    pub fn delete(at: usize, count: usize) -> Operation {
        Operation::new(WAVE, WAVELET, BLIP, at, OpPayload::Delete(count))
    }

    pub fn element_insert(at: usize, kind: &str) -> Operation {
        Operation::new(
            WAVE,
            WAVELET,
            BLIP,
            at,
            OpPayload::ElementInsert(Element {
                kind: kind.to_string(),
                properties: JsonMap::new(),
            }),
        )
    }

    pub fn element_delete(at: usize) -> Operation {
        Operation::new(WAVE, WAVELET, BLIP, at, OpPayload::ElementDelete)
    }

    pub fn element_delta(at: usize, id: &str, pairs: &[(&str, Value)]) -> Operation {
        let delta = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect();
        Operation::new(
            WAVE,
            WAVELET,
            BLIP,
            at,
            OpPayload::ElementDelta(ElementDelta {
                id: id.to_string(),
                delta,
            }),
        )
    }

    pub fn setpref(at: usize, key: &str, value: Value) -> Operation {
        Operation::new(
            WAVE,
            WAVELET,
            BLIP,
            at,
            OpPayload::ElementSetpref(ElementPref {
                key: key.to_string(),
                value,
            }),
        )
    }
}
