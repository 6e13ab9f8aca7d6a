// SPDX-FileCopyrightText: 2026 The wavesync authors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::diff::generate_diff_ops;
use crate::ot::OpManager;
use crate::protocol::{parse_batch, ClientMessage, ServerMessage};
use crate::types::{byte_offset, OpPayload, Operation};
use tracing::{debug, warn};

/// `OTClient` reconciles one blip's text against the authoritative server.
///
/// It keeps three operation managers:
///
/// - `pending` — the batch currently in flight, shipped to the server and
///   awaiting its acknowledgement.
/// - `cache` — operations the user produced while `pending` is outstanding.
///   The diff generator writes here, so bursts of typing merge into few
///   operations.
/// - `incoming` — a server delta being reconciled against local state.
///
/// The cycle looks like this:
///
/// 1. The UI mirrors the user's text into [`Self::update_text`]. The diff
///    lands in `cache`; if nothing is in flight, `cache` is promoted to
///    `pending` and a `processOperations` message is handed back for the
///    transport to ship, stamped with the version it is based on.
/// 2. A broadcast delta from another participant arrives via
///    [`Self::apply_operations`]. The incoming operations are transformed
///    against `pending`, then against `cache`. The transformation is dual:
///    afterwards the incoming operations fit the user's current text, and
///    `pending`/`cache` have been rewritten to apply on top of the delta.
///    The incoming operations are then spliced into the text.
/// 3. The server confirms the in-flight batch via [`Self::acknowledge`].
///    `pending` is dropped, and if `cache` filled up in the meantime it is
///    promoted and shipped in turn.
///
/// A delta that does not fit the text marks the blip inconsistent; the
/// client then waits for [`Self::reset`] with a fresh server snapshot.
#[derive(Debug)]
pub struct OTClient {
    wave_id: String,
    wavelet_id: String,
    blip_id: String,
    version: u64,
    pending: OpManager,
    cache: OpManager,
    incoming: OpManager,
    applying: bool,
    content: String,
    inconsistent: bool,
}

impl OTClient {
    pub fn new(
        wave_id: &str,
        wavelet_id: &str,
        blip_id: &str,
        version: u64,
        content: &str,
    ) -> Self {
        Self {
            wave_id: wave_id.to_string(),
            wavelet_id: wavelet_id.to_string(),
            blip_id: blip_id.to_string(),
            version,
            pending: OpManager::new(wave_id, wavelet_id),
            cache: OpManager::new(wave_id, wavelet_id),
            incoming: OpManager::new(wave_id, wavelet_id),
            applying: false,
            content: content.to_string(),
            inconsistent: false,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn blip_id(&self) -> &str {
        &self.blip_id
    }

    pub fn has_pending_operations(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending(&self) -> &OpManager {
        &self.pending
    }

    pub fn cache(&self) -> &OpManager {
        &self.cache
    }

    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent
    }

    /// Dispatches a server message and returns the reply to ship, if any.
    pub fn handle_message(&mut self, message: ServerMessage) -> Option<ClientMessage> {
        match message {
            ServerMessage::ApplyOperations {
                version,
                operations,
            } => match parse_batch(&operations) {
                Ok(ops) => {
                    self.apply_operations(version, ops);
                    None
                }
                Err(error) => {
                    warn!("Dropping malformed delta at version {version}: {error}");
                    None
                }
            },
            ServerMessage::Acknowledge { version } => self.acknowledge(version),
        }
    }

    /// Mirrors the user's new text into the cache. Returns the batch to
    /// ship when nothing was in flight.
    pub fn update_text(&mut self, new_text: &str) -> Option<ClientMessage> {
        if self.applying {
            return None;
        }
        generate_diff_ops(&mut self.cache, &self.blip_id, &self.content, new_text);
        self.content = new_text.to_string();
        self.flush()
    }

    /// Applies a broadcast delta that moved the wavelet to `version`.
    pub fn apply_operations(&mut self, version: u64, ops: Vec<Operation>) {
        if version <= self.version {
            warn!(
                "Discarding delta at version {version}, already at version {}",
                self.version
            );
            return;
        }
        self.applying = true;

        let (mine, foreign): (Vec<_>, Vec<_>) = ops.into_iter().partition(|op| {
            op.wave_id == self.wave_id
                && op.wavelet_id == self.wavelet_id
                && op.blip_id == self.blip_id
        });
        if !foreign.is_empty() {
            debug!("Ignoring {} operation(s) for other targets", foreign.len());
        }

        self.incoming.put(mine);
        self.incoming.transform_by_manager(&mut self.pending);
        self.incoming.transform_by_manager(&mut self.cache);

        for op in self.incoming.fetch() {
            self.apply_to_content(&op);
            if self.inconsistent {
                break;
            }
        }

        self.version = version;
        self.applying = false;
    }

    /// Handles the server's confirmation of the in-flight batch. Returns
    /// the next batch to ship when the cache filled up in the meantime.
    pub fn acknowledge(&mut self, version: u64) -> Option<ClientMessage> {
        if version <= self.version {
            warn!(
                "Ignoring acknowledgement for version {version}, already at version {}",
                self.version
            );
            return None;
        }
        self.version = version;
        self.pending.fetch();
        self.flush()
    }

    /// Reloads from a fresh server snapshot, dropping all local state.
    pub fn reset(&mut self, version: u64, content: &str) {
        self.pending.fetch();
        self.cache.fetch();
        self.incoming.fetch();
        self.version = version;
        self.content = content.to_string();
        self.applying = false;
        self.inconsistent = false;
    }

    fn flush(&mut self) -> Option<ClientMessage> {
        if !self.pending.is_empty() || self.cache.is_empty() {
            return None;
        }
        let ops = self.cache.fetch();
        self.pending.put(ops);
        debug!(
            "Shipping {} operation(s) based on version {}",
            self.pending.len(),
            self.version
        );
        Some(ClientMessage::ProcessOperations {
            version: self.version,
            operations: self.pending.serialize(false),
        })
    }

    fn apply_to_content(&mut self, op: &Operation) {
        let Some(index) = op.index else {
            return;
        };
        let text_len = self.content.chars().count();
        match &op.payload {
            OpPayload::Insert(text) => {
                if index > text_len {
                    self.mark_inconsistent(op);
                    return;
                }
                let at = byte_offset(&self.content, index);
                self.content.insert_str(at, text);
            }
            OpPayload::Delete(count) => {
                if index + count > text_len {
                    self.mark_inconsistent(op);
                    return;
                }
                let from = byte_offset(&self.content, index);
                let to = byte_offset(&self.content, index + count);
                self.content.replace_range(from..to, "");
            }
            _ => {
                // Element state lives outside the plain text stream.
                debug!("Not applying {} to the blip text", op.kind());
            }
        }
    }

    fn mark_inconsistent(&mut self, op: &Operation) {
        warn!("Operation {op:?} does not fit the blip text, awaiting a fresh snapshot");
        self.inconsistent = true;
    }
}
