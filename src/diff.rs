// SPDX-FileCopyrightText: 2026 The wavesync authors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Turns an old→new text transition into operations.

use crate::ot::OpManager;

/// Writes the operations describing the transition from `old_text` to
/// `new_text` into the manager: the longest common prefix and suffix are
/// bracketed off, the differing middle becomes at most one delete followed
/// by one insert. Positions are character offsets.
///
/// Both emissions go through the merging insertion path, so a burst of
/// single-character edits collapses into one growing operation.
pub fn generate_diff_ops(manager: &mut OpManager, blip_id: &str, old_text: &str, new_text: &str) {
    if old_text == new_text {
        return;
    }
    let old: Vec<char> = old_text.chars().collect();
    let new: Vec<char> = new_text.chars().collect();

    let mut prefix = 0;
    while prefix < old.len().min(new.len()) && old[prefix] == new[prefix] {
        prefix += 1;
    }
    let mut suffix = 0;
    let max_suffix = old.len().min(new.len()) - prefix;
    while suffix < max_suffix && old[old.len() - 1 - suffix] == new[new.len() - 1 - suffix] {
        suffix += 1;
    }

    if prefix + suffix < old.len() {
        manager.document_delete(blip_id, prefix, old.len() - suffix);
    }
    if prefix + suffix < new.len() {
        let middle: String = new[prefix..new.len() - suffix].iter().collect();
        manager.document_insert(blip_id, prefix, &middle);
    }
}
