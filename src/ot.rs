// SPDX-FileCopyrightText: 2026 The wavesync authors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::events::{EventBus, EventKind, OpEvent, SubscriptionId};
use crate::types::{
    byte_offset, InvalidOperation, JsonMap, OpPayload, Operation, WireOperation,
};
use serde_json::Value;
use std::fmt;
use tracing::debug;

/// Manages operations: creating, merging, transforming, serializing.
///
/// An `OpManager` is always associated with exactly one wave/wavelet. It
/// keeps an ordered list of operations and notifies observers about
/// structural changes through its embedded [`EventBus`].
pub struct OpManager {
    wave_id: String,
    wavelet_id: String,
    operations: Vec<Operation>,
    events: EventBus,
}

enum MergeOutcome {
    /// Fully absorbed into the last operation.
    Done,
    /// Absorbed, and the last operation became empty.
    DoneRemoved,
    /// The last operation became empty and a remainder must be appended.
    AppendRemoved,
    /// The last operation shrank and a remainder must be appended.
    AppendChanged,
    /// No merge applies.
    Append,
}

impl OpManager {
    pub fn new(wave_id: &str, wavelet_id: &str) -> Self {
        Self {
            wave_id: wave_id.to_string(),
            wavelet_id: wavelet_id.to_string(),
            operations: Vec::new(),
            events: EventBus::new(),
        }
    }

    pub fn wave_id(&self) -> &str {
        &self.wave_id
    }

    pub fn wavelet_id(&self) -> &str {
        &self.wavelet_id
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn subscribe(
        &mut self,
        kind: EventKind,
        callback: impl FnMut(&OpEvent) + 'static,
    ) -> SubscriptionId {
        self.events.subscribe(kind, callback)
    }

    pub fn unsubscribe(&mut self, kind: EventKind, id: SubscriptionId) -> bool {
        self.events.unsubscribe(kind, id)
    }

    /// Transforms the input operation on behalf of the manager's operations
    /// list, and simultaneously transforms the list on behalf of the input
    /// operation (the input is taken to apply first).
    ///
    /// Returns the operations equivalent to the input after all of the
    /// manager's operations have been applied. The result may be empty (the
    /// input was cancelled by concurrent deletions), a single shifted or
    /// unchanged operation, or several pieces when a concurrent insertion
    /// splits a deletion.
    ///
    /// Both halves of the result form a diamond: applying the input and then
    /// this manager's (now rewritten) operations yields the same document as
    /// applying the manager's original operations and then the returned ones.
    ///
    /// At equal-index insertions the input moves past the manager's
    /// operation. Callers keep the server's operations on the manager side
    /// (the server transforms client batches against its history, the client
    /// transforms pending/cache against the incoming delta), so server order
    /// wins insertion ties everywhere.
    ///
    /// Operations that are not compatible with the manager's wave, wavelet
    /// and blip, or that are not position-based, pass through untouched.
    pub fn transform(&mut self, input_op: &Operation) -> Vec<Operation> {
        let mut op_lst = vec![input_op.clone()];
        let Self {
            operations, events, ..
        } = self;

        let mut i = 0;
        while i < operations.len() {
            let mut my_removed = false;
            let mut j = 0;
            while j < op_lst.len() {
                let op = &mut op_lst[j];
                let myop = &mut operations[i];

                if !op.is_compatible_to(myop) {
                    j += 1;
                    continue;
                }
                let (Some(op_index), Some(my_index)) = (op.index, myop.index) else {
                    j += 1;
                    continue;
                };
                let (op_len, my_len) = (op.length(), myop.length());
                let (op_end, my_end) = (op_index + op_len, my_index + my_len);

                if op.is_delete() && myop.is_delete() {
                    if op_index < my_index {
                        if op_end <= my_index {
                            myop.index = Some(my_index - op_len);
                            events.fire(&OpEvent::OperationChanged { index: i });
                        } else if op_end < my_end {
                            op.resize(my_index - op_index);
                            myop.resize(my_len - (op_end - my_index));
                            myop.index = Some(op_index);
                            events.fire(&OpEvent::OperationChanged { index: i });
                        } else {
                            op.resize(op_len - my_len);
                            events.fire(&OpEvent::BeforeOperationsRemoved { start: i, end: i });
                            operations.remove(i);
                            events.fire(&OpEvent::AfterOperationsRemoved { start: i, end: i });
                            my_removed = true;
                            break;
                        }
                    } else if op_index >= my_end {
                        op.index = Some(op_index - my_len);
                    } else if op_end <= my_end {
                        // Both delete the same span; the input piece is done for.
                        op_lst.remove(j);
                        let myop = &mut operations[i];
                        myop.resize(my_len - op_len);
                        if myop.is_null() {
                            events.fire(&OpEvent::BeforeOperationsRemoved { start: i, end: i });
                            operations.remove(i);
                            events.fire(&OpEvent::AfterOperationsRemoved { start: i, end: i });
                            my_removed = true;
                            break;
                        }
                        events.fire(&OpEvent::OperationChanged { index: i });
                        continue;
                    } else {
                        myop.resize(my_len - (my_end - op_index));
                        events.fire(&OpEvent::OperationChanged { index: i });
                        op.resize(op_len - (my_end - op_index));
                        op.index = Some(my_index);
                    }
                } else if op.is_delete() && myop.is_insert() {
                    if op_index < my_index {
                        if op_end <= my_index {
                            myop.index = Some(my_index - op_len);
                            events.fire(&OpEvent::OperationChanged { index: i });
                        } else {
                            // The deletion reaches across the insertion point
                            // and splits around the inserted text.
                            let mut tail = op.clone();
                            let head_len = my_index - op_index;
                            op.resize(head_len);
                            tail.resize(op_len - head_len);
                            myop.index = Some(my_index - head_len);
                            events.fire(&OpEvent::OperationChanged { index: i });
                            op_lst.insert(j + 1, tail);
                        }
                    } else {
                        op.index = Some(op_index + my_len);
                    }
                } else if op.is_insert() && myop.is_delete() {
                    if op_index <= my_index {
                        myop.index = Some(my_index + op_len);
                        events.fire(&OpEvent::OperationChanged { index: i });
                    } else if op_index >= my_end {
                        op.index = Some(op_index - my_len);
                    } else {
                        // The insertion lands inside the deleted span and
                        // splits the deletion.
                        let mut tail = myop.clone();
                        myop.resize(op_index - my_index);
                        events.fire(&OpEvent::OperationChanged { index: i });
                        tail.resize(my_len - (op_index - my_index));
                        op.index = Some(my_index);
                        events.fire(&OpEvent::BeforeOperationsInserted {
                            start: i + 1,
                            end: i + 1,
                        });
                        operations.insert(i + 1, tail);
                        events.fire(&OpEvent::AfterOperationsInserted {
                            start: i + 1,
                            end: i + 1,
                        });
                    }
                } else if op.is_insert() && myop.is_insert() {
                    if op_index < my_index {
                        myop.index = Some(my_index + op_len);
                        events.fire(&OpEvent::OperationChanged { index: i });
                    } else {
                        op.index = Some(op_index + my_len);
                    }
                } else if op.is_change() && myop.is_delete() {
                    if op_index > my_index {
                        if op_index <= my_end {
                            op.index = Some(my_index);
                        } else {
                            op.index = Some(op_index - my_len);
                        }
                    }
                } else if op.is_change() && myop.is_insert() {
                    if op_index >= my_index {
                        op.index = Some(op_index + my_len);
                    }
                } else if op.is_delete() && myop.is_change() {
                    if op_index < my_index {
                        if my_index <= op_end {
                            myop.index = Some(op_index);
                        } else {
                            myop.index = Some(my_index - op_len);
                        }
                        events.fire(&OpEvent::OperationChanged { index: i });
                    }
                } else if op.is_insert() && myop.is_change() {
                    if op_index <= my_index {
                        myop.index = Some(my_index + op_len);
                        events.fire(&OpEvent::OperationChanged { index: i });
                    }
                }
                // Change against change: neither influences the other.

                j += 1;
            }
            if !my_removed {
                i += 1;
            }
        }

        op_lst
    }

    /// Transforms every operation of `other` against this manager in order.
    /// Afterwards `other` holds its transformed operations and this
    /// manager's list has been rewritten to apply after them.
    pub fn transform_by_manager(&mut self, other: &mut Self) {
        let ops = other.fetch();
        if !ops.is_empty() {
            debug!(
                "Transforming {} operation(s) against {} of ours",
                ops.len(),
                self.operations.len()
            );
        }
        let mut transformed = Vec::with_capacity(ops.len());
        for op in &ops {
            transformed.extend(self.transform(op));
        }
        other.put(transformed);
    }

    /// Returns the held operations and leaves this manager empty.
    pub fn fetch(&mut self) -> Vec<Operation> {
        if self.operations.is_empty() {
            return Vec::new();
        }
        let end = self.operations.len() - 1;
        self.events
            .fire(&OpEvent::BeforeOperationsRemoved { start: 0, end });
        let ops = std::mem::take(&mut self.operations);
        self.events
            .fire(&OpEvent::AfterOperationsRemoved { start: 0, end });
        ops
    }

    /// Opposite of fetch. Appends the given operations wholesale; no merging
    /// is attempted.
    pub fn put(&mut self, ops: Vec<Operation>) {
        if ops.is_empty() {
            return;
        }
        let start = self.operations.len();
        let end = start + ops.len() - 1;
        self.events
            .fire(&OpEvent::BeforeOperationsInserted { start, end });
        self.operations.extend(ops);
        self.events
            .fire(&OpEvent::AfterOperationsInserted { start, end });
    }

    /// Serializes the held operations into their wire form. With `fetch` the
    /// manager is cleared as well.
    pub fn serialize(&mut self, fetch: bool) -> Vec<WireOperation> {
        let ops = if fetch {
            self.fetch()
        } else {
            self.operations.clone()
        };
        ops.iter().map(WireOperation::from).collect()
    }

    /// Validates and appends a batch of wire operations. A batch with any
    /// invalid member is rejected whole and the manager is left untouched.
    pub fn unserialize(&mut self, serial_ops: &[WireOperation]) -> Result<(), InvalidOperation> {
        let ops = serial_ops
            .iter()
            .cloned()
            .map(Operation::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        self.put(ops);
        Ok(())
    }

    /// Requests to insert content into a document at a specific location.
    pub fn document_insert(&mut self, blip_id: &str, index: usize, content: &str) {
        self.insert_merged(Operation::new(
            &self.wave_id,
            &self.wavelet_id,
            blip_id,
            index,
            OpPayload::Insert(content.to_string()),
        ));
    }

    /// Requests to delete content in the range `[start, end)`.
    pub fn document_delete(&mut self, blip_id: &str, start: usize, end: usize) {
        self.insert_merged(Operation::new(
            &self.wave_id,
            &self.wavelet_id,
            blip_id,
            start,
            OpPayload::Delete(end.saturating_sub(start)),
        ));
    }

    /// Requests to insert an element at the given position.
    pub fn document_element_insert(
        &mut self,
        blip_id: &str,
        index: usize,
        kind: &str,
        properties: JsonMap,
    ) {
        self.insert_merged(Operation::new(
            &self.wave_id,
            &self.wavelet_id,
            blip_id,
            index,
            OpPayload::ElementInsert(crate::types::Element {
                kind: kind.to_string(),
                properties,
            }),
        ));
    }

    /// Requests to delete the element at the given position.
    pub fn document_element_delete(&mut self, blip_id: &str, index: usize) {
        self.insert_merged(Operation::new(
            &self.wave_id,
            &self.wavelet_id,
            blip_id,
            index,
            OpPayload::ElementDelete,
        ));
    }

    /// Requests to apply a state delta to the element with the given id.
    pub fn document_element_delta(
        &mut self,
        blip_id: &str,
        index: usize,
        element_id: &str,
        delta: JsonMap,
    ) {
        self.insert_merged(Operation::new(
            &self.wave_id,
            &self.wavelet_id,
            blip_id,
            index,
            OpPayload::ElementDelta(crate::types::ElementDelta {
                id: element_id.to_string(),
                delta,
            }),
        ));
    }

    /// Requests to set a user preference on the element at the given
    /// position.
    pub fn document_element_setpref(
        &mut self,
        blip_id: &str,
        index: usize,
        key: &str,
        value: Value,
    ) {
        self.insert_merged(Operation::new(
            &self.wave_id,
            &self.wavelet_id,
            blip_id,
            index,
            OpPayload::ElementSetpref(crate::types::ElementPref {
                key: key.to_string(),
                value,
            }),
        ));
    }

    /// Inserts an operation, merging it into an existing one where possible.
    fn insert_merged(&mut self, mut new_op: Operation) {
        if new_op.is_null() {
            return;
        }

        // Element deltas can merge with any predecessor on the same element.
        if let OpPayload::ElementDelta(new_delta) = &new_op.payload {
            for i in 0..self.operations.len() {
                if self.operations[i].blip_id != new_op.blip_id {
                    continue;
                }
                if let OpPayload::ElementDelta(delta) = &mut self.operations[i].payload {
                    if delta.id == new_delta.id {
                        merge_element_delta(&mut delta.delta, &new_delta.delta);
                        self.events.fire(&OpEvent::OperationChanged { index: i });
                        return;
                    }
                }
            }
        }

        // Others only merge with the last operation.
        if let Some(i) = self.operations.len().checked_sub(1) {
            if self.operations[i].blip_id == new_op.blip_id {
                match merge_into_last(&mut self.operations[i], &mut new_op) {
                    MergeOutcome::Done => {
                        self.events.fire(&OpEvent::OperationChanged { index: i });
                        return;
                    }
                    MergeOutcome::DoneRemoved => {
                        self.remove_at(i);
                        return;
                    }
                    MergeOutcome::AppendRemoved => {
                        self.remove_at(i);
                    }
                    MergeOutcome::AppendChanged => {
                        self.events.fire(&OpEvent::OperationChanged { index: i });
                    }
                    MergeOutcome::Append => {}
                }
            }
        }

        let end = self.operations.len();
        self.events
            .fire(&OpEvent::BeforeOperationsInserted { start: end, end });
        self.operations.push(new_op);
        self.events
            .fire(&OpEvent::AfterOperationsInserted { start: end, end });
    }

    fn remove_at(&mut self, i: usize) {
        self.events
            .fire(&OpEvent::BeforeOperationsRemoved { start: i, end: i });
        self.operations.remove(i);
        self.events
            .fire(&OpEvent::AfterOperationsRemoved { start: i, end: i });
    }
}

impl fmt::Debug for OpManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpManager")
            .field("wave_id", &self.wave_id)
            .field("wavelet_id", &self.wavelet_id)
            .field("operations", &self.operations)
            .finish_non_exhaustive()
    }
}

/// Tries to merge `new_op` into `last`, mutating both. The caller acts on
/// the returned outcome (event delivery, removal, appending a remainder).
fn merge_into_last(last: &mut Operation, new_op: &mut Operation) -> MergeOutcome {
    let (Some(new_index), Some(last_index)) = (new_op.index, last.index) else {
        return MergeOutcome::Append;
    };

    match (&mut last.payload, &mut new_op.payload) {
        (OpPayload::Insert(text), OpPayload::Insert(new_text)) => {
            let end = last_index + text.chars().count();
            if new_index == last_index {
                text.insert_str(0, new_text);
                return MergeOutcome::Done;
            }
            if new_index == end {
                text.push_str(new_text);
                return MergeOutcome::Done;
            }
            if last_index < new_index && new_index < end {
                let at = byte_offset(text, new_index - last_index);
                text.insert_str(at, new_text);
                return MergeOutcome::Done;
            }
            MergeOutcome::Append
        }
        (OpPayload::Insert(text), OpPayload::Delete(count)) => {
            let insert_len = text.chars().count();
            if new_index == last_index {
                // Eat the front of the insert.
                let cut = byte_offset(text, (*count).min(insert_len));
                text.replace_range(..cut, "");
                if *count < insert_len {
                    return MergeOutcome::Done;
                }
                *count -= insert_len;
                if *count == 0 {
                    return MergeOutcome::DoneRemoved;
                }
                // The rest still deletes content behind the removed insert.
                return MergeOutcome::AppendRemoved;
            }
            let end = last_index + insert_len;
            if last_index < new_index && new_index < end {
                // Eat from within the insert.
                let offset = new_index - last_index;
                let eaten = (*count).min(insert_len - offset);
                let from = byte_offset(text, offset);
                let to = byte_offset(text, offset + eaten);
                text.replace_range(from..to, "");
                let overshoot = *count - eaten;
                if overshoot == 0 {
                    return MergeOutcome::Done;
                }
                *count = overshoot;
                return MergeOutcome::AppendChanged;
            }
            MergeOutcome::Append
        }
        (OpPayload::Delete(count), OpPayload::Delete(new_count)) => {
            if new_index == last_index {
                // Deleting forward at the same spot.
                *count += *new_count;
                return MergeOutcome::Done;
            }
            if new_index + *new_count == last_index {
                // Deleting backwards, directly in front of the last delete.
                last.index = Some(new_index);
                *count += *new_count;
                return MergeOutcome::Done;
            }
            MergeOutcome::Append
        }
        _ => MergeOutcome::Append,
    }
}

/// Updates `target` with `incoming`, key by key. A null value deletes the
/// key instead of storing it.
fn merge_element_delta(target: &mut JsonMap, incoming: &JsonMap) {
    for (key, value) in incoming {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::factories::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn manager() -> OpManager {
        OpManager::new(WAVE, WAVELET)
    }

    fn manager_with(ops: Vec<Operation>) -> OpManager {
        let mut manager = manager();
        manager.put(ops);
        manager
    }

    mod transform_rules {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn insert_moves_past_concurrent_insert_at_same_index() {
            let mut mgr = manager_with(vec![insert(0, "Y")]);
            let transformed = mgr.transform(&insert(0, "X"));
            assert_eq!(transformed, vec![insert(1, "X")]);
            assert_eq!(mgr.operations(), &[insert(0, "Y")]);
        }

        #[test]
        fn insert_before_concurrent_insert_shifts_it() {
            let mut mgr = manager_with(vec![insert(5, "abc")]);
            let transformed = mgr.transform(&insert(2, "xy"));
            assert_eq!(transformed, vec![insert(2, "xy")]);
            assert_eq!(mgr.operations(), &[insert(7, "abc")]);
        }

        #[test]
        fn delete_splits_around_concurrent_insert() {
            let mut mgr = manager_with(vec![insert(2, "z")]);
            let transformed = mgr.transform(&delete(1, 3));
            assert_eq!(transformed, vec![delete(1, 1), delete(2, 2)]);
            assert_eq!(mgr.operations(), &[insert(1, "z")]);
        }

        #[test]
        fn insert_splits_concurrent_delete() {
            let mut mgr = manager_with(vec![delete(1, 3)]);
            let transformed = mgr.transform(&insert(2, "z"));
            assert_eq!(transformed, vec![insert(1, "z")]);
            assert_eq!(mgr.operations(), &[delete(1, 1), delete(2, 2)]);
        }

        #[test]
        fn delete_covering_concurrent_delete_shrinks_and_removes_it() {
            let mut mgr = manager_with(vec![delete(2, 2)]);
            let transformed = mgr.transform(&delete(1, 4));
            assert_eq!(transformed, vec![delete(1, 2)]);
            assert!(mgr.is_empty());
        }

        #[test]
        fn identical_deletes_cancel_out() {
            let mut mgr = manager_with(vec![delete(1, 2)]);
            let transformed = mgr.transform(&delete(1, 2));
            assert_eq!(transformed, vec![]);
            assert!(mgr.is_empty());
        }

        #[test]
        fn delete_inside_concurrent_delete_is_dropped() {
            let mut mgr = manager_with(vec![delete(1, 4)]);
            let transformed = mgr.transform(&delete(2, 2));
            assert_eq!(transformed, vec![]);
            assert_eq!(mgr.operations(), &[delete(1, 2)]);
        }

        #[test]
        fn overlapping_deletes_front() {
            // Concurrent deletes of [1,3) and [2,5).
            let mut mgr = manager_with(vec![delete(2, 3)]);
            let transformed = mgr.transform(&delete(1, 2));
            assert_eq!(transformed, vec![delete(1, 1)]);
            assert_eq!(mgr.operations(), &[delete(1, 2)]);
        }

        #[test]
        fn overlapping_deletes_rear() {
            // Concurrent deletes of [2,5) and [1,3).
            let mut mgr = manager_with(vec![delete(1, 2)]);
            let transformed = mgr.transform(&delete(2, 3));
            assert_eq!(transformed, vec![delete(1, 2)]);
            assert_eq!(mgr.operations(), &[delete(1, 1)]);
        }

        #[test]
        fn disjoint_deletes_shift() {
            let mut mgr = manager_with(vec![delete(5, 2)]);
            let transformed = mgr.transform(&delete(0, 2));
            assert_eq!(transformed, vec![delete(0, 2)]);
            assert_eq!(mgr.operations(), &[delete(3, 2)]);

            let mut mgr = manager_with(vec![delete(0, 2)]);
            let transformed = mgr.transform(&delete(5, 2));
            assert_eq!(transformed, vec![delete(3, 2)]);
            assert_eq!(mgr.operations(), &[delete(0, 2)]);
        }

        #[test]
        fn insert_before_concurrent_delete_shifts_it() {
            let mut mgr = manager_with(vec![delete(3, 2)]);
            let transformed = mgr.transform(&insert(1, "ab"));
            assert_eq!(transformed, vec![insert(1, "ab")]);
            assert_eq!(mgr.operations(), &[delete(5, 2)]);
        }

        #[test]
        fn insert_past_concurrent_delete_shifts_left() {
            let mut mgr = manager_with(vec![delete(1, 2)]);
            let transformed = mgr.transform(&insert(5, "ab"));
            assert_eq!(transformed, vec![insert(3, "ab")]);
            assert_eq!(mgr.operations(), &[delete(1, 2)]);
        }

        #[test]
        fn delete_at_concurrent_insert_index_favours_the_insert() {
            let mut mgr = manager_with(vec![insert(2, "zz")]);
            let transformed = mgr.transform(&delete(2, 2));
            assert_eq!(transformed, vec![delete(4, 2)]);
            assert_eq!(mgr.operations(), &[insert(2, "zz")]);
        }

        #[test]
        fn element_insert_shifts_text_ops_by_one() {
            let mut mgr = manager_with(vec![element_insert(0, "gadget")]);
            let transformed = mgr.transform(&insert(3, "a"));
            assert_eq!(transformed, vec![insert(4, "a")]);
            assert_eq!(mgr.operations(), &[element_insert(0, "gadget")]);
        }

        #[test]
        fn change_inside_concurrent_delete_collapses_to_its_start() {
            let mut mgr = manager_with(vec![delete(2, 3)]);
            let transformed = mgr.transform(&element_delta(4, "e1", &[]));
            assert_eq!(transformed, vec![element_delta(2, "e1", &[])]);
        }

        #[test]
        fn change_past_concurrent_delete_shifts_left() {
            let mut mgr = manager_with(vec![delete(2, 3)]);
            let transformed = mgr.transform(&setpref(6, "k", json!(1)));
            assert_eq!(transformed, vec![setpref(3, "k", json!(1))]);
        }

        #[test]
        fn change_at_concurrent_insert_shifts_right() {
            let mut mgr = manager_with(vec![insert(2, "ab")]);
            let transformed = mgr.transform(&setpref(2, "k", json!(1)));
            assert_eq!(transformed, vec![setpref(4, "k", json!(1))]);
        }

        #[test]
        fn delete_shifts_tracked_change() {
            let mut mgr = manager_with(vec![element_delta(5, "e1", &[])]);
            let transformed = mgr.transform(&delete(1, 2));
            assert_eq!(transformed, vec![delete(1, 2)]);
            assert_eq!(mgr.operations(), &[element_delta(3, "e1", &[])]);
        }

        #[test]
        fn delete_reaching_tracked_change_collapses_it() {
            let mut mgr = manager_with(vec![element_delta(3, "e1", &[])]);
            let transformed = mgr.transform(&delete(1, 2));
            assert_eq!(transformed, vec![delete(1, 2)]);
            assert_eq!(mgr.operations(), &[element_delta(1, "e1", &[])]);
        }

        #[test]
        fn insert_shifts_tracked_change() {
            let mut mgr = manager_with(vec![element_delta(3, "e1", &[])]);
            let transformed = mgr.transform(&insert(1, "ab"));
            assert_eq!(transformed, vec![insert(1, "ab")]);
            assert_eq!(mgr.operations(), &[element_delta(5, "e1", &[])]);
        }

        #[test]
        fn changes_do_not_influence_each_other() {
            let mut mgr = manager_with(vec![element_delta(3, "e1", &[("a", json!(1))])]);
            let transformed = mgr.transform(&element_delta(3, "e1", &[("b", json!(2))]));
            assert_eq!(transformed, vec![element_delta(3, "e1", &[("b", json!(2))])]);
            assert_eq!(
                mgr.operations(),
                &[element_delta(3, "e1", &[("a", json!(1))])]
            );
        }

        #[test]
        fn incompatible_operations_pass_through() {
            let mut foreign = insert(0, "Y");
            foreign.blip_id = "other_blip".to_string();
            let mut mgr = manager_with(vec![foreign.clone()]);
            let transformed = mgr.transform(&insert(0, "X"));
            assert_eq!(transformed, vec![insert(0, "X")]);
            assert_eq!(mgr.operations(), &[foreign]);
        }

        #[test]
        fn non_positional_operations_pass_through() {
            let mut tracked = element_delta(0, "e1", &[]);
            tracked.index = None;
            let mut mgr = manager_with(vec![tracked.clone()]);
            let transformed = mgr.transform(&insert(0, "X"));
            assert_eq!(transformed, vec![insert(0, "X")]);
            assert_eq!(mgr.operations(), &[tracked]);
        }

        #[test]
        fn removal_is_announced_to_observers() {
            let log = Rc::new(RefCell::new(Vec::new()));
            let mut mgr = manager_with(vec![delete(2, 2)]);
            let before = Rc::clone(&log);
            mgr.subscribe(EventKind::BeforeOperationsRemoved, move |event| {
                before.borrow_mut().push(*event);
            });
            let after = Rc::clone(&log);
            mgr.subscribe(EventKind::AfterOperationsRemoved, move |event| {
                after.borrow_mut().push(*event);
            });

            mgr.transform(&delete(1, 4));

            assert_eq!(
                *log.borrow(),
                vec![
                    OpEvent::BeforeOperationsRemoved { start: 0, end: 0 },
                    OpEvent::AfterOperationsRemoved { start: 0, end: 0 },
                ]
            );
        }

        #[test]
        fn transform_by_manager_shifts_both_sides() {
            let mut incoming = manager_with(vec![insert(0, "Y")]);
            let mut pending = manager_with(vec![insert(0, "X")]);

            incoming.transform_by_manager(&mut pending);

            assert_eq!(incoming.operations(), &[insert(0, "Y")]);
            assert_eq!(pending.operations(), &[insert(1, "X")]);
        }
    }

    mod merge_rules {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn consecutive_single_character_inserts_collapse() {
            let mut mgr = manager();
            mgr.document_insert(BLIP, 0, "H");
            mgr.document_insert(BLIP, 1, "i");
            assert_eq!(mgr.operations(), &[insert(0, "Hi")]);
        }

        #[test]
        fn insert_at_start_of_last_insert_prepends() {
            let mut mgr = manager();
            mgr.document_insert(BLIP, 2, "world");
            mgr.document_insert(BLIP, 2, "hello ");
            assert_eq!(mgr.operations(), &[insert(2, "hello world")]);
        }

        #[test]
        fn insert_within_last_insert_splices() {
            let mut mgr = manager();
            mgr.document_insert(BLIP, 0, "hd");
            mgr.document_insert(BLIP, 1, "ello worl");
            assert_eq!(mgr.operations(), &[insert(0, "hello world")]);
        }

        #[test]
        fn disjoint_insert_is_appended() {
            let mut mgr = manager();
            mgr.document_insert(BLIP, 0, "ab");
            mgr.document_insert(BLIP, 5, "cd");
            assert_eq!(mgr.operations(), &[insert(0, "ab"), insert(5, "cd")]);
        }

        #[test]
        fn deleting_forward_extends_the_last_delete() {
            let mut mgr = manager();
            mgr.document_delete(BLIP, 2, 4);
            mgr.document_delete(BLIP, 2, 4);
            assert_eq!(mgr.operations(), &[delete(2, 4)]);
        }

        #[test]
        fn backspacing_extends_the_last_delete_leftwards() {
            let mut mgr = manager();
            mgr.document_delete(BLIP, 4, 5);
            mgr.document_delete(BLIP, 3, 4);
            mgr.document_delete(BLIP, 2, 3);
            assert_eq!(mgr.operations(), &[delete(2, 3)]);
        }

        #[test]
        fn delete_eats_the_front_of_the_last_insert() {
            let mut mgr = manager();
            mgr.document_insert(BLIP, 0, "Hi");
            mgr.document_delete(BLIP, 0, 1);
            assert_eq!(mgr.operations(), &[insert(0, "i")]);
        }

        #[test]
        fn delete_cancelling_the_last_insert_leaves_nothing() {
            let mut mgr = manager();
            mgr.document_insert(BLIP, 0, "Hi");
            mgr.document_delete(BLIP, 0, 2);
            assert!(mgr.is_empty());
        }

        #[test]
        fn delete_longer_than_the_last_insert_keeps_the_remainder() {
            let mut mgr = manager();
            mgr.document_insert(BLIP, 1, "Hi");
            mgr.document_delete(BLIP, 1, 4);
            assert_eq!(mgr.operations(), &[delete(1, 1)]);
        }

        #[test]
        fn delete_within_the_last_insert() {
            let mut mgr = manager();
            mgr.document_insert(BLIP, 0, "hello");
            mgr.document_delete(BLIP, 1, 3);
            assert_eq!(mgr.operations(), &[insert(0, "hlo")]);
        }

        #[test]
        fn delete_through_the_end_of_the_last_insert_keeps_the_remainder() {
            let mut mgr = manager();
            mgr.document_insert(BLIP, 0, "hello");
            mgr.document_delete(BLIP, 2, 9);
            assert_eq!(mgr.operations(), &[insert(0, "he"), delete(2, 4)]);
        }

        #[test]
        fn element_delta_merges_with_any_predecessor_on_the_same_element() {
            let mut mgr = manager();
            mgr.document_element_delta(BLIP, 3, "e1", [("a".to_string(), json!(1))].into_iter().collect());
            mgr.document_insert(BLIP, 0, "x");
            mgr.document_element_delta(
                BLIP,
                4,
                "e1",
                [("b".to_string(), json!(2)), ("a".to_string(), Value::Null)]
                    .into_iter()
                    .collect(),
            );

            assert_eq!(mgr.len(), 2);
            assert_eq!(
                mgr.operations()[0],
                element_delta(3, "e1", &[("b", json!(2))])
            );
        }

        #[test]
        fn element_delta_for_another_element_is_appended() {
            let mut mgr = manager();
            mgr.document_element_delta(BLIP, 3, "e1", JsonMap::new());
            mgr.document_element_delta(BLIP, 5, "e2", JsonMap::new());
            assert_eq!(mgr.len(), 2);
        }

        #[test]
        fn null_operations_are_never_stored() {
            let mut mgr = manager();
            mgr.document_insert(BLIP, 0, "");
            mgr.document_delete(BLIP, 3, 3);
            mgr.document_delete(BLIP, 4, 2);
            assert!(mgr.is_empty());
        }

        #[test]
        fn merge_fires_operation_changed() {
            let log = Rc::new(RefCell::new(Vec::new()));
            let mut mgr = manager();
            let changed = Rc::clone(&log);
            mgr.subscribe(EventKind::OperationChanged, move |event| {
                changed.borrow_mut().push(*event);
            });

            mgr.document_insert(BLIP, 0, "H");
            mgr.document_insert(BLIP, 1, "i");

            assert_eq!(*log.borrow(), vec![OpEvent::OperationChanged { index: 0 }]);
        }

        #[test]
        fn element_builders_append() {
            let mut mgr = manager();
            mgr.document_element_insert(BLIP, 2, "gadget", JsonMap::new());
            mgr.document_element_delete(BLIP, 5);
            assert_eq!(
                mgr.operations(),
                &[element_insert(2, "gadget"), element_delete(5)]
            );
        }

        #[test]
        fn setpref_does_not_merge() {
            let mut mgr = manager();
            mgr.document_element_setpref(BLIP, 2, "color", json!("red"));
            mgr.document_element_setpref(BLIP, 2, "color", json!("green"));
            assert_eq!(mgr.len(), 2);
        }
    }

    mod fetch_and_put {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn fetch_drains_and_announces() {
            let log = Rc::new(RefCell::new(Vec::new()));
            let mut mgr = manager_with(vec![insert(0, "a"), insert(5, "b")]);
            let removed = Rc::clone(&log);
            mgr.subscribe(EventKind::BeforeOperationsRemoved, move |event| {
                removed.borrow_mut().push(*event);
            });

            let ops = mgr.fetch();

            assert_eq!(ops, vec![insert(0, "a"), insert(5, "b")]);
            assert!(mgr.is_empty());
            assert_eq!(
                *log.borrow(),
                vec![OpEvent::BeforeOperationsRemoved { start: 0, end: 1 }]
            );
        }

        #[test]
        fn fetch_on_empty_manager_is_silent() {
            let fired = Rc::new(RefCell::new(false));
            let mut mgr = manager();
            let flag = Rc::clone(&fired);
            mgr.subscribe(EventKind::BeforeOperationsRemoved, move |_| {
                *flag.borrow_mut() = true;
            });

            assert_eq!(mgr.fetch(), vec![]);
            assert!(!*fired.borrow());
        }

        #[test]
        fn put_appends_without_merging() {
            let mut mgr = manager();
            mgr.put(vec![insert(0, "a")]);
            mgr.put(vec![insert(1, "b")]);
            assert_eq!(mgr.operations(), &[insert(0, "a"), insert(1, "b")]);
        }

        #[test]
        fn serialized_batch_round_trips() {
            let mut mgr = manager_with(vec![insert(0, "a"), delete(3, 2)]);
            let wire = mgr.serialize(true);
            assert!(mgr.is_empty());

            let mut other = manager();
            other.unserialize(&wire).unwrap();
            assert_eq!(other.operations(), &[insert(0, "a"), delete(3, 2)]);
        }

        #[test]
        fn invalid_batch_is_rejected_whole() {
            let mut wire = vec![insert(0, "a").serialize(), delete(3, 2).serialize()];
            wire[1].kind = "DOCUMENT_REPLACE".to_string();

            let mut mgr = manager();
            assert!(mgr.unserialize(&wire).is_err());
            assert!(mgr.is_empty());
        }
    }

    mod convergence {
        use super::*;
        use pretty_assertions::assert_eq;
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        fn apply(content: &str, op: &Operation) -> String {
            let chars: Vec<char> = content.chars().collect();
            let index = op.index.expect("test ops are positional");
            match &op.payload {
                OpPayload::Insert(text) => {
                    assert!(index <= chars.len(), "insert out of range");
                    let mut out: String = chars[..index].iter().collect();
                    out.push_str(text);
                    out.extend(&chars[index..]);
                    out
                }
                OpPayload::Delete(count) => {
                    assert!(index + count <= chars.len(), "delete out of range");
                    let mut out: String = chars[..index].iter().collect();
                    out.extend(&chars[index + count..]);
                    out
                }
                _ => content.to_string(),
            }
        }

        fn apply_all(content: &str, ops: &[Operation]) -> String {
            ops.iter().fold(content.to_string(), |text, op| apply(&text, op))
        }

        fn random_op(rng: &mut StdRng, len: usize) -> Operation {
            let alphabet = ['a', 'b', 'c', 'ö', '🥕'];
            if len == 0 || rng.gen_bool(0.5) {
                let at = rng.gen_range(0..=len);
                let text: String = (0..rng.gen_range(1..=3))
                    .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
                    .collect();
                insert(at, &text)
            } else {
                let at = rng.gen_range(0..len);
                let count = rng.gen_range(1..=len - at);
                delete(at, count)
            }
        }

        /// The two halves of the dual transform close the diamond: applying
        /// the input and then the rewritten manager list matches applying
        /// the manager's original list and then the returned operations.
        #[test]
        fn random_op_pairs_converge() {
            let mut rng = StdRng::seed_from_u64(23);
            for _ in 0..1000 {
                let len = rng.gen_range(0..12);
                let state: String = (0..len)
                    .map(|i| char::from_digit(i as u32, 36).expect("state fits one digit"))
                    .collect();

                let a = random_op(&mut rng, len);
                let b = random_op(&mut rng, len);

                let mut mgr = manager_with(vec![b.clone()]);
                let a_transformed = mgr.transform(&a);
                let b_transformed = mgr.fetch();

                let via_a = apply_all(&apply(&state, &a), &b_transformed);
                let via_b = apply_all(&apply(&state, &b), &a_transformed);
                assert_eq!(
                    via_a, via_b,
                    "diverged for a = {a:?}, b = {b:?} on {state:?}"
                );
            }
        }
    }
}
