// SPDX-FileCopyrightText: 2026 The wavesync authors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Synchronous publish channel for operation-list observers.
//!
//! Callbacks run in registration order, in the same call that mutates the
//! operation list. Subscriptions are identified by tokens so an observer's
//! owner can tear them down without keeping the observer alive through the
//! bus.

use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OperationChanged,
    BeforeOperationsInserted,
    AfterOperationsInserted,
    BeforeOperationsRemoved,
    AfterOperationsRemoved,
}

/// Payload of an operation-list event. Spans are inclusive operation-list
/// index ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpEvent {
    OperationChanged { index: usize },
    BeforeOperationsInserted { start: usize, end: usize },
    AfterOperationsInserted { start: usize, end: usize },
    BeforeOperationsRemoved { start: usize, end: usize },
    AfterOperationsRemoved { start: usize, end: usize },
}

impl OpEvent {
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::OperationChanged { .. } => EventKind::OperationChanged,
            Self::BeforeOperationsInserted { .. } => EventKind::BeforeOperationsInserted,
            Self::AfterOperationsInserted { .. } => EventKind::AfterOperationsInserted,
            Self::BeforeOperationsRemoved { .. } => EventKind::BeforeOperationsRemoved,
            Self::AfterOperationsRemoved { .. } => EventKind::AfterOperationsRemoved,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Box<dyn FnMut(&OpEvent)>;

#[derive(Default)]
pub struct EventBus {
    listeners: HashMap<EventKind, Vec<(SubscriptionId, Callback)>>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        kind: EventKind,
        callback: impl FnMut(&OpEvent) + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.listeners
            .entry(kind)
            .or_default()
            .push((id, Box::new(callback)));
        id
    }

    /// Returns false if the subscription was not registered for this kind.
    pub fn unsubscribe(&mut self, kind: EventKind, id: SubscriptionId) -> bool {
        let Some(listeners) = self.listeners.get_mut(&kind) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() < before
    }

    pub fn fire(&mut self, event: &OpEvent) {
        if let Some(listeners) = self.listeners.get_mut(&event.kind()) {
            for (_, callback) in listeners.iter_mut() {
                callback(event);
            }
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners: usize = self.listeners.values().map(Vec::len).sum();
        f.debug_struct("EventBus").field("listeners", &listeners).finish()
    }
}
