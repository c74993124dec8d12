// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multi-request batching.
//!
//! Grounded on `meross_device.py`'s `async_request_poll` (accumulate) and
//! `async_request_flush` (send + truncation recovery): rather than issuing
//! one HTTP/MQTT round trip per namespace, the engine queues requests into
//! a single `Appliance.Control.Multiple` envelope and flushes it once either
//! the estimated size would exceed the learned
//! [`PayloadBudget`](super::budget::PayloadBudget), the device's advertised
//! `maxCmdNum` slot count would be exceeded, or the caller explicitly
//! flushes. Recovering from a partial or missing reply to a flushed batch
//! (re-dispatch what arrived, re-issue the rest) is the caller's job — see
//! [`DeviceEngine::flush_with_recovery`](super::DeviceEngine::flush_with_recovery) —
//! since that requires an actual transport, which this module never touches.

use serde_json::Value;

use crate::codec::Method;

/// An individual request queued into a batch, with a rough serialized-size
/// estimate used to decide when to flush.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    /// The namespace this request addresses.
    pub namespace: String,
    /// The wire method (`GET`/`SET`/...).
    pub method: Method,
    /// The request payload.
    pub payload: Value,
    estimated_size: usize,
}

/// Accumulates namespace requests for a single device ahead of a flush.
#[derive(Debug)]
pub struct Batch {
    queued: Vec<QueuedRequest>,
    estimated_total: usize,
    /// Slots remaining in the current batch before `maxCmdNum` is hit.
    /// Re-armed to `max_cmd_num` the moment a new batch starts accumulating.
    remaining_slots: usize,
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

impl Batch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queued: Vec::new(),
            estimated_total: 0,
            remaining_slots: usize::MAX,
        }
    }

    /// Queues a request. `max_cmd_num` is the device's advertised
    /// `Appliance.Control.Multiple` slot count (`usize::MAX` if unknown or
    /// unsupported, i.e. no slot ceiling). Returns `true` if the batch should
    /// be flushed now, either because the estimated size would reach
    /// `max_size` or because this request used up the last remaining slot.
    pub fn push(
        &mut self,
        namespace: &str,
        method: Method,
        payload: Value,
        max_size: usize,
        max_cmd_num: usize,
    ) -> bool {
        if self.queued.is_empty() {
            self.remaining_slots = max_cmd_num;
        }
        let estimated_size = namespace.len() + payload.to_string().len() + 64;
        self.queued.push(QueuedRequest {
            namespace: namespace.to_string(),
            method,
            payload,
            estimated_size,
        });
        self.estimated_total += estimated_size;
        self.remaining_slots = self.remaining_slots.saturating_sub(1);
        self.estimated_total >= max_size || self.remaining_slots == 0
    }

    /// `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// The number of requests currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    /// Drains every queued request, resetting the batch to empty. The
    /// caller decides how to send them (a single direct request, or wrapped
    /// as `Appliance.Control.Multiple`) and how to recover from a partial or
    /// missing reply.
    pub fn drain(&mut self) -> Vec<QueuedRequest> {
        self.estimated_total = 0;
        self.remaining_slots = usize::MAX;
        self.queued.drain(..).collect()
    }
}

/// Finds the last complete sub-request in a truncated multi-request body and
/// truncates there, closing the JSON array/object so the salvaged prefix
/// still parses. Returns `None` if no complete sub-request can be recovered.
#[must_use]
pub fn salvage_multi_request(body: &str) -> Option<String> {
    let marker = ",{\"header\":";
    let cut = body.rfind(marker)?;
    let mut salvaged = body[..cut].to_string();
    salvaged.push_str("]}}");
    serde_json::from_str::<Value>(&salvaged).ok()?;
    Some(salvaged)
}
