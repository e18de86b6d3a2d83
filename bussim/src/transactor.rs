// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bridges between the AXI and PIF buses.
//!
//! Both directions share the bookkeeping in this module: a bounded pool of
//! downstream ids, per-transaction reassembly state, the read-after-write
//! ordering rules and the splitting of byte ranges into aligned pieces.

pub mod axi2pif;
pub mod pif2axi;

use crate::protocol::{Request, Response, Status};
use num::Integer;
use std::collections::BTreeMap;

/// Round-robin allocator of the ids a bridge may have outstanding
/// downstream.
#[derive(Debug)]
pub struct IdPool {
    in_use: Vec<bool>,
    next: usize,
    outstanding: usize,
}

impl IdPool {
    pub fn new(count: usize) -> Self {
        Self {
            in_use: vec![false; count],
            next: 0,
            outstanding: 0,
        }
    }

    /// The first free id at or after the round-robin pointer.
    pub fn acquire(&mut self) -> Option<u32> {
        let count = self.in_use.len();
        let id = (0..count)
            .map(|i| (self.next + i) % count)
            .find(|id| !self.in_use[*id])?;
        self.in_use[id] = true;
        self.next = (id + 1) % count;
        self.outstanding += 1;
        Some(id as u32)
    }

    /// Returns false if `id` was not outstanding.
    pub fn release(&mut self, id: u32) -> bool {
        match self.in_use.get_mut(id as usize) {
            Some(slot) if *slot => {
                *slot = false;
                self.outstanding -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn available(&self) -> usize {
        self.in_use.len() - self.outstanding
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

/// An aligned piece of a byte range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Piece {
    /// A naturally aligned access of a power-of-two size.
    Single { address: u64, size: u32 },
    /// `beats` full-width beats aligned to the block size.
    Block { address: u64, beats: u32 },
}

/// Cuts `[address, address + len)` into blocks of up to `max_block_beats`
/// beats of `width` bytes where aligned, and naturally aligned single
/// accesses of at most `width` bytes elsewhere.
pub fn split_range(address: u64, len: u64, width: u32, max_block_beats: u32) -> Vec<Piece> {
    let width = width as u64;
    let mut pieces = vec![];
    let mut address = address;
    let end = address + len;
    while address < end {
        let remaining = end - address;
        let block = [16u32, 8, 4, 2].iter().copied().find(|beats| {
            let bytes = *beats as u64 * width;
            *beats <= max_block_beats
                && bytes <= remaining
                && Integer::is_multiple_of(&address, &bytes)
        });
        if let Some(beats) = block {
            pieces.push(Piece::Block { address, beats });
            address += beats as u64 * width;
            continue;
        }
        let mut size = width.min(remaining).next_power_of_two();
        while size > remaining.min(width) || !Integer::is_multiple_of(&address, &size) {
            size /= 2;
        }
        pieces.push(Piece::Single {
            address,
            size: size as u32,
        });
        address += size;
    }
    pieces
}

/// State of one upstream transaction while its downstream pieces are in
/// flight.
#[derive(Debug)]
pub(crate) struct TransInfo {
    /// The first upstream beat.
    pub request: Request,
    /// Upstream write beats, in arrival order.
    pub beats: Vec<Request>,
    pub constituents: usize,
    pub completed: usize,
    pub dispatched: bool,
    pub status: Status,
    /// Whether every piece came back EXOKAY.
    pub exclusive_ok: bool,
    pub buffer: BTreeMap<u64, u8>,
}

impl TransInfo {
    pub fn new(request: Request) -> Self {
        Self {
            beats: vec![],
            constituents: 0,
            completed: 0,
            dispatched: false,
            status: Status::Ok,
            exclusive_ok: request.exclusive,
            buffer: BTreeMap::new(),
            request,
        }
    }

    /// Folds one downstream response beat into the transaction.
    pub fn absorb(&mut self, response: &Response) {
        self.status = self.status.combine(response.status);
        if response.status != Status::ExOkay {
            self.exclusive_ok = false;
        }
        for (i, byte) in response.data.iter().enumerate() {
            self.buffer.insert(response.address + i as u64, *byte);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.dispatched && self.completed == self.constituents
    }

    /// Reassembled bytes of `[address, address + size)`; gaps read as zero.
    pub fn bytes(&self, address: u64, size: u32) -> Vec<u8> {
        (address..address + size as u64)
            .map(|a| self.buffer.get(&a).copied().unwrap_or(0))
            .collect()
    }

    /// Bytes of the upstream write beats keyed by address, honoring byte
    /// enables.
    pub fn write_bytes(&self) -> BTreeMap<u64, u8> {
        let mut bytes = BTreeMap::new();
        for beat in &self.beats {
            for (i, byte) in beat.data.iter().enumerate() {
                if i >= 64 || beat.byte_enables & (1 << i) != 0 {
                    bytes.insert(beat.address + i as u64, *byte);
                }
            }
        }
        bytes
    }
}

/// Outstanding writes, for holding back reads that must observe them.
#[derive(Debug, Default)]
pub(crate) struct OrderTracker {
    /// (arrival sequence, tag, start, end) of each outstanding write.
    writes: Vec<(u64, u64, u64, u64)>,
}

impl OrderTracker {
    pub fn add_write(&mut self, sequence: u64, tag: u64, address: u64, len: u64) {
        self.writes.push((sequence, tag, address, address + len));
    }

    pub fn remove_write(&mut self, tag: u64) {
        self.writes.retain(|(_, t, _, _)| *t != tag);
    }

    /// Whether a read that arrived as `sequence` must wait for an older
    /// write.
    pub fn read_must_wait(
        &self,
        sequence: u64,
        address: u64,
        len: u64,
        maintain_order: bool,
        wait_on_outstanding_write: bool,
    ) -> bool {
        self.writes.iter().any(|(s, _, start, end)| {
            *s < sequence
                && (wait_on_outstanding_write
                    || (maintain_order && address < *end && *start < address + len))
        })
    }
}

/// Bytes of `[address, address + size)` present in `bytes`, with the byte
/// enables of the ones that are; missing bytes read as zero.
pub(crate) fn gather(bytes: &BTreeMap<u64, u8>, address: u64, size: u32) -> (Vec<u8>, u64) {
    let mut enables = 0u64;
    let data = (0..size as u64)
        .map(|i| match bytes.get(&(address + i)) {
            Some(byte) => {
                if i < 64 {
                    enables |= 1 << i;
                }
                *byte
            }
            None => 0,
        })
        .collect();
    (data, enables)
}

/// The span covered by a transaction's beats.
pub(crate) fn span(request: &Request) -> (u64, u64) {
    let beats = request.num_transfers.max(1);
    let (low, high) = (0..beats)
        .map(|beat| request.beat_address(beat))
        .fold((u64::MAX, 0), |(low, high), a| {
            (low.min(a), high.max(a + request.size as u64))
        });
    (low, high - low)
}
