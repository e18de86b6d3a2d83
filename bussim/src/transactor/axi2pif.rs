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

//! AXI slave in front of a PIF bus.
//!
//! Read bursts arrive on slave port 0 and write bursts on slave port 1.
//! Each burst is cut into PIF READ/WRITE and BLOCK_READ/BLOCK_WRITE
//! transactions on master port 0; their responses are merged back into AXI
//! beats carrying the most severe status seen.

use super::{gather, span, split_range, IdPool, OrderTracker, Piece, TransInfo};
use crate::config::Axi2PifConfig;
use crate::issuer::{RequestIssuer, ResponseIssuer};
use crate::pool::{Handle, Pool};
use crate::protocol::{
    BurstType, Request, RequestLink, RequestSink, RequestType, Response, ResponseLink,
    ResponseSink, Status,
};
use crate::sim::{Module, ModuleId, ProcessId, Scheduler, SimContext, Time};
use crate::Error;

use std::collections::{BTreeMap, HashMap, VecDeque};

pub const AXI_READ_PORT: usize = 0;
pub const AXI_WRITE_PORT: usize = 1;

const PIF: ProcessId = 0;
const READ_RESPONSE: ProcessId = 1;
const WRITE_RESPONSE: ProcessId = 2;
const READ_ENGINE: ProcessId = 3;
const WRITE_ENGINE: ProcessId = 4;
const FAULT: ProcessId = 5;

#[derive(Debug)]
struct Pending {
    ready: Time,
    sequence: u64,
    handle: Handle,
}

/// A transaction being cut into PIF pieces.
#[derive(Debug)]
struct Plan {
    handle: Handle,
    pieces: VecDeque<Vec<Request>>,
}

pub struct Axi2Pif {
    id: ModuleId,
    name: String,
    config: Axi2PifConfig,
    clock_period: Time,
    pif: RequestIssuer,
    axi_read: ResponseIssuer,
    axi_write: ResponseIssuer,
    infos: Pool<TransInfo>,
    read_fifo: VecDeque<Pending>,
    write_fifo: VecDeque<(Time, u64, Request)>,
    assembling: HashMap<u64, (Handle, u64)>,
    ready_writes: VecDeque<Pending>,
    read_plan: Option<Plan>,
    write_plan: Option<Plan>,
    ids: IdPool,
    inflight: HashMap<u32, Handle>,
    order: OrderTracker,
    sequence: u64,
    fault: Option<Error>,
    transactions: u64,
    pieces: u64,
    naccs: u64,
}

impl Axi2Pif {
    pub fn new(
        id: ModuleId,
        name: &str,
        ctx: &SimContext,
        config: Axi2PifConfig,
    ) -> Result<Self, Error> {
        for (what, width) in [
            ("axi_byte_width", config.axi_byte_width),
            ("pif_byte_width", config.pif_byte_width),
        ] {
            if !matches!(width, 4 | 8 | 16 | 32 | 64) {
                return Err(Error::config(name, format!("unsupported {} {}", what, width)));
            }
        }
        if !matches!(config.max_block_beats, 1 | 2 | 4 | 8 | 16) {
            return Err(Error::config(
                name,
                format!("max_block_beats {} is not 1, 2, 4, 8 or 16", config.max_block_beats),
            ));
        }
        if config.read_request_fifo_depth == 0 || config.write_request_fifo_depth == 0 {
            return Err(Error::config(name, "request FIFO depths must be at least 1"));
        }
        if config.outstanding_pif_request_ids == 0 {
            return Err(Error::config(name, "outstanding_pif_request_ids must be at least 1"));
        }
        let clock_period = ctx.period_or_default(config.clock_period);
        Ok(Self {
            id,
            name: name.to_string(),
            clock_period,
            pif: RequestIssuer::new(
                &format!("{}.pif", name),
                id,
                PIF,
                0,
                clock_period,
                config.nacc_wait_time,
            )?,
            axi_read: ResponseIssuer::new(
                &format!("{}.axi_read", name),
                id,
                READ_RESPONSE,
                AXI_READ_PORT,
                clock_period,
            ),
            axi_write: ResponseIssuer::new(
                &format!("{}.axi_write", name),
                id,
                WRITE_RESPONSE,
                AXI_WRITE_PORT,
                clock_period,
            ),
            infos: Pool::new(),
            read_fifo: VecDeque::new(),
            write_fifo: VecDeque::new(),
            assembling: HashMap::new(),
            ready_writes: VecDeque::new(),
            read_plan: None,
            write_plan: None,
            ids: IdPool::new(config.outstanding_pif_request_ids),
            inflight: HashMap::new(),
            order: OrderTracker::default(),
            sequence: 0,
            fault: None,
            transactions: 0,
            pieces: 0,
            naccs: 0,
            config,
        })
    }

    /// PIF ids currently in use.
    pub fn outstanding(&self) -> usize {
        self.ids.outstanding()
    }

    /// PIF transactions issued so far.
    pub fn pieces(&self) -> u64 {
        self.pieces
    }

    fn fail(&mut self, err: Error, sched: &mut Scheduler) {
        log::error!("{}", err);
        if self.fault.is_none() {
            self.fault = Some(err);
        }
        sched.notify(self.id, FAULT, 0);
    }

    /// INCR bursts at least as wide as the PIF are cut as one byte range;
    /// everything else goes beat by beat.
    fn is_contiguous(&self, request: &Request) -> bool {
        request.num_transfers <= 1
            || (request.burst == BurstType::Incr && request.size >= self.config.pif_byte_width)
    }

    fn plan_read(&self, request: &Request) -> VecDeque<Vec<Request>> {
        let width = self.config.pif_byte_width;
        let pieces = if self.is_contiguous(request) {
            split_range(
                request.address,
                request.total_bytes(),
                width,
                self.config.max_block_beats,
            )
        } else {
            (0..request.num_transfers)
                .flat_map(|beat| {
                    split_range(request.beat_address(beat), request.size as u64, width, 1)
                })
                .collect()
        };
        pieces
            .into_iter()
            .map(|piece| match piece {
                Piece::Single { address, size } => vec![Request::read(address, size)],
                Piece::Block { address, beats } => vec![Request::block_read(address, width, beats)],
            })
            .collect()
    }

    fn plan_write(&self, info: &TransInfo) -> VecDeque<Vec<Request>> {
        let width = self.config.pif_byte_width;
        let single = |bytes: &BTreeMap<u64, u8>, address: u64, size: u32| {
            let (data, enables) = gather(bytes, address, size);
            let mut request = Request::write(address, &data);
            request.byte_enables = enables;
            vec![request]
        };
        if self.is_contiguous(&info.request) {
            let bytes = info.write_bytes();
            let (start, len) = span(&info.request);
            split_range(start, len, width, self.config.max_block_beats)
                .into_iter()
                .map(|piece| match piece {
                    Piece::Single { address, size } => single(&bytes, address, size),
                    Piece::Block { address, beats } => {
                        let (data, _) = gather(&bytes, address, beats * width);
                        let mut requests = Request::block_write(address, width, &data);
                        for request in &mut requests {
                            request.byte_enables = gather(&bytes, request.address, width).1;
                        }
                        requests
                    }
                })
                .collect()
        } else {
            info.beats
                .iter()
                .flat_map(|beat| {
                    let mut bytes = BTreeMap::new();
                    for (i, byte) in beat.data.iter().enumerate() {
                        if i >= 64 || beat.byte_enables & (1 << i) != 0 {
                            bytes.insert(beat.address + i as u64, *byte);
                        }
                    }
                    split_range(beat.address, beat.data.len() as u64, width, 1)
                        .into_iter()
                        .filter_map(|piece| match piece {
                            Piece::Single { address, size } => Some(single(&bytes, address, size)),
                            Piece::Block { .. } => None,
                        })
                        .collect::<Vec<_>>()
                })
                .collect()
        }
    }

    fn start_plan(&mut self, handle: Handle, write: bool) -> Option<Plan> {
        let info = self.infos.get(handle)?;
        let pieces = if write {
            self.plan_write(info)
        } else {
            self.plan_read(&info.request)
        };
        let exclusive = info.request.exclusive;
        if exclusive && pieces.len() > 1 {
            log::warn!(
                "{}: exclusive {} spans {} PIF transactions and cannot succeed",
                self.name,
                info.request,
                pieces.len()
            );
        }
        if let Some(info) = self.infos.get_mut(handle) {
            if exclusive && pieces.len() > 1 {
                info.exclusive_ok = false;
            }
        }
        log::debug!(
            "{}: {} {} becomes {} PIF transaction(s)",
            self.name,
            if write { "write" } else { "read" },
            handle.index(),
            pieces.len()
        );
        Some(Plan { handle, pieces })
    }

    /// Issues pieces of the current plan while PIF ids last. Returns true
    /// when the plan is finished.
    fn issue_plan(&mut self, plan: &mut Plan, sched: &mut Scheduler) -> Result<bool, Error> {
        let (route_id, priority, exclusive, pc) = match self.infos.get(plan.handle) {
            Some(info) => (
                info.request.route_id,
                info.request.priority,
                info.request.exclusive && info.exclusive_ok,
                info.request.pc,
            ),
            None => {
                return Err(Error::protocol(&self.name, None, None, "plan without transaction"));
            }
        };
        while !plan.pieces.is_empty() {
            let pif_id = match self.ids.acquire() {
                Some(pif_id) => pif_id,
                None => return Ok(false),
            };
            let tag = sched.next_tag();
            let beats = plan.pieces.pop_front().unwrap_or_default();
            for mut beat in beats {
                beat.tag = tag;
                beat.id = pif_id;
                beat.route_id = route_id;
                beat.priority = priority;
                beat.exclusive = exclusive;
                beat.pc = pc;
                self.pif.push(beat, 0, sched);
            }
            self.inflight.insert(pif_id, plan.handle);
            self.pieces += 1;
            if let Some(info) = self.infos.get_mut(plan.handle) {
                info.constituents += 1;
            }
        }
        let complete = match self.infos.get_mut(plan.handle) {
            Some(info) => {
                info.dispatched = true;
                info.is_complete()
            }
            None => false,
        };
        if complete {
            self.finish(plan.handle, sched);
        }
        Ok(true)
    }

    fn run_read_engine(&mut self, sched: &mut Scheduler) -> Result<(), Error> {
        let now = sched.now();
        loop {
            let mut plan = match self.read_plan.take() {
                Some(plan) => plan,
                None => {
                    let (ready, sequence, handle) = match self.read_fifo.front() {
                        Some(next) => (next.ready, next.sequence, next.handle),
                        None => return Ok(()),
                    };
                    if ready > now {
                        sched.notify_at(self.id, READ_ENGINE, ready);
                        return Ok(());
                    }
                    let (start, len) = match self.infos.get(handle) {
                        Some(info) => span(&info.request),
                        None => (0, 0),
                    };
                    if self.order.read_must_wait(
                        sequence,
                        start,
                        len,
                        self.config.maintain_order,
                        self.config.wait_on_outstanding_write,
                    ) {
                        log::trace!("{}: read {} waits for older writes", self.name, handle.index());
                        return Ok(());
                    }
                    self.read_fifo.pop_front();
                    match self.start_plan(handle, false) {
                        Some(plan) => plan,
                        None => continue,
                    }
                }
            };
            if !self.issue_plan(&mut plan, sched)? {
                self.read_plan = Some(plan);
                return Ok(());
            }
        }
    }

    fn run_write_engine(&mut self, sched: &mut Scheduler) -> Result<(), Error> {
        let now = sched.now();
        while let Some((ready, _, _)) = self.write_fifo.front() {
            if *ready > now {
                sched.notify_at(self.id, WRITE_ENGINE, *ready);
                break;
            }
            let (_, sequence, beat) = match self.write_fifo.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            self.assemble(sequence, beat, now);
        }
        loop {
            let mut plan = match self.write_plan.take() {
                Some(plan) => plan,
                None => match self.ready_writes.pop_front() {
                    Some(next) => match self.start_plan(next.handle, true) {
                        Some(plan) => plan,
                        None => continue,
                    },
                    None => return Ok(()),
                },
            };
            if !self.issue_plan(&mut plan, sched)? {
                self.write_plan = Some(plan);
                return Ok(());
            }
        }
    }

    fn assemble(&mut self, sequence: u64, beat: Request, now: Time) {
        let tag = beat.tag;
        let last = beat.last_transfer;
        let handle = match self.assembling.get(&tag) {
            Some((handle, _)) => *handle,
            None => {
                let handle = self.infos.acquire(TransInfo::new(beat.clone()));
                self.assembling.insert(tag, (handle, sequence));
                handle
            }
        };
        if let Some(info) = self.infos.get_mut(handle) {
            info.beats.push(beat);
        }
        if !last {
            return;
        }
        let sequence = self
            .assembling
            .remove(&tag)
            .map_or(sequence, |(_, sequence)| sequence);
        self.ready_writes.push_back(Pending {
            ready: now,
            sequence,
            handle,
        });
    }

    /// Answers the AXI master once every piece has come back.
    fn finish(&mut self, handle: Handle, sched: &mut Scheduler) {
        let info = match self.infos.release(handle) {
            Some(info) => info,
            None => return,
        };
        let status = if info.status.is_error() {
            info.status.to_axi()
        } else if info.exclusive_ok {
            Status::ExOkay
        } else {
            Status::AxiOk
        };
        let delay = self.config.response_delay * self.clock_period;
        let request = &info.request;
        log::debug!(
            "{}: tag {} done after {} piece(s) with {}",
            self.name,
            request.tag,
            info.constituents,
            status
        );
        self.transactions += 1;
        if request.request_type.is_write() {
            self.order.remove_write(request.tag);
            self.axi_write.push(Response::new(request, status), delay, sched);
            sched.notify(self.id, READ_ENGINE, 0);
        } else {
            let beats = request.num_transfers.max(1);
            for beat in 0..beats {
                let address = request.beat_address(beat);
                let mut response = Response::new(request, status)
                    .with_beat(beat + 1, beat + 1 == beats)
                    .with_data(info.bytes(address, request.size));
                response.address = address;
                self.axi_read.push(response, delay, sched);
            }
        }
    }
}

impl RequestSink for Axi2Pif {
    fn nb_request(&mut self, port: usize, request: Request, sched: &mut Scheduler) {
        let now = sched.now();
        let ready = now + self.config.request_delay * self.clock_period;
        match port {
            AXI_READ_PORT => {
                if !matches!(request.request_type, RequestType::Read | RequestType::BurstRead) {
                    let err = Error::protocol(
                        &self.name,
                        Some(request.tag),
                        Some(request.address),
                        format!("{} on the AXI read channel", request.request_type),
                    );
                    self.fail(err, sched);
                    return;
                }
                if self.read_fifo.len() >= self.config.read_request_fifo_depth {
                    self.naccs += 1;
                    self.axi_read.push_nacc(Response::nacc(&request), sched);
                    return;
                }
                self.sequence += 1;
                log::trace!("{}: accepted {}", self.name, request);
                let handle = self.infos.acquire(TransInfo::new(request));
                self.read_fifo.push_back(Pending {
                    ready,
                    sequence: self.sequence,
                    handle,
                });
                sched.notify_at(self.id, READ_ENGINE, ready);
            }
            AXI_WRITE_PORT => {
                if !matches!(request.request_type, RequestType::Write | RequestType::BurstWrite) {
                    let err = Error::protocol(
                        &self.name,
                        Some(request.tag),
                        Some(request.address),
                        format!("{} on the AXI write channel", request.request_type),
                    );
                    self.fail(err, sched);
                    return;
                }
                if self.write_fifo.len() >= self.config.write_request_fifo_depth {
                    self.naccs += 1;
                    self.axi_write.push_nacc(Response::nacc(&request), sched);
                    return;
                }
                if request.transfer_number == 1 {
                    self.sequence += 1;
                    let (start, len) = span(&request);
                    self.order.add_write(self.sequence, request.tag, start, len);
                }
                log::trace!("{}: accepted {}", self.name, request);
                self.write_fifo.push_back((ready, self.sequence, request));
                sched.notify_at(self.id, WRITE_ENGINE, ready);
            }
            _ => self.fail(Error::InvalidPort(port), sched),
        }
    }

    fn nb_peek(&mut self, _port: usize, address: u64, buffer: &mut [u8]) -> Result<(), Error> {
        self.pif.link()?.nb_peek(address, buffer)
    }

    fn nb_poke(&mut self, _port: usize, address: u64, data: &[u8]) -> Result<(), Error> {
        self.pif.link()?.nb_poke(address, data)
    }

    fn bind_upstream(&mut self, port: usize, link: ResponseLink) -> Result<(), Error> {
        match port {
            AXI_READ_PORT => self.axi_read.bind(link),
            AXI_WRITE_PORT => self.axi_write.bind(link),
            _ => Err(Error::InvalidPort(port)),
        }
    }
}

impl ResponseSink for Axi2Pif {
    fn nb_respond(&mut self, _port: usize, response: Response, sched: &mut Scheduler) -> bool {
        if response.status.is_nacc() {
            if !self.pif.on_nacc(&response) {
                let err = Error::protocol(
                    &self.name,
                    Some(response.tag),
                    Some(response.address),
                    "NACC outside the NACC window",
                );
                self.fail(err, sched);
            }
            return true;
        }
        let handle = match self.inflight.get(&response.id) {
            Some(handle) => *handle,
            None => {
                let err = Error::protocol(
                    &self.name,
                    Some(response.tag),
                    Some(response.address),
                    format!("response for PIF id {} which is not outstanding", response.id),
                );
                self.fail(err, sched);
                return true;
            }
        };
        log::trace!("{}: PIF response {}", self.name, response);
        let complete = match self.infos.get_mut(handle) {
            Some(info) => {
                info.absorb(&response);
                if response.last_transfer {
                    info.completed += 1;
                }
                info.is_complete()
            }
            None => false,
        };
        if response.last_transfer {
            self.inflight.remove(&response.id);
            self.ids.release(response.id);
            sched.notify(self.id, READ_ENGINE, 0);
            sched.notify(self.id, WRITE_ENGINE, 0);
        }
        if complete {
            self.finish(handle, sched);
        }
        true
    }

    fn bind_downstream(&mut self, port: usize, link: RequestLink) -> Result<(), Error> {
        if port != 0 {
            return Err(Error::InvalidPort(port));
        }
        self.pif.bind(link)
    }
}

impl Module for Axi2Pif {
    fn id(&self) -> ModuleId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn wake(&mut self, process: ProcessId, sched: &mut Scheduler) -> Result<(), Error> {
        match process {
            PIF => self.pif.wake(sched).map(|_| ()),
            READ_RESPONSE => self.axi_read.wake(sched).map(|_| ()),
            WRITE_RESPONSE => self.axi_write.wake(sched).map(|_| ()),
            READ_ENGINE => self.run_read_engine(sched),
            WRITE_ENGINE => self.run_write_engine(sched),
            FAULT => match self.fault.take() {
                Some(err) => Err(err),
                None => Ok(()),
            },
            _ => Err(Error::protocol(&self.name, None, None, format!("no process {}", process))),
        }
    }

    fn command(&mut self, words: &[&str], _sched: &mut Scheduler) -> Result<String, Error> {
        match words {
            ["dump_statistic_info"] => Ok(format!(
                "transactions={} pif_transactions={} outstanding_ids={} naccs={} pif_retries={}",
                self.transactions,
                self.pieces,
                self.ids.outstanding(),
                self.naccs,
                self.pif.retries()
            )),
            _ => Err(Error::UnknownCommand(words.join(" "))),
        }
    }
}
