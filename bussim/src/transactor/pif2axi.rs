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

//! PIF slave in front of an AXI bus.
//!
//! PIF transactions arrive on slave port 0. Reads leave on master port 0
//! (the AXI read channel), writes on master port 1. An RCW becomes an
//! exclusive read followed, if the compare matches, by an exclusive write
//! under the same AXI id.

use super::{gather, span, split_range, IdPool, OrderTracker, Piece, TransInfo};
use crate::config::Pif2AxiConfig;
use crate::issuer::{RequestIssuer, ResponseIssuer};
use crate::pool::{Handle, Pool};
use crate::protocol::{
    BurstType, Request, RequestLink, RequestSink, RequestType, Response, ResponseLink,
    ResponseSink, Status,
};
use crate::sim::{Module, ModuleId, ProcessId, Scheduler, SimContext, Time};
use crate::Error;

use num::Integer;
use std::collections::{HashMap, VecDeque};

pub const AXI_READ_PORT: usize = 0;
pub const AXI_WRITE_PORT: usize = 1;

/// Longest AXI INCR burst the bridge forms.
const MAX_BURST_BEATS: u32 = 16;

const UPSTREAM: ProcessId = 0;
const AXI_READ: ProcessId = 1;
const AXI_WRITE: ProcessId = 2;
const READ_ENGINE: ProcessId = 3;
const WRITE_ENGINE: ProcessId = 4;
const FAULT: ProcessId = 5;

#[derive(Debug)]
struct Pending {
    ready: Time,
    sequence: u64,
    handle: Handle,
}

#[derive(Debug)]
struct Plan {
    handle: Handle,
    pieces: VecDeque<Vec<Request>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RcwPhase {
    Reading,
    Writing,
}

#[derive(Debug)]
struct RcwState {
    phase: RcwPhase,
    /// Exclusive write attempts that came back without EXOKAY.
    failures: u32,
    old: Vec<u8>,
}

fn compare_matches(old: &[u8], compare: &Request) -> bool {
    old.iter()
        .zip(compare.data.iter())
        .enumerate()
        .all(|(i, (o, c))| (i < 64 && compare.byte_enables & (1 << i) == 0) || o == c)
}

pub struct Pif2Axi {
    id: ModuleId,
    name: String,
    config: Pif2AxiConfig,
    clock_period: Time,
    upstream: ResponseIssuer,
    axi_read: RequestIssuer,
    axi_write: RequestIssuer,
    infos: Pool<TransInfo>,
    read_fifo: VecDeque<Pending>,
    write_fifo: VecDeque<(Time, u64, Request)>,
    /// Handle and first-beat sequence of each write still taking beats.
    assembling: HashMap<u64, (Handle, u64)>,
    ready_writes: VecDeque<Pending>,
    read_plan: Option<Plan>,
    write_plan: Option<Plan>,
    rcws: HashMap<Handle, RcwState>,
    ids: IdPool,
    inflight: HashMap<u32, Handle>,
    order: OrderTracker,
    sequence: u64,
    fault: Option<Error>,
    transactions: u64,
    bursts: u64,
    rcw_retries: u64,
    naccs: u64,
}

impl Pif2Axi {
    pub fn new(
        id: ModuleId,
        name: &str,
        ctx: &SimContext,
        config: Pif2AxiConfig,
    ) -> Result<Self, Error> {
        for (what, width) in [
            ("pif_byte_width", config.pif_byte_width),
            ("axi_byte_width", config.axi_byte_width),
        ] {
            if !matches!(width, 4 | 8 | 16 | 32 | 64) {
                return Err(Error::config(name, format!("unsupported {} {}", what, width)));
            }
        }
        if config.read_request_fifo_depth == 0 || config.write_request_fifo_depth == 0 {
            return Err(Error::config(name, "request FIFO depths must be at least 1"));
        }
        if config.outstanding_axi_request_ids == 0 {
            return Err(Error::config(name, "outstanding_axi_request_ids must be at least 1"));
        }
        let clock_period = ctx.period_or_default(config.clock_period);
        Ok(Self {
            id,
            name: name.to_string(),
            clock_period,
            upstream: ResponseIssuer::new(
                &format!("{}.pif", name),
                id,
                UPSTREAM,
                0,
                clock_period,
            ),
            axi_read: RequestIssuer::new(
                &format!("{}.axi_read", name),
                id,
                AXI_READ,
                AXI_READ_PORT,
                clock_period,
                config.nacc_wait_time,
            )?,
            axi_write: RequestIssuer::new(
                &format!("{}.axi_write", name),
                id,
                AXI_WRITE,
                AXI_WRITE_PORT,
                clock_period,
                config.nacc_wait_time,
            )?,
            infos: Pool::new(),
            read_fifo: VecDeque::new(),
            write_fifo: VecDeque::new(),
            assembling: HashMap::new(),
            ready_writes: VecDeque::new(),
            read_plan: None,
            write_plan: None,
            rcws: HashMap::new(),
            ids: IdPool::new(config.outstanding_axi_request_ids),
            inflight: HashMap::new(),
            order: OrderTracker::default(),
            sequence: 0,
            fault: None,
            transactions: 0,
            bursts: 0,
            rcw_retries: 0,
            naccs: 0,
            config,
        })
    }

    /// AXI ids currently in use.
    pub fn outstanding(&self) -> usize {
        self.ids.outstanding()
    }

    /// AXI transactions issued so far.
    pub fn bursts(&self) -> u64 {
        self.bursts
    }

    fn fail(&mut self, err: Error, sched: &mut Scheduler) {
        log::error!("{}", err);
        if self.fault.is_none() {
            self.fault = Some(err);
        }
        sched.notify(self.id, FAULT, 0);
    }

    fn read_pieces(&self, start: u64, len: u64) -> Vec<Vec<Request>> {
        let width = self.config.axi_byte_width;
        split_range(start, len, width, MAX_BURST_BEATS)
            .into_iter()
            .map(|piece| match piece {
                Piece::Single { address, size } => {
                    vec![Request::burst_read(address, size, 1, BurstType::Incr)]
                }
                Piece::Block { address, beats } => {
                    vec![Request::burst_read(address, width, beats, BurstType::Incr)]
                }
            })
            .collect()
    }

    /// An unaligned block fits one AXI WRAP burst when its beats are no
    /// wider than the AXI bus and its length is a legal WRAP length.
    fn wrap_fits(&self, request: &Request) -> bool {
        matches!(request.num_transfers, 2 | 4 | 8 | 16)
            && request.size <= self.config.axi_byte_width
            && Integer::is_multiple_of(&request.address, &(request.size as u64))
    }

    fn plan_read(&self, request: &Request) -> VecDeque<Vec<Request>> {
        let aligned = Integer::is_multiple_of(&request.address, &request.total_bytes().max(1));
        if request.request_type == RequestType::BlockRead && !aligned {
            if self.config.wrap_unaligned_blocks && self.wrap_fits(request) {
                let burst = Request::burst_read(
                    request.address,
                    request.size,
                    request.num_transfers,
                    BurstType::Wrap,
                );
                return VecDeque::from(vec![vec![burst]]);
            }
            return (0..request.num_transfers)
                .flat_map(|beat| self.read_pieces(request.beat_address(beat), request.size as u64))
                .collect();
        }
        let (start, len) = span(request);
        self.read_pieces(start, len).into_iter().collect()
    }

    fn plan_write(&self, info: &TransInfo) -> VecDeque<Vec<Request>> {
        let width = self.config.axi_byte_width;
        let bytes = info.write_bytes();
        let (start, len) = span(&info.request);
        split_range(start, len, width, MAX_BURST_BEATS)
            .into_iter()
            .map(|piece| match piece {
                Piece::Single { address, size } => {
                    let (data, enables) = gather(&bytes, address, size);
                    let mut request = Request::write(address, &data);
                    request.byte_enables = enables;
                    vec![request]
                }
                Piece::Block { address, beats } => {
                    let (data, _) = gather(&bytes, address, beats * width);
                    let mut requests =
                        Request::burst_write(address, width, &data, BurstType::Incr);
                    for request in &mut requests {
                        request.byte_enables = gather(&bytes, request.address, width).1;
                    }
                    requests
                }
            })
            .collect()
    }

    fn start_plan(&mut self, handle: Handle) -> Option<Plan> {
        let info = self.infos.get(handle)?;
        let request = &info.request;
        let pieces = match request.request_type {
            RequestType::Rcw => {
                let read = Request::burst_read(request.address, request.size, 1, BurstType::Incr)
                    .with_exclusive(true);
                VecDeque::from(vec![vec![read]])
            }
            _ if request.request_type.is_write() => self.plan_write(info),
            _ => self.plan_read(request),
        };
        let split_exclusive =
            request.exclusive && request.request_type != RequestType::Rcw && pieces.len() > 1;
        if split_exclusive {
            log::warn!(
                "{}: exclusive {} spans {} AXI transactions and cannot succeed",
                self.name,
                request,
                pieces.len()
            );
        }
        log::debug!(
            "{}: {} becomes {} AXI transaction(s)",
            self.name,
            request,
            pieces.len()
        );
        if request.request_type == RequestType::Rcw {
            self.rcws.insert(
                handle,
                RcwState {
                    phase: RcwPhase::Reading,
                    failures: 0,
                    old: vec![],
                },
            );
        }
        if let Some(info) = self.infos.get_mut(handle) {
            if split_exclusive {
                info.exclusive_ok = false;
            }
        }
        Some(Plan { handle, pieces })
    }

    /// Issues pieces of the current plan while AXI ids last. Returns true
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
            let axi_id = match self.ids.acquire() {
                Some(axi_id) => axi_id,
                None => return Ok(false),
            };
            let tag = sched.next_tag();
            let beats = plan.pieces.pop_front().unwrap_or_default();
            for mut beat in beats {
                beat.tag = tag;
                beat.id = axi_id;
                beat.route_id = route_id;
                beat.priority = priority;
                beat.exclusive |= exclusive;
                beat.pc = pc;
                if beat.request_type.is_write() {
                    self.axi_write.push(beat, 0, sched);
                } else {
                    self.axi_read.push(beat, 0, sched);
                }
            }
            self.inflight.insert(axi_id, plan.handle);
            self.bursts += 1;
            if let Some(info) = self.infos.get_mut(plan.handle) {
                info.constituents += 1;
            }
        }
        if let Some(info) = self.infos.get_mut(plan.handle) {
            info.dispatched = true;
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
                        log::trace!("{}: read waits for older writes", self.name);
                        return Ok(());
                    }
                    self.read_fifo.pop_front();
                    match self.start_plan(handle) {
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
                None => {
                    let (sequence, handle) = match self.ready_writes.front() {
                        Some(next) => (next.sequence, next.handle),
                        None => return Ok(()),
                    };
                    // The read half of an RCW observes older writes.
                    let rcw = match self.infos.get(handle) {
                        Some(info) if info.request.request_type == RequestType::Rcw => {
                            Some((info.request.address, info.request.size as u64))
                        }
                        _ => None,
                    };
                    if let Some((address, size)) = rcw {
                        if self.order.read_must_wait(
                            sequence,
                            address,
                            size,
                            self.config.maintain_order,
                            self.config.wait_on_outstanding_write,
                        ) {
                            return Ok(());
                        }
                    }
                    self.ready_writes.pop_front();
                    match self.start_plan(handle) {
                        Some(plan) => plan,
                        None => continue,
                    }
                }
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

    /// Answers the PIF master once every AXI transaction has come back.
    fn finish(&mut self, handle: Handle, sched: &mut Scheduler) {
        let info = match self.infos.release(handle) {
            Some(info) => info,
            None => return,
        };
        let status = if info.status.is_error() {
            info.status.to_pif()
        } else if info.exclusive_ok {
            Status::ExOkay
        } else {
            Status::Ok
        };
        let delay = self.config.response_delay * self.clock_period;
        let request = &info.request;
        log::debug!(
            "{}: tag {} done after {} AXI transaction(s) with {}",
            self.name,
            request.tag,
            info.constituents,
            status
        );
        self.transactions += 1;
        if request.request_type.is_write() {
            self.order.remove_write(request.tag);
            self.upstream.push(Response::new(request, status), delay, sched);
            sched.notify(self.id, READ_ENGINE, 0);
            return;
        }
        let beats = request.num_transfers.max(1);
        for beat in 0..beats {
            let address = request.beat_address(beat);
            let mut response = Response::new(request, status)
                .with_beat(beat + 1, beat + 1 == beats)
                .with_data(info.bytes(address, request.size));
            response.address = address;
            self.upstream.push(response, delay, sched);
        }
    }

    fn finish_rcw(
        &mut self,
        handle: Handle,
        axi_id: u32,
        status: Status,
        old: Vec<u8>,
        sched: &mut Scheduler,
    ) {
        self.inflight.remove(&axi_id);
        self.ids.release(axi_id);
        sched.notify(self.id, READ_ENGINE, 0);
        sched.notify(self.id, WRITE_ENGINE, 0);
        let info = match self.infos.release(handle) {
            Some(info) => info,
            None => return,
        };
        log::debug!(
            "{}: RCW tag {} at {:#x} done with {}",
            self.name,
            info.request.tag,
            info.request.address,
            status
        );
        self.transactions += 1;
        self.order.remove_write(info.request.tag);
        let delay = self.config.response_delay * self.clock_period;
        let response = Response::new(&info.request, status).with_data(old);
        self.upstream.push(response, delay, sched);
    }

    /// One step of the exclusive read / compare / exclusive write loop.
    fn rcw_respond(&mut self, handle: Handle, response: Response, sched: &mut Scheduler) {
        let mut state = match self.rcws.remove(&handle) {
            Some(state) => state,
            None => return,
        };
        let (first, compare, swap) = match self.infos.get(handle) {
            Some(info) if info.beats.len() == 2 => {
                (info.request.clone(), info.beats[0].clone(), info.beats[1].clone())
            }
            _ => {
                let err = Error::protocol(
                    &self.name,
                    Some(response.tag),
                    Some(response.address),
                    "RCW without compare and swap beats",
                );
                self.fail(err, sched);
                return;
            }
        };
        if response.status.is_error() {
            let old = std::mem::take(&mut state.old);
            self.finish_rcw(handle, response.id, response.status.to_pif(), old, sched);
            return;
        }
        match state.phase {
            RcwPhase::Reading => {
                if !compare_matches(&response.data, &compare) {
                    self.finish_rcw(handle, response.id, Status::Ok, response.data, sched);
                    return;
                }
                let mut write = Request::write(swap.address, &swap.data)
                    .with_id(response.id)
                    .with_tag(sched.next_tag())
                    .with_priority(first.priority)
                    .with_route_id(first.route_id)
                    .with_exclusive(true);
                write.byte_enables = swap.byte_enables;
                write.pc = first.pc;
                state.old = response.data;
                state.phase = RcwPhase::Writing;
                self.axi_write.push(write, 0, sched);
                self.bursts += 1;
            }
            RcwPhase::Writing if response.status == Status::ExOkay => {
                let old = std::mem::take(&mut state.old);
                self.finish_rcw(handle, response.id, Status::Ok, old, sched);
                return;
            }
            RcwPhase::Writing => {
                state.failures += 1;
                if state.failures > self.config.rcw_retry_limit {
                    log::warn!(
                        "{}: RCW at {:#x} lost its reservation {} times",
                        self.name,
                        first.address,
                        state.failures
                    );
                    let old = std::mem::take(&mut state.old);
                    self.finish_rcw(handle, response.id, Status::DataError, old, sched);
                    return;
                }
                self.rcw_retries += 1;
                log::debug!("{}: RCW at {:#x} retries", self.name, first.address);
                let read = Request::burst_read(first.address, first.size, 1, BurstType::Incr)
                    .with_id(response.id)
                    .with_tag(sched.next_tag())
                    .with_priority(first.priority)
                    .with_route_id(first.route_id)
                    .with_exclusive(true);
                state.phase = RcwPhase::Reading;
                self.axi_read.push(read, 0, sched);
                self.bursts += 1;
            }
        }
        self.rcws.insert(handle, state);
    }
}

impl RequestSink for Pif2Axi {
    fn nb_request(&mut self, port: usize, request: Request, sched: &mut Scheduler) {
        if port != 0 {
            self.fail(Error::InvalidPort(port), sched);
            return;
        }
        let now = sched.now();
        let ready = now + self.config.request_delay * self.clock_period;
        match request.request_type {
            RequestType::Snoop => {
                log::warn!("{}: snoop {} is not supported", self.name, request);
                let delay = self.config.response_delay * self.clock_period;
                self.upstream
                    .push(Response::new(&request, Status::AddressError), delay, sched);
            }
            RequestType::Read | RequestType::BlockRead | RequestType::BurstRead => {
                if self.read_fifo.len() >= self.config.read_request_fifo_depth {
                    self.naccs += 1;
                    self.upstream.push_nacc(Response::nacc(&request), sched);
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
            _ => {
                if self.write_fifo.len() >= self.config.write_request_fifo_depth {
                    self.naccs += 1;
                    self.upstream.push_nacc(Response::nacc(&request), sched);
                    return;
                }
                if request.transfer_number == 1 {
                    self.sequence += 1;
                    let (start, len) = span(&request);
                    let len = if request.request_type == RequestType::Rcw {
                        request.size as u64
                    } else {
                        len
                    };
                    self.order.add_write(self.sequence, request.tag, start, len);
                }
                log::trace!("{}: accepted {}", self.name, request);
                self.write_fifo.push_back((ready, self.sequence, request));
                sched.notify_at(self.id, WRITE_ENGINE, ready);
            }
        }
    }

    fn nb_peek(&mut self, _port: usize, address: u64, buffer: &mut [u8]) -> Result<(), Error> {
        self.axi_read.link()?.nb_peek(address, buffer)
    }

    fn nb_poke(&mut self, _port: usize, address: u64, data: &[u8]) -> Result<(), Error> {
        self.axi_write.link()?.nb_poke(address, data)
    }

    fn bind_upstream(&mut self, port: usize, link: ResponseLink) -> Result<(), Error> {
        if port != 0 {
            return Err(Error::InvalidPort(port));
        }
        self.upstream.bind(link)
    }
}

impl ResponseSink for Pif2Axi {
    fn nb_respond(&mut self, port: usize, response: Response, sched: &mut Scheduler) -> bool {
        if response.status.is_nacc() {
            let matched = match port {
                AXI_READ_PORT => self.axi_read.on_nacc(&response),
                AXI_WRITE_PORT => self.axi_write.on_nacc(&response),
                _ => false,
            };
            if !matched {
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
                    format!("response for AXI id {} which is not outstanding", response.id),
                );
                self.fail(err, sched);
                return true;
            }
        };
        log::trace!("{}: AXI response {}", self.name, response);
        if self.rcws.contains_key(&handle) {
            self.rcw_respond(handle, response, sched);
            return true;
        }
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
        match port {
            AXI_READ_PORT => self.axi_read.bind(link),
            AXI_WRITE_PORT => self.axi_write.bind(link),
            _ => Err(Error::InvalidPort(port)),
        }
    }
}

impl Module for Pif2Axi {
    fn id(&self) -> ModuleId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn wake(&mut self, process: ProcessId, sched: &mut Scheduler) -> Result<(), Error> {
        match process {
            UPSTREAM => self.upstream.wake(sched).map(|_| ()),
            AXI_READ => self.axi_read.wake(sched).map(|_| ()),
            AXI_WRITE => self.axi_write.wake(sched).map(|_| ()),
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
                "transactions={} axi_transactions={} outstanding_ids={} rcw_retries={} naccs={}",
                self.transactions,
                self.bursts,
                self.ids.outstanding(),
                self.rcw_retries,
                self.naccs
            )),
            _ => Err(Error::UnknownCommand(words.join(" "))),
        }
    }
}
