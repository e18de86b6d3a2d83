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

//! Descriptor-driven DMA between local memories and the PIF.
//!
//! Software programs the register file through slave port 0. Descriptors
//! are fetched from local memory through master port 0; each moves
//! `num_rows` rows between a local memory (port 0) and the PIF (port 1).
//! The cycle-accurate engine moves data as bus beats; the turbo engine
//! moves a whole descriptor with debug peeks and pokes. The engines are
//! swapped only between descriptors.

pub mod descriptor;
pub mod registers;

pub use descriptor::{Descriptor, Direction, UdmaError, DESCRIPTOR_SIZE};
pub use registers::Registers;

use crate::config::UdmaConfig;
use crate::issuer::{RequestIssuer, ResponseIssuer};
use crate::memory::parse_number;
use crate::pool::{Handle, Pool};
use crate::protocol::{
    Request, RequestLink, RequestSink, RequestType, Response, ResponseLink, ResponseSink, Status,
};
use crate::sim::{Module, ModuleId, ProcessId, Scheduler, SimContext, Time};
use crate::transactor::{split_range, Piece};
use crate::Error;
use descriptor::{local_memory, Chunk};
use registers::{
    WriteEffect, INTERRUPT_PENDING, REGISTER_SPACE, SETTINGS_ENABLE, SETTINGS_ERROR_INTERRUPT,
};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

pub const REGISTER_PORT: usize = 0;
pub const LOCAL_PORT: usize = 0;
pub const PIF_PORT: usize = 1;

const REGISTER: ProcessId = 0;
const LOCAL: ProcessId = 1;
const PIF: ProcessId = 2;
const ENGINE: ProcessId = 3;
const FAULT: ProcessId = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SimulationMode {
    CycleAccurate,
    Turbo,
}

impl fmt::Display for SimulationMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            SimulationMode::CycleAccurate => "cycle_accurate",
            SimulationMode::Turbo => "turbo",
        })
    }
}

impl FromStr for SimulationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cycle_accurate" => Ok(SimulationMode::CycleAccurate),
            "turbo" => Ok(SimulationMode::Turbo),
            _ => Err(Error::InvalidArgument(format!("unknown simulation mode {}", s))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Idle,
    Fetching,
    Executing,
}

/// What an outstanding request tag belongs to.
#[derive(Clone, Copy, Debug)]
enum Owner {
    /// A descriptor fetch, by run number.
    Fetch(u64),
    Chunk(Handle),
}

#[derive(Debug)]
struct ChunkState {
    chunk: Chunk,
    data: Vec<u8>,
    awaiting: usize,
    writing: bool,
}

/// The descriptor being executed. Chunks are planned one row at a time.
#[derive(Debug)]
struct Execution {
    descriptor: Descriptor,
    direction: Direction,
    queued: VecDeque<Chunk>,
    next_row: u32,
    in_flight: usize,
}

impl Execution {
    fn new(descriptor: Descriptor, direction: Direction) -> Self {
        Self {
            descriptor,
            direction,
            queued: VecDeque::new(),
            next_row: 0,
            in_flight: 0,
        }
    }

    fn next_chunk(&mut self, pif_byte_width: u32) -> Option<Chunk> {
        if self.queued.is_empty() && self.next_row < self.descriptor.num_rows {
            self.queued
                .extend(self.descriptor.chunks(self.next_row, self.direction, pif_byte_width));
            self.next_row += 1;
        }
        self.queued.pop_front()
    }

    fn is_finished(&self) -> bool {
        self.queued.is_empty() && self.next_row == self.descriptor.num_rows && self.in_flight == 0
    }
}

/// The error a failed access on `port` halts the descriptor with.
fn error_for(port: usize, status: Status) -> UdmaError {
    if port == LOCAL_PORT {
        return UdmaError::CrossRamBoundary;
    }
    match status {
        Status::AddressError | Status::AddressDataError | Status::DecErr => {
            UdmaError::PifAddressError
        }
        _ => UdmaError::PifDataError,
    }
}

pub struct Udma {
    id: ModuleId,
    name: String,
    config: UdmaConfig,
    clock_period: Time,
    registers: Registers,
    register_port: ResponseIssuer,
    local: RequestIssuer,
    pif: RequestIssuer,
    mode: SimulationMode,
    state: State,
    run: u64,
    fetch: Vec<u8>,
    fetch_awaiting: usize,
    execution: Option<Execution>,
    chunks: Pool<ChunkState>,
    requests: HashMap<u64, Owner>,
    pending_switch: Option<SimulationMode>,
    switch_ready: bool,
    switch_listener: Option<(ModuleId, ProcessId)>,
    interrupt_listener: Option<(ModuleId, ProcessId)>,
    fault: Option<Error>,
    bytes_moved: u64,
}

impl Udma {
    pub fn new(id: ModuleId, name: &str, ctx: &SimContext, config: UdmaConfig) -> Result<Self, Error> {
        if !matches!(config.pif_byte_width, 4 | 8 | 16 | 32) {
            return Err(Error::config(
                name,
                format!("unsupported pif_byte_width {}", config.pif_byte_width),
            ));
        }
        if !matches!(config.local_byte_width, 4 | 8 | 16 | 32 | 64) {
            return Err(Error::config(
                name,
                format!("unsupported local_byte_width {}", config.local_byte_width),
            ));
        }
        if config.local_memories.is_empty() {
            return Err(Error::config(name, "at least one local memory is required"));
        }
        let clock_period = ctx.period_or_default(config.clock_period);
        Ok(Self {
            id,
            name: name.to_string(),
            clock_period,
            registers: Registers::default(),
            register_port: ResponseIssuer::new(
                &format!("{}.registers", name),
                id,
                REGISTER,
                REGISTER_PORT,
                clock_period,
            ),
            local: RequestIssuer::new(
                &format!("{}.local", name),
                id,
                LOCAL,
                LOCAL_PORT,
                clock_period,
                config.nacc_wait_time,
            )?,
            pif: RequestIssuer::new(
                &format!("{}.pif", name),
                id,
                PIF,
                PIF_PORT,
                clock_period,
                config.nacc_wait_time,
            )?,
            mode: if config.turbo {
                SimulationMode::Turbo
            } else {
                SimulationMode::CycleAccurate
            },
            state: State::Idle,
            run: 0,
            fetch: vec![],
            fetch_awaiting: 0,
            execution: None,
            chunks: Pool::new(),
            requests: HashMap::new(),
            pending_switch: None,
            switch_ready: false,
            switch_listener: None,
            interrupt_listener: None,
            fault: None,
            bytes_moved: 0,
            config,
        })
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn mode(&self) -> SimulationMode {
        self.mode
    }

    /// A descriptor is being fetched or executed.
    pub fn is_busy(&self) -> bool {
        self.state != State::Idle
    }

    pub fn interrupt_pending(&self) -> bool {
        self.registers.interrupt & INTERRUPT_PENDING != 0
    }

    pub fn bytes_moved(&self) -> u64 {
        self.bytes_moved
    }

    /// Process woken whenever the interrupt is raised.
    pub fn set_interrupt_listener(&mut self, module: ModuleId, process: ProcessId) {
        self.interrupt_listener = Some((module, process));
    }

    /// Process woken when a prepared mode switch becomes possible.
    pub fn set_switch_listener(&mut self, module: ModuleId, process: ProcessId) {
        self.switch_listener = Some((module, process));
    }

    pub fn read_register(&self, offset: u64) -> Result<u32, Error> {
        self.registers.read(offset, self.is_busy())
    }

    pub fn write_register(&mut self, offset: u64, value: u32, sched: &mut Scheduler) -> Result<(), Error> {
        log::debug!("{}: register {:#x} <- {:#x}", self.name, offset, value);
        if self.registers.write(offset, value)? == WriteEffect::Kick {
            sched.notify(self.id, ENGINE, 0);
        }
        Ok(())
    }

    /// Asks to change engines at the next descriptor boundary. Returns true
    /// if the switch may happen right away.
    pub fn prepare_to_switch(&mut self, mode: SimulationMode) -> bool {
        self.pending_switch = Some(mode);
        self.switch_ready = self.state == State::Idle;
        log::debug!(
            "{}: switch to {} prepared, {}",
            self.name,
            mode,
            if self.switch_ready { "ready" } else { "waiting" }
        );
        self.switch_ready
    }

    pub fn switch_ready(&self) -> bool {
        self.switch_ready
    }

    pub fn switch_mode(&mut self, mode: SimulationMode, sched: &mut Scheduler) -> Result<(), Error> {
        if self.pending_switch != Some(mode) {
            return Err(Error::ModeSwitch(format!(
                "{}: no switch to {} was prepared",
                self.name, mode
            )));
        }
        if !self.switch_ready {
            return Err(Error::ModeSwitch(format!(
                "{}: switch to {} requested inside a descriptor",
                self.name, mode
            )));
        }
        log::info!("{}: switching from {} to {}", self.name, self.mode, mode);
        self.mode = mode;
        self.pending_switch = None;
        self.switch_ready = false;
        sched.notify(self.id, ENGINE, 0);
        Ok(())
    }

    fn fail(&mut self, err: Error, sched: &mut Scheduler) {
        log::error!("{}", err);
        if self.fault.is_none() {
            self.fault = Some(err);
        }
        sched.notify(self.id, FAULT, 0);
    }

    fn raise_interrupt(&mut self, sched: &mut Scheduler) {
        log::debug!("{}: interrupt", self.name);
        self.registers.interrupt |= INTERRUPT_PENDING;
        if let Some((module, process)) = self.interrupt_listener {
            sched.notify(module, process, 0);
        }
    }

    /// Stops the current descriptor and disables the engine.
    fn halt(&mut self, error: UdmaError, sched: &mut Scheduler) {
        log::warn!(
            "{}: descriptor at {:#010x} halted with {}",
            self.name,
            self.registers.desc_cur_ptr,
            error
        );
        self.registers.status |= error.bit();
        self.registers.settings &= !SETTINGS_ENABLE;
        self.state = State::Idle;
        self.execution = None;
        self.chunks.clear();
        self.run += 1;
        if self.registers.settings & SETTINGS_ERROR_INTERRUPT != 0 {
            self.raise_interrupt(sched);
        }
        sched.notify(self.id, ENGINE, 0);
    }

    fn complete(&mut self, sched: &mut Scheduler) {
        let descriptor = match self.execution.take() {
            Some(execution) => execution.descriptor,
            None => return,
        };
        log::debug!(
            "{}: descriptor at {:#010x} done, {} bytes",
            self.name,
            self.registers.desc_cur_ptr,
            descriptor.total_bytes()
        );
        self.state = State::Idle;
        self.bytes_moved += descriptor.total_bytes();
        self.registers.advance();
        if descriptor.sync_interrupt_enable {
            self.raise_interrupt(sched);
        }
        sched.notify(self.id, ENGINE, 0);
    }

    fn step(&mut self, sched: &mut Scheduler) -> Result<(), Error> {
        match self.state {
            State::Idle => self.start_next(sched),
            State::Fetching if self.fetch_awaiting == 0 => {
                self.decode(sched);
                Ok(())
            }
            State::Fetching => Ok(()),
            State::Executing => {
                self.issue_chunks(sched);
                if self.execution.as_ref().map_or(false, Execution::is_finished) {
                    self.complete(sched);
                }
                Ok(())
            }
        }
    }

    fn start_next(&mut self, sched: &mut Scheduler) -> Result<(), Error> {
        if let Some(mode) = self.pending_switch {
            if !self.switch_ready {
                log::debug!("{}: at a descriptor boundary, ready for {}", self.name, mode);
                self.switch_ready = true;
                if let Some((module, process)) = self.switch_listener {
                    sched.notify(module, process, 0);
                }
            }
            return Ok(());
        }
        if !self.registers.enabled() || self.registers.desc_num == 0 {
            return Ok(());
        }
        match self.mode {
            SimulationMode::Turbo => self.run_turbo(sched),
            SimulationMode::CycleAccurate => {
                self.start_fetch(sched);
                Ok(())
            }
        }
    }

    fn start_fetch(&mut self, sched: &mut Scheduler) {
        let pointer = self.registers.desc_cur_ptr as u64;
        if local_memory(&self.config.local_memories, pointer, DESCRIPTOR_SIZE).is_none() {
            self.halt(UdmaError::BadDescriptor, sched);
            return;
        }
        self.run += 1;
        self.state = State::Fetching;
        self.fetch = vec![0; DESCRIPTOR_SIZE as usize];
        self.fetch_awaiting = 0;
        log::trace!("{}: fetching descriptor at {:#010x}", self.name, pointer);
        for piece in split_range(pointer, DESCRIPTOR_SIZE, self.config.local_byte_width, 1) {
            if let Piece::Single { address, size } = piece {
                let tag = sched.next_tag();
                let request = Request::read(address, size)
                    .with_tag(tag)
                    .with_priority(self.config.read_priority);
                self.requests.insert(tag, Owner::Fetch(self.run));
                self.local.push(request, 0, sched);
                self.fetch_awaiting += 1;
            }
        }
    }

    fn decode(&mut self, sched: &mut Scheduler) {
        let descriptor = match Descriptor::from_bytes(&self.fetch) {
            Ok(descriptor) => descriptor,
            Err(error) => return self.halt(error, sched),
        };
        let direction = match descriptor.validate(&self.config) {
            Ok(direction) => direction,
            Err(error) => return self.halt(error, sched),
        };
        log::debug!(
            "{}: {:?} {} rows of {} bytes, {:#010x} -> {:#010x}",
            self.name,
            direction,
            descriptor.num_rows,
            descriptor.num_bytes_per_row,
            descriptor.source_address,
            descriptor.destination_address
        );
        self.execution = Some(Execution::new(descriptor, direction));
        self.state = State::Executing;
        sched.notify(self.id, ENGINE, 0);
    }

    fn issue_chunks(&mut self, sched: &mut Scheduler) {
        let pif_byte_width = self.config.pif_byte_width;
        loop {
            let (chunk, direction) = match self.execution.as_mut() {
                Some(e) if e.in_flight < e.descriptor.max_outstanding as usize => {
                    match e.next_chunk(pif_byte_width) {
                        Some(chunk) => {
                            e.in_flight += 1;
                            (chunk, e.direction)
                        }
                        None => return,
                    }
                }
                _ => return,
            };
            let handle = self.chunks.acquire(ChunkState {
                chunk,
                data: vec![0; chunk.len as usize],
                awaiting: 0,
                writing: false,
            });
            let delay = self.config.read_delay * self.clock_period;
            let requests = match direction {
                Direction::LocalToPif => self.local_requests(chunk.local, chunk.len, None),
                Direction::PifToLocal => vec![vec![self.pif_read(&chunk)]],
            };
            self.send(handle, direction == Direction::LocalToPif, requests, delay, sched);
        }
    }

    /// Pushes one transaction per entry of `transactions` and counts the
    /// responses `handle` awaits.
    fn send(
        &mut self,
        handle: Handle,
        to_local: bool,
        transactions: Vec<Vec<Request>>,
        delay: Time,
        sched: &mut Scheduler,
    ) {
        let count = transactions.len();
        for beats in transactions {
            let tag = sched.next_tag();
            self.requests.insert(tag, Owner::Chunk(handle));
            for beat in beats {
                let beat = beat.with_tag(tag);
                if to_local {
                    self.local.push(beat, delay, sched);
                } else {
                    self.pif.push(beat, delay, sched);
                }
            }
        }
        if let Some(state) = self.chunks.get_mut(handle) {
            state.awaiting = count;
        }
    }

    /// Local accesses no wider than the local memory; reads when `data`
    /// is absent.
    fn local_requests(&self, address: u64, len: u32, data: Option<&[u8]>) -> Vec<Vec<Request>> {
        split_range(address, len as u64, self.config.local_byte_width, 1)
            .into_iter()
            .filter_map(|piece| match piece {
                Piece::Single { address: at, size } => Some(match data {
                    Some(data) => {
                        let offset = (at - address) as usize;
                        Request::write(at, &data[offset..offset + size as usize])
                            .with_priority(self.config.write_priority)
                    }
                    None => Request::read(at, size).with_priority(self.config.read_priority),
                }),
                Piece::Block { .. } => None,
            })
            .map(|request| vec![request])
            .collect()
    }

    fn pif_read(&self, chunk: &Chunk) -> Request {
        let request = if chunk.beats == 0 {
            Request::read(chunk.external, chunk.len)
        } else {
            Request::block_read(chunk.external, self.config.pif_byte_width, chunk.beats)
        };
        request.with_priority(self.config.read_priority)
    }

    fn pif_write(&self, chunk: &Chunk, data: &[u8]) -> Vec<Request> {
        let beats = if chunk.beats == 0 {
            vec![Request::write(chunk.external, data)]
        } else {
            Request::block_write(chunk.external, self.config.pif_byte_width, data)
        };
        beats
            .into_iter()
            .map(|beat| beat.with_priority(self.config.write_priority))
            .collect()
    }

    fn on_fetch_response(&mut self, run: u64, response: &Response, sched: &mut Scheduler) {
        if run != self.run || self.state != State::Fetching {
            return;
        }
        if response.status.is_error() {
            return self.halt(UdmaError::BadDescriptor, sched);
        }
        let offset = response.address.wrapping_sub(self.registers.desc_cur_ptr as u64) as usize;
        for (i, byte) in response.data.iter().enumerate() {
            if let Some(slot) = self.fetch.get_mut(offset + i) {
                *slot = *byte;
            }
        }
        if response.last_transfer {
            self.fetch_awaiting -= 1;
            if self.fetch_awaiting == 0 {
                sched.notify(self.id, ENGINE, 0);
            }
        }
    }

    fn on_chunk_response(
        &mut self,
        port: usize,
        handle: Handle,
        response: &Response,
        sched: &mut Scheduler,
    ) {
        if response.status.is_error() {
            if self.chunks.contains(handle) {
                self.halt(error_for(port, response.status), sched);
            }
            return;
        }
        let direction = match self.execution.as_ref() {
            Some(execution) => execution.direction,
            None => return,
        };
        let state = match self.chunks.get_mut(handle) {
            Some(state) => state,
            None => return,
        };
        if !state.writing {
            let base = match direction {
                Direction::LocalToPif => state.chunk.local,
                Direction::PifToLocal => state.chunk.external,
            };
            let offset = response.address.wrapping_sub(base) as usize;
            for (i, byte) in response.data.iter().enumerate() {
                if let Some(slot) = state.data.get_mut(offset + i) {
                    *slot = *byte;
                }
            }
        }
        if !response.last_transfer {
            return;
        }
        state.awaiting -= 1;
        if state.awaiting > 0 {
            return;
        }
        if state.writing {
            if let Some(state) = self.chunks.release(handle) {
                log::trace!(
                    "{}: chunk {:#010x} <-> {:#010x} done",
                    self.name,
                    state.chunk.external,
                    state.chunk.local
                );
            }
            if let Some(execution) = self.execution.as_mut() {
                execution.in_flight -= 1;
            }
            sched.notify(self.id, ENGINE, 0);
            return;
        }
        state.writing = true;
        let chunk = state.chunk;
        let data = std::mem::take(&mut state.data);
        let (to_local, transactions) = match direction {
            Direction::LocalToPif => (false, vec![self.pif_write(&chunk, &data)]),
            Direction::PifToLocal => (true, self.local_requests(chunk.local, chunk.len, Some(&data))),
        };
        let delay = self.config.write_delay * self.clock_period;
        self.send(handle, to_local, transactions, delay, sched);
    }

    /// Copies the current descriptor with debug accesses. The outer error
    /// is fatal; the inner one halts the descriptor.
    fn turbo_copy(&self, descriptor: &Descriptor, direction: Direction) -> Result<Option<UdmaError>, Error> {
        let (source, destination) = match direction {
            Direction::LocalToPif => (
                (self.local.link()?, error_for(LOCAL_PORT, Status::AddressError)),
                (self.pif.link()?, error_for(PIF_PORT, Status::AddressError)),
            ),
            Direction::PifToLocal => (
                (self.pif.link()?, error_for(PIF_PORT, Status::AddressError)),
                (self.local.link()?, error_for(LOCAL_PORT, Status::AddressError)),
            ),
        };
        let mut buffer = vec![0; descriptor.num_bytes_per_row as usize];
        for row in 0..descriptor.num_rows {
            let (from, to) = descriptor.row_addresses(row);
            if source.0.nb_peek(from, &mut buffer).is_err() {
                return Ok(Some(source.1));
            }
            if destination.0.nb_poke(to, &buffer).is_err() {
                return Ok(Some(destination.1));
            }
        }
        Ok(None)
    }

    fn run_turbo(&mut self, sched: &mut Scheduler) -> Result<(), Error> {
        let pointer = self.registers.desc_cur_ptr as u64;
        let mut bytes = [0u8; DESCRIPTOR_SIZE as usize];
        if local_memory(&self.config.local_memories, pointer, DESCRIPTOR_SIZE).is_none()
            || self.local.link()?.nb_peek(pointer, &mut bytes).is_err()
        {
            self.halt(UdmaError::BadDescriptor, sched);
            return Ok(());
        }
        let checked = Descriptor::from_bytes(&bytes)
            .and_then(|descriptor| Ok((descriptor.validate(&self.config)?, descriptor)));
        let (direction, descriptor) = match checked {
            Ok(checked) => checked,
            Err(error) => {
                self.halt(error, sched);
                return Ok(());
            }
        };
        log::trace!("{}: turbo descriptor at {:#010x}", self.name, pointer);
        if let Some(error) = self.turbo_copy(&descriptor, direction)? {
            self.halt(error, sched);
            return Ok(());
        }
        self.execution = Some(Execution::new(descriptor, direction));
        self.complete(sched);
        Ok(())
    }

    fn register_response(&mut self, request: &Request, sched: &mut Scheduler) -> Response {
        let offset = request.address % REGISTER_SPACE;
        let aligned = request.size == 4 && offset % 4 == 0;
        match request.request_type {
            RequestType::Read if aligned => match self.read_register(offset) {
                Ok(value) => Response::new(request, Status::Ok).with_data(value.to_le_bytes().to_vec()),
                Err(_) => Response::new(request, Status::AddressError),
            },
            RequestType::Write if aligned && request.data.len() >= 4 => {
                let value = u32::from_le_bytes([
                    request.data[0],
                    request.data[1],
                    request.data[2],
                    request.data[3],
                ]);
                match self.write_register(offset, value, sched) {
                    Ok(()) => Response::new(request, Status::Ok),
                    Err(_) => Response::new(request, Status::AddressError),
                }
            }
            _ => {
                log::warn!("{}: unsupported register access {}", self.name, request);
                Response::new(request, Status::AddressError)
            }
        }
    }
}

impl RequestSink for Udma {
    fn nb_request(&mut self, port: usize, request: Request, sched: &mut Scheduler) {
        if port != REGISTER_PORT {
            self.fail(Error::InvalidPort(port), sched);
            return;
        }
        log::trace!("{}: register access {}", self.name, request);
        let response = self.register_response(&request, sched);
        let delay = self.config.register_response_delay * self.clock_period;
        self.register_port.push(response, delay, sched);
    }

    fn nb_peek(&mut self, _port: usize, address: u64, buffer: &mut [u8]) -> Result<(), Error> {
        for (i, byte) in buffer.iter_mut().enumerate() {
            let at = (address + i as u64) % REGISTER_SPACE;
            let value = self.read_register(at - at % 4)?;
            *byte = value.to_le_bytes()[(at % 4) as usize];
        }
        Ok(())
    }

    fn bind_upstream(&mut self, port: usize, link: ResponseLink) -> Result<(), Error> {
        if port != REGISTER_PORT {
            return Err(Error::InvalidPort(port));
        }
        self.register_port.bind(link)
    }
}

impl ResponseSink for Udma {
    fn nb_respond(&mut self, port: usize, response: Response, sched: &mut Scheduler) -> bool {
        if response.status.is_nacc() {
            let matched = match port {
                LOCAL_PORT => self.local.on_nacc(&response),
                PIF_PORT => self.pif.on_nacc(&response),
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
        let owner = match self.requests.get(&response.tag) {
            Some(owner) => *owner,
            None => {
                let err = Error::protocol(
                    &self.name,
                    Some(response.tag),
                    Some(response.address),
                    "response to a request never issued",
                );
                self.fail(err, sched);
                return true;
            }
        };
        log::trace!("{}: response {}", self.name, response);
        if response.last_transfer {
            self.requests.remove(&response.tag);
        }
        match owner {
            Owner::Fetch(run) => self.on_fetch_response(run, &response, sched),
            Owner::Chunk(handle) => self.on_chunk_response(port, handle, &response, sched),
        }
        true
    }

    fn bind_downstream(&mut self, port: usize, link: RequestLink) -> Result<(), Error> {
        match port {
            LOCAL_PORT => self.local.bind(link),
            PIF_PORT => self.pif.bind(link),
            _ => Err(Error::InvalidPort(port)),
        }
    }
}

impl Module for Udma {
    fn id(&self) -> ModuleId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn wake(&mut self, process: ProcessId, sched: &mut Scheduler) -> Result<(), Error> {
        match process {
            REGISTER => self.register_port.wake(sched).map(|_| ()),
            LOCAL => self.local.wake(sched).map(|_| ()),
            PIF => self.pif.wake(sched).map(|_| ()),
            ENGINE => self.step(sched),
            FAULT => match self.fault.take() {
                Some(err) => Err(err),
                None => Ok(()),
            },
            _ => Err(Error::protocol(&self.name, None, None, format!("no process {}", process))),
        }
    }

    fn command(&mut self, words: &[&str], sched: &mut Scheduler) -> Result<String, Error> {
        match words {
            ["dump_registers"] => Ok(self.registers.to_string()),
            ["dump_statistic_info"] => Ok(format!(
                "descriptors={} bytes={} mode={} busy={}",
                self.registers.desc_done,
                self.bytes_moved,
                self.mode,
                self.is_busy()
            )),
            ["read_register", offset] => Ok(format!("{:#x}", self.read_register(parse_number(offset)?)?)),
            ["write_register", offset, value] => {
                let value = u32::try_from(parse_number(value)?)
                    .map_err(|_| Error::InvalidArgument(value.to_string()))?;
                self.write_register(parse_number(offset)?, value, sched)?;
                Ok(String::new())
            }
            ["prepare_to_switch", mode] => Ok(self.prepare_to_switch(mode.parse()?).to_string()),
            ["switch_mode", mode] => {
                self.switch_mode(mode.parse()?, sched)?;
                Ok(String::new())
            }
            _ => Err(Error::UnknownCommand(words.join(" "))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::registers::*;
    use super::*;
    use crate::config::{LocalMemoryRange, MasterConfig, MemoryConfig, MemoryTraceConfig};
    use crate::master::Master;
    use crate::memory::Memory;
    use crate::sim::Kernel;
    use crate::trace::MemoryTrace;
    use std::cell::RefCell;
    use std::rc::Rc;

    const LOCAL_BASE: u32 = 0x6000_0000;
    const RING: u32 = LOCAL_BASE + 0xf000;
    const SYSMEM_SIZE: u64 = 0x10_0000;

    struct Bench {
        kernel: Kernel,
        cpu: Rc<RefCell<Master>>,
        udma: Rc<RefCell<Udma>>,
        local: Rc<RefCell<Memory>>,
        sysmem: Rc<RefCell<Memory>>,
    }

    impl Bench {
        fn new(config: UdmaConfig) -> Self {
            let mut kernel = Kernel::new(SimContext::default());
            let cpu = kernel
                .add_module(|id, ctx| Master::new(id, "cpu", ctx, MasterConfig::default()))
                .unwrap();
            let udma = kernel
                .add_module(|id, ctx| Udma::new(id, "udma", ctx, config))
                .unwrap();
            let local = kernel
                .add_module(|id, ctx| {
                    Memory::new(
                        id,
                        "localmem",
                        ctx,
                        MemoryConfig {
                            start_address: LOCAL_BASE as u64,
                            size: 0x1_0000,
                            ..Default::default()
                        },
                    )
                })
                .unwrap();
            let trace = kernel
                .add_module(|id, ctx| {
                    MemoryTrace::new(id, "pif_trace", ctx, MemoryTraceConfig::default())
                })
                .unwrap();
            let sysmem = kernel
                .add_module(|id, ctx| {
                    Memory::new(
                        id,
                        "sysmem",
                        ctx,
                        MemoryConfig {
                            size: SYSMEM_SIZE,
                            ..Default::default()
                        },
                    )
                })
                .unwrap();
            kernel.connect(&cpu, 0, &udma, REGISTER_PORT).unwrap();
            kernel.connect(&udma, LOCAL_PORT, &local, 0).unwrap();
            kernel.connect(&udma, PIF_PORT, &trace, 0).unwrap();
            kernel.connect(&trace, 0, &sysmem, 0).unwrap();
            Self {
                kernel,
                cpu,
                udma,
                local,
                sysmem,
            }
        }

        /// Places `descriptors` in the ring and starts the engine.
        fn start(&mut self, descriptors: &[Descriptor], settings: u32) {
            let mut local = self.local.borrow_mut();
            for (i, descriptor) in descriptors.iter().enumerate() {
                let at = RING as u64 + i as u64 * DESCRIPTOR_SIZE;
                local.store_mut().poke(at, &descriptor.to_bytes()).unwrap();
            }
            let end = RING + (descriptors.len().max(1) as u32 - 1) * DESCRIPTOR_SIZE as u32;
            let mut udma = self.udma.borrow_mut();
            let sched = self.kernel.scheduler();
            udma.write_register(DESC_START, RING, sched).unwrap();
            udma.write_register(DESC_END, end, sched).unwrap();
            udma.write_register(DESC_CUR_PTR, RING, sched).unwrap();
            udma.write_register(DESC_NUM, descriptors.len() as u32, sched).unwrap();
            udma.write_register(SETTINGS, settings, sched).unwrap();
        }

        fn pif_count(&mut self, request_type: &str) -> u64 {
            self.kernel
                .command("pif_trace", &format!("get_counter transactions {} *", request_type))
                .unwrap()
                .parse()
                .unwrap()
        }

        fn register(&self, offset: u64) -> u32 {
            self.udma.borrow().read_register(offset).unwrap()
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(3).wrapping_add(seed)).collect()
    }

    fn copy(source: u32, destination: u32, bytes: u32, blocks: u32) -> Descriptor {
        Descriptor {
            source_address: source,
            destination_address: destination,
            num_bytes_per_row: bytes,
            max_block_transfers: blocks,
            max_outstanding: 2,
            num_rows: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_local_to_pif_partial_copy() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let mut b = Bench::new(UdmaConfig::default());
        let data = pattern(40, 7);
        b.local
            .borrow_mut()
            .store_mut()
            .poke(LOCAL_BASE as u64 + 0x100, &data)
            .unwrap();
        let mut descriptor = copy(LOCAL_BASE + 0x100, 0x1000, 40, 0);
        descriptor.sync_interrupt_enable = true;
        b.start(&[descriptor], SETTINGS_ENABLE);
        b.kernel.run_to_completion(10_000_000).unwrap();

        assert_eq!(b.sysmem.borrow().store().read(0x1000, 40).unwrap(), data);
        assert_eq!(b.pif_count("WRITE"), 5);
        assert_eq!(b.register(DESC_DONE), 1);
        assert_eq!(b.register(DESC_NUM), 0);
        assert_eq!(b.register(STATUS), 0);
        assert_eq!(b.register(DESC_CUR_PTR), RING);
        assert!(b.udma.borrow().interrupt_pending());
        assert_eq!(b.udma.borrow().bytes_moved(), 40);
    }

    #[test]
    fn test_pif_to_local_block_rows() {
        let mut b = Bench::new(UdmaConfig::default());
        let rows = [pattern(64, 1), pattern(64, 100)];
        b.sysmem.borrow_mut().store_mut().poke(0x2000, &rows[0]).unwrap();
        b.sysmem.borrow_mut().store_mut().poke(0x2100, &rows[1]).unwrap();
        let mut descriptor = copy(0x2000, LOCAL_BASE + 0x400, 64, 4);
        descriptor.num_rows = 2;
        descriptor.source_pitch = 0x100;
        descriptor.destination_pitch = 0x40;
        b.start(&[descriptor], SETTINGS_ENABLE);
        b.kernel.run_to_completion(10_000_000).unwrap();

        let local = b.local.borrow();
        assert_eq!(local.store().read(LOCAL_BASE as u64 + 0x400, 64).unwrap(), rows[0]);
        assert_eq!(local.store().read(LOCAL_BASE as u64 + 0x440, 64).unwrap(), rows[1]);
        drop(local);
        assert_eq!(b.pif_count("BLOCK_READ"), 4);
        assert_eq!(b.register(STATUS), 0);
        // No interrupt without sync_interrupt_enable.
        assert!(!b.udma.borrow().interrupt_pending());
    }

    #[test]
    fn test_bad_block_descriptor_halts_without_writing() {
        let mut b = Bench::new(UdmaConfig::default());
        b.sysmem.borrow_mut().store_mut().poke(0x3000, &[0xaa; 64]).unwrap();
        // 40 bytes is not a whole number of 32-byte blocks.
        b.start(
            &[copy(LOCAL_BASE, 0x3000, 40, 4)],
            SETTINGS_ENABLE | SETTINGS_ERROR_INTERRUPT,
        );
        b.kernel.run_to_completion(10_000_000).unwrap();

        assert_eq!(b.register(STATUS), UdmaError::BadDescriptor.bit());
        assert_eq!(b.register(SETTINGS) & SETTINGS_ENABLE, 0);
        assert_eq!(b.register(DESC_DONE), 0);
        assert_eq!(b.register(DESC_NUM), 1);
        assert!(b.udma.borrow().interrupt_pending());
        assert_eq!(b.sysmem.borrow().store().read(0x3000, 64).unwrap(), vec![0xaa; 64]);
        assert_eq!(b.pif_count("*"), 0);
        assert!(!b.udma.borrow().is_busy());
    }

    #[test]
    fn test_cross_ram_boundary() {
        let mut b = Bench::new(UdmaConfig::default());
        b.start(&[copy(0x1000, LOCAL_BASE + 0xfff0, 32, 0)], SETTINGS_ENABLE);
        b.kernel.run_to_completion(10_000_000).unwrap();
        assert_eq!(b.register(STATUS), UdmaError::CrossRamBoundary.bit());
        // Error interrupts are off.
        assert!(!b.udma.borrow().interrupt_pending());
        // Write-1-to-clear.
        b.udma
            .borrow_mut()
            .write_register(STATUS, UdmaError::CrossRamBoundary.bit(), b.kernel.scheduler())
            .unwrap();
        assert_eq!(b.register(STATUS), 0);
    }

    #[test]
    fn test_pif_address_error() {
        let mut b = Bench::new(UdmaConfig::default());
        b.start(
            &[copy(LOCAL_BASE + 8, SYSMEM_SIZE as u32 - 8, 32, 0)],
            SETTINGS_ENABLE | SETTINGS_ERROR_INTERRUPT,
        );
        b.kernel.run_to_completion(10_000_000).unwrap();
        assert_eq!(b.register(STATUS), UdmaError::PifAddressError.bit());
        assert_eq!(b.register(DESC_DONE), 0);
        assert!(b.udma.borrow().interrupt_pending());
    }

    #[test]
    fn test_turbo_matches_cycle_accurate() {
        let data = pattern(96, 9);
        let mut descriptor = copy(LOCAL_BASE + 0x20, 0x5000, 32, 2);
        descriptor.num_rows = 3;
        descriptor.source_pitch = 32;
        descriptor.destination_pitch = 0x80;
        let mut finish = vec![];
        for turbo in [false, true] {
            let mut b = Bench::new(UdmaConfig {
                turbo,
                ..Default::default()
            });
            b.local
                .borrow_mut()
                .store_mut()
                .poke(LOCAL_BASE as u64 + 0x20, &data)
                .unwrap();
            b.start(&[descriptor.clone()], SETTINGS_ENABLE);
            finish.push(b.kernel.run_to_completion(10_000_000).unwrap());
            let sysmem = b.sysmem.borrow();
            for row in 0..3 {
                assert_eq!(
                    sysmem.store().read(0x5000 + row * 0x80, 32).unwrap(),
                    data[row as usize * 32..row as usize * 32 + 32].to_vec()
                );
            }
            drop(sysmem);
            assert_eq!(b.pif_count("BLOCK_WRITE"), if turbo { 0 } else { 6 });
            assert_eq!(b.register(DESC_DONE), 1);
        }
        assert!(finish[1] < finish[0]);
    }

    #[test]
    fn test_mode_switch_waits_for_descriptor_boundary() {
        let mut b = Bench::new(UdmaConfig::default());
        let data = pattern(64, 3);
        b.local
            .borrow_mut()
            .store_mut()
            .poke(LOCAL_BASE as u64, &data)
            .unwrap();
        b.start(
            &[
                copy(LOCAL_BASE, 0x6000, 32, 0),
                copy(LOCAL_BASE + 32, 0x6020, 32, 0),
            ],
            SETTINGS_ENABLE,
        );
        {
            let mut udma = b.udma.borrow_mut();
            let sched = b.kernel.scheduler();
            assert!(udma.switch_mode(SimulationMode::Turbo, sched).is_err());
        }
        b.kernel.run_for(3000).unwrap();
        assert!(b.udma.borrow().is_busy());
        assert!(!b.udma.borrow_mut().prepare_to_switch(SimulationMode::Turbo));
        {
            let mut udma = b.udma.borrow_mut();
            let sched = b.kernel.scheduler();
            assert!(matches!(
                udma.switch_mode(SimulationMode::Turbo, sched),
                Err(Error::ModeSwitch(_))
            ));
        }
        b.kernel.run_to_completion(10_000_000).unwrap();
        // The engine stopped after the first descriptor.
        assert!(b.udma.borrow().switch_ready());
        assert_eq!(b.register(DESC_DONE), 1);
        let writes = b.pif_count("WRITE");
        assert_eq!(writes, 4);
        {
            let mut udma = b.udma.borrow_mut();
            let sched = b.kernel.scheduler();
            udma.switch_mode(SimulationMode::Turbo, sched).unwrap();
            assert_eq!(udma.mode(), SimulationMode::Turbo);
        }
        b.kernel.run_to_completion(10_000_000).unwrap();
        assert_eq!(b.register(DESC_DONE), 2);
        assert_eq!(b.pif_count("WRITE"), writes);
        assert_eq!(b.sysmem.borrow().store().read(0x6000, 64).unwrap(), data);
    }

    #[test]
    fn test_descriptor_ring_wraps() {
        let mut b = Bench::new(UdmaConfig::default());
        b.local
            .borrow_mut()
            .store_mut()
            .poke(LOCAL_BASE as u64, &pattern(16, 0))
            .unwrap();
        b.start(
            &[
                copy(LOCAL_BASE, 0x7000, 8, 0),
                copy(LOCAL_BASE + 8, 0x7008, 8, 0),
            ],
            SETTINGS_ENABLE,
        );
        b.udma
            .borrow_mut()
            .write_register(DESC_NUM, 1, b.kernel.scheduler())
            .unwrap();
        b.kernel.run_to_completion(10_000_000).unwrap();
        assert_eq!(b.register(DESC_DONE), 3);
        assert_eq!(b.register(DESC_CUR_PTR), RING + DESCRIPTOR_SIZE as u32);
        assert_eq!(b.sysmem.borrow().store().read(0x7000, 16).unwrap(), pattern(16, 0));
    }

    #[test]
    fn test_registers_over_the_bus() {
        let mut b = Bench::new(UdmaConfig::default());
        let (write, read, bad) = {
            let mut cpu = b.cpu.borrow_mut();
            let sched = b.kernel.scheduler();
            let write = cpu
                .write(0, DESC_START, &0x6000_8000u32.to_le_bytes(), sched)
                .unwrap();
            let read = cpu
                .issue(0, vec![Request::read(DESC_START, 4)], 3000, sched)
                .unwrap();
            let bad = cpu.read(0, 0x2, 4, sched).unwrap();
            (write, read, bad)
        };
        b.kernel.run_to_completion(10_000_000).unwrap();
        let cpu = b.cpu.borrow();
        assert_eq!(cpu.status_for(write), Some(Status::Ok));
        assert_eq!(cpu.data_for(read), 0x6000_8000u32.to_le_bytes().to_vec());
        assert_eq!(cpu.status_for(bad), Some(Status::AddressError));
        drop(cpu);
        assert_eq!(
            b.kernel.command("udma", "read_register 0x4").unwrap(),
            "0x60008000"
        );
        assert!(b.kernel.command("udma", "read_register 0x22").is_err());
    }

    #[test]
    fn test_chunks_are_planned_a_row_at_a_time() {
        let mut b = Bench::new(UdmaConfig::default());
        // 4096 passes over the same 32 KiB with one chunk in flight.
        let descriptor = Descriptor {
            source_address: LOCAL_BASE,
            destination_address: 0,
            num_bytes_per_row: 0x8000,
            max_block_transfers: 4,
            max_outstanding: 1,
            num_rows: 4096,
            ..Default::default()
        };
        let per_row = 0x8000 / (4 * 8);
        b.start(&[descriptor], SETTINGS_ENABLE);
        for _ in 0..4 {
            b.kernel.run_for(100_000).unwrap();
            let udma = b.udma.borrow();
            assert!(udma.is_busy());
            let execution = udma.execution.as_ref().unwrap();
            assert_eq!(execution.next_row, 1);
            assert!(execution.queued.len() < per_row);
            assert!(execution.in_flight <= 1);
            assert!(udma.chunks.len() <= 1);
        }
    }

    #[test]
    fn test_local_failure_is_not_a_pif_error() {
        // The configured local range is larger than the memory behind it.
        let config = UdmaConfig {
            local_memories: vec![LocalMemoryRange {
                start: LOCAL_BASE as u64,
                size: 0x2_0000,
            }],
            ..Default::default()
        };
        for turbo in [false, true] {
            let mut b = Bench::new(UdmaConfig {
                turbo,
                ..config.clone()
            });
            b.start(&[copy(LOCAL_BASE + 0x1_8000, 0x1000, 32, 0)], SETTINGS_ENABLE);
            b.kernel.run_to_completion(10_000_000).unwrap();
            assert_eq!(b.register(STATUS), UdmaError::CrossRamBoundary.bit());
            assert_eq!(b.register(DESC_DONE), 0);
            assert_eq!(b.pif_count("*"), 0);
        }
    }

    #[test]
    fn test_bad_widths_rejected() {
        let ctx = SimContext::default();
        let config = UdmaConfig {
            pif_byte_width: 12,
            ..Default::default()
        };
        assert!(Udma::new(ModuleId::from_index(0), "u", &ctx, config).is_err());
        let config = UdmaConfig {
            local_memories: vec![],
            ..Default::default()
        };
        assert!(Udma::new(ModuleId::from_index(0), "u", &ctx, config).is_err());
    }

    /// Counts wakeups per process.
    struct Watcher {
        id: ModuleId,
        wakes: [u32; 2],
    }

    impl Module for Watcher {
        fn id(&self) -> ModuleId {
            self.id
        }

        fn name(&self) -> &str {
            "watcher"
        }

        fn wake(&mut self, process: ProcessId, _: &mut Scheduler) -> Result<(), Error> {
            self.wakes[process] += 1;
            Ok(())
        }
    }

    #[test]
    fn test_listeners_are_woken() {
        let mut b = Bench::new(UdmaConfig::default());
        let watcher = b
            .kernel
            .add_module(|id, _| -> Result<Watcher, Error> { Ok(Watcher { id, wakes: [0; 2] }) })
            .unwrap();
        {
            let id = watcher.borrow().id();
            let mut udma = b.udma.borrow_mut();
            udma.set_interrupt_listener(id, 0);
            udma.set_switch_listener(id, 1);
        }
        let mut descriptor = copy(LOCAL_BASE, 0x8000, 16, 0);
        descriptor.sync_interrupt_enable = true;
        b.start(&[descriptor.clone(), descriptor], SETTINGS_ENABLE);
        b.kernel.run_for(2000).unwrap();
        assert!(!b.udma.borrow_mut().prepare_to_switch(SimulationMode::Turbo));
        b.kernel.run_to_completion(10_000_000).unwrap();
        assert_eq!(watcher.borrow().wakes, [1, 1]);
        assert_eq!(b.register(DESC_DONE), 1);

        // Clearing INTERRUPT and switching lets the second descriptor run.
        {
            let mut udma = b.udma.borrow_mut();
            let sched = b.kernel.scheduler();
            udma.write_register(INTERRUPT, 1, sched).unwrap();
            assert!(!udma.interrupt_pending());
            udma.switch_mode(SimulationMode::Turbo, sched).unwrap();
        }
        b.kernel.run_to_completion(10_000_000).unwrap();
        assert_eq!(watcher.borrow().wakes, [2, 1]);
        assert_eq!(b.register(DESC_DONE), 2);
        assert_eq!(
            b.kernel.command("udma", "dump_statistic_info").unwrap(),
            "descriptors=2 bytes=32 mode=turbo busy=false"
        );
    }
}
