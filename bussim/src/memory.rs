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

//! Backing store and the memory slave device built on it.

use crate::config::{BusProtocol, MemoryConfig};
use crate::issuer::ResponseIssuer;
use crate::protocol::{Request, RequestSink, RequestType, Response, ResponseLink, Status};
use crate::sim::{Module, ModuleId, ProcessId, Scheduler, SimContext, Time};
use crate::Error;

use itertools::Itertools;
use rand::{Rng, RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use std::collections::{HashMap, VecDeque};

/// A sparse byte array over `[start, start + size)`, allocated a page at a
/// time on first write.
#[derive(Debug)]
pub struct PagedMemory {
    start: u64,
    size: u64,
    page_size: u64,
    initial: u8,
    pages: HashMap<u64, Vec<u8>>,
}

impl PagedMemory {
    pub fn new(start: u64, size: u64, page_size: u64, initial: u8) -> Result<Self, Error> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(Error::config(
                "memory",
                format!("page size {} is not a power of two", page_size),
            ));
        }
        if size == 0 {
            return Err(Error::config("memory", "size must not be zero"));
        }
        Ok(Self {
            start,
            size,
            page_size,
            initial,
            pages: HashMap::new(),
        })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn contains(&self, address: u64, len: u64) -> bool {
        address >= self.start
            && address
                .checked_add(len)
                .map_or(false, |end| end <= self.start + self.size)
    }

    fn check(&self, address: u64, len: usize) -> Result<(), Error> {
        if self.contains(address, len as u64) {
            Ok(())
        } else {
            Err(Error::InvalidAddress(address))
        }
    }

    fn locate(&self, address: u64) -> (u64, usize) {
        let offset = address - self.start;
        (offset / self.page_size, (offset % self.page_size) as usize)
    }

    pub fn peek(&self, address: u64, buffer: &mut [u8]) -> Result<(), Error> {
        self.check(address, buffer.len())?;
        for (i, byte) in buffer.iter_mut().enumerate() {
            let (page, offset) = self.locate(address + i as u64);
            *byte = self
                .pages
                .get(&page)
                .map_or(self.initial, |page| page[offset]);
        }
        Ok(())
    }

    pub fn poke(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        self.check(address, data.len())?;
        for (i, byte) in data.iter().enumerate() {
            self.store_byte(address + i as u64, *byte);
        }
        Ok(())
    }

    pub fn read(&self, address: u64, size: usize) -> Result<Vec<u8>, Error> {
        let mut data = vec![0; size];
        self.peek(address, &mut data)?;
        Ok(data)
    }

    /// Writes the bytes of `data` whose bit is set in `byte_enables`.
    pub fn write(&mut self, address: u64, data: &[u8], byte_enables: u64) -> Result<(), Error> {
        self.check(address, data.len())?;
        for (i, byte) in data.iter().enumerate() {
            if i >= 64 || byte_enables & (1 << i) != 0 {
                self.store_byte(address + i as u64, *byte);
            }
        }
        Ok(())
    }

    fn store_byte(&mut self, address: u64, byte: u8) {
        let (page, offset) = self.locate(address);
        let (page_size, initial) = (self.page_size as usize, self.initial);
        self.pages
            .entry(page)
            .or_insert_with(|| vec![initial; page_size])[offset] = byte;
    }

    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

#[derive(Debug, Default)]
struct WriteState {
    status: Option<Status>,
    exclusive_ok: Option<bool>,
}

struct PortState {
    requests: VecDeque<Request>,
    responses: ResponseIssuer,
    next_service: Time,
}

/// A memory slave answering PIF or AXI requests on `num_ports` ports.
///
/// Each port accepts requests into a FIFO of `request_fifo_depth` beats and
/// NACCs the rest. A port services one beat per clock; read data goes out
/// `read_delay` cycles later, one beat every `burst_repeat` cycles, and a
/// write is answered `write_delay` cycles after its last beat.
pub struct Memory {
    id: ModuleId,
    name: String,
    config: MemoryConfig,
    clock_period: Time,
    store: PagedMemory,
    ports: Vec<PortState>,
    rng: Box<dyn RngCore>,
    /// Exclusive monitor; see `monitor_key`.
    reservations: HashMap<(u32, u32), (u64, u64)>,
    writes: HashMap<(usize, u64), WriteState>,
    rcw_compares: HashMap<(usize, u64), Request>,
    accepted: u64,
    naccs: u64,
}

impl Memory {
    pub fn new(id: ModuleId, name: &str, ctx: &SimContext, config: MemoryConfig) -> Result<Self, Error> {
        if config.num_ports == 0 {
            return Err(Error::config(name, "num_ports must be at least 1"));
        }
        if config.request_fifo_depth == 0 {
            return Err(Error::config(name, "request_fifo_depth must be at least 1"));
        }
        if config.fail_percentage > 100 {
            return Err(Error::config(name, "fail_percentage exceeds 100"));
        }
        if !matches!(config.byte_width, 4 | 8 | 16 | 32 | 64) {
            return Err(Error::config(
                name,
                format!("unsupported byte_width {}", config.byte_width),
            ));
        }
        let clock_period = ctx.period_or_default(config.clock_period);
        let store = PagedMemory::new(
            config.start_address,
            config.size,
            config.page_byte_size,
            config.initial_value,
        )
        .map_err(|_| Error::config(name, "bad page_byte_size or size"))?;
        let ports = (0..config.num_ports)
            .map(|port| PortState {
                requests: VecDeque::with_capacity(config.request_fifo_depth),
                responses: ResponseIssuer::new(
                    &format!("{}.port{}", name, port),
                    id,
                    2 * port,
                    port,
                    clock_period,
                ),
                next_service: 0,
            })
            .collect();
        Ok(Self {
            id,
            name: name.to_string(),
            clock_period,
            store,
            ports,
            rng: Box::new(Xoshiro256StarStar::seed_from_u64(config.fail_seed)),
            reservations: HashMap::new(),
            writes: HashMap::new(),
            rcw_compares: HashMap::new(),
            accepted: 0,
            naccs: 0,
            config,
        })
    }

    pub fn store(&self) -> &PagedMemory {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut PagedMemory {
        &mut self.store
    }

    pub fn naccs(&self) -> u64 {
        self.naccs
    }

    /// Exclusive success is reported as EXOKAY on either bus.
    fn translate(&self, status: Status) -> Status {
        if status == Status::ExOkay {
            return status;
        }
        match self.config.protocol {
            BusProtocol::Pif => status.to_pif(),
            BusProtocol::Axi => status.to_axi(),
        }
    }

    fn serve(&mut self, port: usize, sched: &mut Scheduler) -> Result<(), Error> {
        let now = sched.now();
        let state = &mut self.ports[port];
        if state.requests.is_empty() {
            return Ok(());
        }
        if now < state.next_service {
            sched.notify_at(self.id, 2 * port + 1, state.next_service);
            return Ok(());
        }
        let request = match state.requests.pop_front() {
            Some(request) => request,
            None => return Ok(()),
        };
        state.next_service = now + self.clock_period;
        if !state.requests.is_empty() {
            sched.notify_at(self.id, 2 * port + 1, state.next_service);
        }
        log::trace!("{}: serving {}", self.name, request);
        match request.request_type {
            RequestType::Read | RequestType::BlockRead | RequestType::BurstRead => {
                self.serve_read(port, request, sched)
            }
            RequestType::Write | RequestType::BlockWrite | RequestType::BurstWrite => {
                self.serve_write(port, request, sched)
            }
            RequestType::Rcw => self.serve_rcw(port, request, sched),
            RequestType::Snoop => {
                let response = Response::new(&request, self.translate(Status::AddressError));
                let delay = self.config.read_delay * self.clock_period;
                self.ports[port].responses.push(response, delay, sched);
                Ok(())
            }
        }
    }

    fn serve_read(&mut self, port: usize, request: Request, sched: &mut Scheduler) -> Result<(), Error> {
        let beats = request.num_transfers.max(1);
        let size = request.size as u64;
        let in_range = (0..beats).all(|beat| self.store.contains(request.beat_address(beat), size));
        let delay = self.config.read_delay * self.clock_period;
        let repeat = self.config.burst_repeat * self.clock_period;
        if !in_range && self.config.protocol == BusProtocol::Pif {
            let response = Response::new(&request, Status::AddressError);
            self.ports[port].responses.push(response, delay, sched);
            return Ok(());
        }
        let mut status = if in_range { Status::Ok } else { Status::DecErr };
        if request.exclusive && in_range {
            let key = self.monitor_key(&request);
            self.reservations
                .insert(key, (request.address, request.total_bytes()));
            status = Status::ExOkay;
        }
        let status = self.translate(status);
        for beat in 0..beats {
            let address = request.beat_address(beat);
            let data = if in_range {
                self.store.read(address, request.size as usize)?
            } else {
                vec![0; request.size as usize]
            };
            let mut response = Response::new(&request, status)
                .with_beat(beat + 1, beat + 1 == beats)
                .with_data(data);
            response.address = address;
            self.ports[port]
                .responses
                .push(response, delay + beat as u64 * repeat, sched);
        }
        Ok(())
    }

    /// AXI monitors track (route, id) pairs; PIF has one monitor per route.
    fn monitor_key(&self, request: &Request) -> (u32, u32) {
        match self.config.protocol {
            BusProtocol::Axi => (request.route_id, request.id),
            BusProtocol::Pif => (request.route_id, 0),
        }
    }

    fn clear_reservations(&mut self, address: u64, len: u64) {
        self.reservations
            .retain(|_, (start, size)| address + len <= *start || *start + *size <= address);
    }

    fn serve_write(&mut self, port: usize, request: Request, sched: &mut Scheduler) -> Result<(), Error> {
        let key = (port, request.tag);
        let size = request.data.len() as u64;
        let mut state = self.writes.remove(&key).unwrap_or_default();
        if request.exclusive && state.exclusive_ok.is_none() {
            let reserved = self.reservations.get(&self.monitor_key(&request)).copied();
            state.exclusive_ok = Some(reserved == Some((request.address, request.total_bytes())));
        }
        if !self.store.contains(request.address, size) {
            state.status = Some(Status::AddressError);
        } else if state.exclusive_ok != Some(false) {
            self.store
                .write(request.address, &request.data, request.byte_enables)?;
            self.clear_reservations(request.address, size);
        }
        if !request.last_transfer {
            self.writes.insert(key, state);
            return Ok(());
        }
        let status = match (state.status, state.exclusive_ok) {
            (Some(error), _) => error,
            (None, Some(true)) => Status::ExOkay,
            _ => Status::Ok,
        };
        let mut response = Response::new(&request, self.translate(status));
        response.transfer_number = request.transfer_number;
        let delay = self.config.write_delay * self.clock_period;
        self.ports[port].responses.push(response, delay, sched);
        Ok(())
    }

    fn serve_rcw(&mut self, port: usize, request: Request, sched: &mut Scheduler) -> Result<(), Error> {
        let key = (port, request.tag);
        if !request.last_transfer {
            self.rcw_compares.insert(key, request);
            return Ok(());
        }
        let compare = self.rcw_compares.remove(&key).ok_or_else(|| {
            Error::protocol(
                &self.name,
                Some(request.tag),
                Some(request.address),
                "RCW swap beat without compare beat",
            )
        })?;
        let delay = self.config.read_delay * self.clock_period;
        let size = request.size as usize;
        if !self.store.contains(request.address, size as u64) {
            let response = Response::new(&request, self.translate(Status::AddressError));
            self.ports[port].responses.push(response, delay, sched);
            return Ok(());
        }
        let old = self.store.read(request.address, size)?;
        let matches = old
            .iter()
            .zip(compare.data.iter())
            .enumerate()
            .all(|(i, (o, c))| (i < 64 && compare.byte_enables & (1 << i) == 0) || o == c);
        if matches {
            self.store
                .write(request.address, &request.data, request.byte_enables)?;
            self.clear_reservations(request.address, size as u64);
        }
        log::debug!(
            "{}: RCW at {:#x} {}",
            self.name,
            request.address,
            if matches { "swapped" } else { "kept" }
        );
        let response = Response::new(&request, self.translate(Status::Ok)).with_data(old);
        self.ports[port].responses.push(response, delay, sched);
        Ok(())
    }

    fn peek_command(&self, address: &str, len: &str) -> Result<String, Error> {
        let address = parse_number(address)?;
        let len = parse_number(len)? as usize;
        let data = self.store.read(address, len)?;
        Ok(data.iter().map(|b| format!("{:#04x}", b)).join(" "))
    }

    fn poke_command(&mut self, address: &str, bytes: &[&str]) -> Result<String, Error> {
        let address = parse_number(address)?;
        let data = bytes
            .iter()
            .map(|b| parse_number(b).map(|v| v as u8))
            .collect::<Result<Vec<_>, _>>()?;
        self.store.poke(address, &data)?;
        Ok(String::new())
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_number(text: &str) -> Result<u64, Error> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };
    parsed.map_err(|_| Error::InvalidArgument(text.to_string()))
}

impl RequestSink for Memory {
    fn nb_request(&mut self, port: usize, request: Request, sched: &mut Scheduler) {
        let full = match self.ports.get(port) {
            Some(state) => state.requests.len() >= self.config.request_fifo_depth,
            None => {
                log::error!("{}: request on unknown port {}", self.name, port);
                return;
            }
        };
        let fail = self.config.fail_percentage > 0
            && self.rng.gen_range(0..100) < self.config.fail_percentage;
        let state = &mut self.ports[port];
        if full || fail {
            log::trace!("{}: NACC {} ({})", self.name, request, if full { "full" } else { "injected" });
            self.naccs += 1;
            state.responses.push_nacc(Response::nacc(&request), sched);
            return;
        }
        self.accepted += 1;
        state.requests.push_back(request);
        sched.notify_at(self.id, 2 * port + 1, state.next_service);
    }

    fn nb_peek(&mut self, _port: usize, address: u64, buffer: &mut [u8]) -> Result<(), Error> {
        self.store.peek(address, buffer)
    }

    fn nb_poke(&mut self, _port: usize, address: u64, data: &[u8]) -> Result<(), Error> {
        self.store.poke(address, data)
    }

    fn bind_upstream(&mut self, port: usize, link: ResponseLink) -> Result<(), Error> {
        self.ports
            .get_mut(port)
            .ok_or(Error::InvalidPort(port))?
            .responses
            .bind(link)
    }
}

impl Module for Memory {
    fn id(&self) -> ModuleId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn wake(&mut self, process: ProcessId, sched: &mut Scheduler) -> Result<(), Error> {
        let port = process / 2;
        if port >= self.ports.len() {
            return Err(Error::protocol(&self.name, None, None, format!("no process {}", process)));
        }
        if process % 2 == 0 {
            self.ports[port].responses.wake(sched).map(|_| ())
        } else {
            self.serve(port, sched)
        }
    }

    fn command(&mut self, words: &[&str], _sched: &mut Scheduler) -> Result<String, Error> {
        match words {
            ["peek", address, len] => self.peek_command(address, len),
            ["poke", address, bytes @ ..] if !bytes.is_empty() => self.poke_command(address, bytes),
            ["dump_statistic_info"] => Ok(format!(
                "accepted={} naccs={} pages={}",
                self.accepted,
                self.naccs,
                self.store.num_pages()
            )),
            ["reset"] => {
                self.store.clear();
                self.reservations.clear();
                self.writes.clear();
                self.rcw_compares.clear();
                self.accepted = 0;
                self.naccs = 0;
                Ok(String::new())
            }
            _ => Err(Error::UnknownCommand(words.join(" "))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paged_memory() {
        let mut mem = PagedMemory::new(0x1000, 0x10000, 256, 0xee).unwrap();
        assert_eq!(mem.read(0x1000, 2).unwrap(), vec![0xee, 0xee]);
        assert_eq!(mem.num_pages(), 0);
        // Straddles a page boundary.
        mem.poke(0x10fe, &[1, 2, 3, 4]).unwrap();
        assert_eq!(mem.num_pages(), 2);
        assert_eq!(mem.read(0x10fd, 6).unwrap(), vec![0xee, 1, 2, 3, 4, 0xee]);
        mem.write(0x10fe, &[9, 9, 9, 9], 0b1010).unwrap();
        assert_eq!(mem.read(0x10fe, 4).unwrap(), vec![1, 9, 3, 9]);
        assert_eq!(mem.read(0x10ffe, 4), Err(Error::InvalidAddress(0x10ffe)));
        assert!(mem.poke(0xfff, &[0]).is_err());
    }

    #[test]
    fn test_page_size_must_be_power_of_two() {
        assert!(PagedMemory::new(0, 1024, 100, 0).is_err());
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("0x10"), Ok(16));
        assert_eq!(parse_number("42"), Ok(42));
        assert!(parse_number("zz").is_err());
    }
}
