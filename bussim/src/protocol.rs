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

//! Request and response beats and the two port roles that exchange them.
//!
//! A master calls [`RequestSink::nb_request`] once per request beat. The
//! slave answers each beat exactly once, either with a NACC (the master must
//! resend the identical beat later) or, possibly much later, with real
//! response beats through [`ResponseSink::nb_respond`]. A master that cannot
//! take a response returns `false` and the slave retries it.

use crate::sim::Scheduler;
use crate::Error;

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
pub enum RequestType {
    Read,
    Write,
    BlockRead,
    BlockWrite,
    BurstRead,
    BurstWrite,
    Rcw,
    Snoop,
}

impl RequestType {
    pub const ALL: [RequestType; 8] = [
        RequestType::Read,
        RequestType::Write,
        RequestType::BlockRead,
        RequestType::BlockWrite,
        RequestType::BurstRead,
        RequestType::BurstWrite,
        RequestType::Rcw,
        RequestType::Snoop,
    ];

    /// Types whose responses carry data.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            RequestType::Read | RequestType::BlockRead | RequestType::BurstRead | RequestType::Rcw
        )
    }

    /// Types whose request beats carry data.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            RequestType::Write | RequestType::BlockWrite | RequestType::BurstWrite
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            RequestType::Read => "READ",
            RequestType::Write => "WRITE",
            RequestType::BlockRead => "BLOCK_READ",
            RequestType::BlockWrite => "BLOCK_WRITE",
            RequestType::BurstRead => "BURST_READ",
            RequestType::BurstWrite => "BURST_WRITE",
            RequestType::Rcw => "RCW",
            RequestType::Snoop => "SNOOP",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Address sequencing of a multi-beat AXI burst.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum BurstType {
    Fixed,
    Incr,
    Wrap,
}

impl Default for BurstType {
    fn default() -> Self {
        BurstType::Incr
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum Status {
    Ok,
    Nacc,
    AddressError,
    DataError,
    AddressDataError,
    AxiOk,
    SlvErr,
    DecErr,
    ExOkay,
}

impl Status {
    pub fn is_nacc(&self) -> bool {
        *self == Status::Nacc
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok | Status::AxiOk | Status::ExOkay)
    }

    pub fn is_error(&self) -> bool {
        !self.is_ok() && !self.is_nacc()
    }

    /// Rank used when merging the statuses of several beats.
    pub fn severity(&self) -> u8 {
        match self {
            Status::Ok | Status::AxiOk | Status::ExOkay | Status::Nacc => 0,
            Status::DataError | Status::SlvErr => 1,
            Status::AddressError | Status::DecErr => 2,
            Status::AddressDataError => 3,
        }
    }

    /// The more severe of the two; `self` on a tie.
    pub fn combine(self, other: Status) -> Status {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn to_axi(self) -> Status {
        match self {
            Status::Ok | Status::AxiOk => Status::AxiOk,
            Status::DataError | Status::SlvErr => Status::SlvErr,
            Status::AddressError | Status::AddressDataError | Status::DecErr => Status::DecErr,
            Status::ExOkay => Status::ExOkay,
            Status::Nacc => Status::Nacc,
        }
    }

    pub fn to_pif(self) -> Status {
        match self {
            Status::Ok | Status::AxiOk | Status::ExOkay => Status::Ok,
            Status::DataError | Status::SlvErr => Status::DataError,
            Status::AddressError | Status::DecErr => Status::AddressError,
            Status::AddressDataError => Status::AddressDataError,
            Status::Nacc => Status::Nacc,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Status::Ok => "RSP_OK",
            Status::Nacc => "RSP_NACC",
            Status::AddressError => "RSP_ADDRESS_ERROR",
            Status::DataError => "RSP_DATA_ERROR",
            Status::AddressDataError => "RSP_ADDRESS_DATA_ERROR",
            Status::AxiOk => "OKAY",
            Status::SlvErr => "SLVERR",
            Status::DecErr => "DECERR",
            Status::ExOkay => "EXOKAY",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Byte-enable mask covering `size` bytes.
pub fn all_byte_enables(size: u32) -> u64 {
    if size >= 64 {
        u64::MAX
    } else {
        (1u64 << size) - 1
    }
}

/// One request beat.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub address: u64,
    /// Bytes per beat.
    pub size: u32,
    pub request_type: RequestType,
    /// 1-based beat index.
    pub transfer_number: u32,
    pub num_transfers: u32,
    pub last_transfer: bool,
    pub byte_enables: u64,
    pub id: u32,
    pub tag: u64,
    pub priority: u8,
    pub exclusive: bool,
    pub route_id: u32,
    pub pc: u64,
    pub burst: BurstType,
    pub data: Vec<u8>,
}

impl Request {
    pub fn new(request_type: RequestType, address: u64, size: u32) -> Self {
        Self {
            address,
            size,
            request_type,
            transfer_number: 1,
            num_transfers: 1,
            last_transfer: true,
            byte_enables: all_byte_enables(size),
            id: 0,
            tag: 0,
            priority: 0,
            exclusive: false,
            route_id: 0,
            pc: 0,
            burst: BurstType::Incr,
            data: vec![],
        }
    }

    pub fn read(address: u64, size: u32) -> Self {
        Self::new(RequestType::Read, address, size)
    }

    pub fn write(address: u64, data: &[u8]) -> Self {
        let mut request = Self::new(RequestType::Write, address, data.len() as u32);
        request.data = data.to_vec();
        request
    }

    /// A PIF block read of `beats` beats of `size` bytes.
    pub fn block_read(address: u64, size: u32, beats: u32) -> Self {
        let mut request = Self::new(RequestType::BlockRead, address, size);
        request.num_transfers = beats;
        request
    }

    /// An AXI read burst; a single request describes the whole burst.
    pub fn burst_read(address: u64, size: u32, beats: u32, burst: BurstType) -> Self {
        let mut request = Self::new(RequestType::BurstRead, address, size);
        request.num_transfers = beats;
        request.burst = burst;
        request
    }

    /// The beats of a PIF block write; `data` is split into `size`-byte
    /// beats.
    pub fn block_write(address: u64, size: u32, data: &[u8]) -> Vec<Self> {
        Self::multi_beat_write(RequestType::BlockWrite, address, size, data, BurstType::Incr)
    }

    /// The beats of an AXI write burst.
    pub fn burst_write(address: u64, size: u32, data: &[u8], burst: BurstType) -> Vec<Self> {
        Self::multi_beat_write(RequestType::BurstWrite, address, size, data, burst)
    }

    /// The two beats of a PIF read-conditional-write: compare then swap.
    pub fn rcw(address: u64, compare: &[u8], swap: &[u8]) -> Vec<Self> {
        let size = compare.len() as u32;
        let mut first = Self::new(RequestType::Rcw, address, size);
        first.num_transfers = 2;
        first.last_transfer = false;
        first.data = compare.to_vec();
        let mut second = first.clone();
        second.transfer_number = 2;
        second.last_transfer = true;
        second.data = swap.to_vec();
        vec![first, second]
    }

    fn multi_beat_write(
        request_type: RequestType,
        address: u64,
        size: u32,
        data: &[u8],
        burst: BurstType,
    ) -> Vec<Self> {
        let beats = data.chunks(size as usize).collect::<Vec<_>>();
        let mut first = Self::new(request_type, address, size);
        first.num_transfers = beats.len() as u32;
        first.burst = burst;
        beats
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut request = first.clone();
                request.address = first.beat_address(i as u32);
                request.transfer_number = i as u32 + 1;
                request.last_transfer = i as u32 + 1 == first.num_transfers;
                request.data = chunk.to_vec();
                request
            })
            .collect()
    }

    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_route_id(mut self, route_id: u32) -> Self {
        self.route_id = route_id;
        self
    }

    pub fn total_bytes(&self) -> u64 {
        self.size as u64 * self.num_transfers as u64
    }

    /// Address of 0-based beat `beat`, taking `self` as the first beat. PIF
    /// blocks wrap at the block size (critical word first); AXI bursts follow
    /// `burst`.
    pub fn beat_address(&self, beat: u32) -> u64 {
        let size = self.size as u64;
        let offset = beat as u64 * size;
        let wraps = match self.request_type {
            RequestType::BlockRead | RequestType::BlockWrite => true,
            RequestType::BurstRead | RequestType::BurstWrite => self.burst == BurstType::Wrap,
            _ => false,
        };
        match self.burst {
            BurstType::Fixed
                if matches!(
                    self.request_type,
                    RequestType::BurstRead | RequestType::BurstWrite
                ) =>
            {
                self.address
            }
            _ if wraps => {
                let boundary = self.total_bytes().max(1);
                let base = self.address - self.address % boundary;
                base + (self.address - base + offset) % boundary
            }
            _ => self.address + offset,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "tag={} {} [{:#010x}/{}] {}/{}{} id={}",
            self.tag,
            self.request_type,
            self.address,
            self.size,
            self.transfer_number,
            self.num_transfers,
            if self.last_transfer { " last" } else { "" },
            self.id
        )
    }
}

/// One response beat.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: Status,
    pub address: u64,
    pub size: u32,
    pub request_type: RequestType,
    pub transfer_number: u32,
    pub last_transfer: bool,
    pub id: u32,
    pub tag: u64,
    pub route_id: u32,
    pub exclusive: bool,
    pub data: Vec<u8>,
}

impl Response {
    /// A single, final response to `request`.
    pub fn new(request: &Request, status: Status) -> Self {
        Self {
            status,
            address: request.address,
            size: request.size,
            request_type: request.request_type,
            transfer_number: 1,
            last_transfer: true,
            id: request.id,
            tag: request.tag,
            route_id: request.route_id,
            exclusive: request.exclusive,
            data: vec![],
        }
    }

    /// The NACC for one request beat; mirrors the beat's position so the
    /// issuer can match it.
    pub fn nacc(request: &Request) -> Self {
        let mut response = Self::new(request, Status::Nacc);
        response.transfer_number = request.transfer_number;
        response.last_transfer = request.last_transfer;
        response
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn with_beat(mut self, transfer_number: u32, last_transfer: bool) -> Self {
        self.transfer_number = transfer_number;
        self.last_transfer = last_transfer;
        self
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "tag={} {} {} [{:#010x}] {}{} id={}",
            self.tag,
            self.request_type,
            self.status,
            self.address,
            self.transfer_number,
            if self.last_transfer { " last" } else { "" },
            self.id
        )
    }
}

/// The slave side of a port pair.
pub trait RequestSink {
    fn nb_request(&mut self, port: usize, request: Request, sched: &mut Scheduler);

    /// Debug read that bypasses timing.
    fn nb_peek(&mut self, port: usize, address: u64, buffer: &mut [u8]) -> Result<(), Error> {
        let _ = (port, buffer);
        Err(Error::InvalidAddress(address))
    }

    /// Debug write that bypasses timing.
    fn nb_poke(&mut self, port: usize, address: u64, data: &[u8]) -> Result<(), Error> {
        let _ = (port, data);
        Err(Error::InvalidAddress(address))
    }

    fn bind_upstream(&mut self, port: usize, link: ResponseLink) -> Result<(), Error>;
}

/// The master side of a port pair.
pub trait ResponseSink {
    /// Returns false when the response cannot be taken now.
    fn nb_respond(&mut self, port: usize, response: Response, sched: &mut Scheduler) -> bool;

    fn bind_downstream(&mut self, port: usize, link: RequestLink) -> Result<(), Error>;
}

/// A master's handle on one slave port.
#[derive(Clone)]
pub struct RequestLink {
    sink: Rc<RefCell<dyn RequestSink>>,
    port: usize,
}

impl RequestLink {
    pub fn new(sink: Rc<RefCell<dyn RequestSink>>, port: usize) -> Self {
        Self { sink, port }
    }

    pub fn nb_request(&self, request: Request, sched: &mut Scheduler) {
        self.sink.borrow_mut().nb_request(self.port, request, sched)
    }

    pub fn nb_peek(&self, address: u64, buffer: &mut [u8]) -> Result<(), Error> {
        self.sink.borrow_mut().nb_peek(self.port, address, buffer)
    }

    pub fn nb_poke(&self, address: u64, data: &[u8]) -> Result<(), Error> {
        self.sink.borrow_mut().nb_poke(self.port, address, data)
    }
}

impl fmt::Debug for RequestLink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RequestLink(port {})", self.port)
    }
}

/// A slave's handle on the master port that feeds it.
#[derive(Clone)]
pub struct ResponseLink {
    sink: Rc<RefCell<dyn ResponseSink>>,
    port: usize,
}

impl ResponseLink {
    pub fn new(sink: Rc<RefCell<dyn ResponseSink>>, port: usize) -> Self {
        Self { sink, port }
    }

    pub fn nb_respond(&self, response: Response, sched: &mut Scheduler) -> bool {
        self.sink.borrow_mut().nb_respond(self.port, response, sched)
    }
}

impl fmt::Debug for ResponseLink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ResponseLink(port {})", self.port)
    }
}

/// A fixed set of ports, each bound at most once.
#[derive(Debug)]
pub struct Ports<L> {
    owner: String,
    links: Vec<Option<L>>,
}

impl<L> Ports<L> {
    pub fn new(owner: &str, count: usize) -> Self {
        Self {
            owner: owner.to_string(),
            links: (0..count).map(|_| None).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn bind(&mut self, port: usize, link: L) -> Result<(), Error> {
        let slot = self.links.get_mut(port).ok_or(Error::InvalidPort(port))?;
        if slot.is_some() {
            return Err(Error::AlreadyBound {
                module: self.owner.clone(),
                port,
            });
        }
        *slot = Some(link);
        Ok(())
    }

    pub fn get(&self, port: usize) -> Result<&L, Error> {
        self.links
            .get(port)
            .ok_or(Error::InvalidPort(port))?
            .as_ref()
            .ok_or_else(|| Error::UnboundPort {
                module: self.owner.clone(),
                port,
            })
    }
}

/// Connects `master_port` of `master` to `slave_port` of `slave` in both
/// directions.
pub fn bind<M, S>(
    master: &Rc<RefCell<M>>,
    master_port: usize,
    slave: &Rc<RefCell<S>>,
    slave_port: usize,
) -> Result<(), Error>
where
    M: ResponseSink + 'static,
    S: RequestSink + 'static,
{
    let to_slave: Rc<RefCell<dyn RequestSink>> = slave.clone();
    let to_master: Rc<RefCell<dyn ResponseSink>> = master.clone();
    master
        .borrow_mut()
        .bind_downstream(master_port, RequestLink::new(to_slave, slave_port))?;
    slave
        .borrow_mut()
        .bind_upstream(slave_port, ResponseLink::new(to_master, master_port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_combining() {
        assert_eq!(Status::AxiOk.combine(Status::SlvErr), Status::SlvErr);
        assert_eq!(Status::SlvErr.combine(Status::DecErr), Status::DecErr);
        assert_eq!(Status::DecErr.combine(Status::SlvErr), Status::DecErr);
        assert_eq!(
            Status::DataError.combine(Status::AddressDataError),
            Status::AddressDataError
        );
        // Ties keep the first.
        assert_eq!(Status::AddressError.combine(Status::DecErr), Status::AddressError);
        assert_eq!(Status::Ok.combine(Status::ExOkay), Status::Ok);
    }

    #[test]
    fn test_status_translation() {
        assert_eq!(Status::DataError.to_axi(), Status::SlvErr);
        assert_eq!(Status::AddressDataError.to_axi(), Status::DecErr);
        assert_eq!(Status::DecErr.to_pif(), Status::AddressError);
        assert_eq!(Status::ExOkay.to_pif(), Status::Ok);
        assert_eq!(Status::Ok.to_axi(), Status::AxiOk);
    }

    #[test]
    fn test_block_write_beats() {
        let data = (0u8..32).collect::<Vec<_>>();
        let beats = Request::block_write(0x1000, 8, &data);
        assert_eq!(beats.len(), 4);
        assert_eq!(
            beats.iter().map(|b| b.transfer_number).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert!(beats[3].last_transfer);
        assert!(!beats[2].last_transfer);
        assert_eq!(beats[1].address, 0x1008);
        assert_eq!(beats[3].data, (24u8..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_beat_addresses() {
        // Critical word first: a 4x8 block starting at 0x1010 wraps at 32.
        let block = Request::block_read(0x1010, 8, 4);
        assert_eq!(
            (0..4).map(|i| block.beat_address(i)).collect::<Vec<_>>(),
            vec![0x1010, 0x1018, 0x1000, 0x1008]
        );
        let incr = Request::burst_read(0x1010, 8, 4, BurstType::Incr);
        assert_eq!(incr.beat_address(3), 0x1028);
        let fixed = Request::burst_read(0x1010, 8, 4, BurstType::Fixed);
        assert_eq!(fixed.beat_address(3), 0x1010);
    }

    #[test]
    fn test_names_round_trip() {
        for t in RequestType::ALL.iter() {
            assert_eq!(RequestType::from_name(t.name()), Some(*t));
        }
        assert_eq!(RequestType::from_name("BOGUS"), None);
    }

    #[test]
    fn test_ports() {
        let mut ports: Ports<u32> = Ports::new("dut", 2);
        assert_eq!(
            ports.get(1),
            Err(Error::UnboundPort {
                module: "dut".to_string(),
                port: 1
            })
        );
        ports.bind(1, 7).unwrap();
        assert!(ports.bind(1, 8).is_err());
        assert_eq!(ports.bind(2, 8), Err(Error::InvalidPort(2)));
        assert_eq!(ports.get(1), Ok(&7));
    }
}
