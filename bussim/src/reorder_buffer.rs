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

//! Restores issue order to responses of a slave that completes out of
//! order.
//!
//! Reads and writes travel in independent lanes. Each accepted transaction
//! is renumbered with the lane's `request_counter`; responses are held
//! until every older transaction of the lane has been released, then go
//! upstream with the original id restored.

use crate::config::ReorderBufferConfig;
use crate::issuer::{RequestIssuer, ResponseIssuer};
use crate::protocol::{
    Request, RequestLink, RequestSink, RequestType, Response, ResponseLink, ResponseSink,
};
use crate::sim::{Module, ModuleId, ProcessId, Scheduler, SimContext, Time};
use crate::Error;

use std::collections::{HashMap, VecDeque};

const DOWNSTREAM: ProcessId = 0;
const UPSTREAM: ProcessId = 1;
const DRAIN: ProcessId = 2;
const FAULT: ProcessId = 3;

pub const VALID_NUM_ENTRIES: [usize; 4] = [32, 48, 64, 128];

#[derive(Debug)]
struct RobEntry {
    original_id: u32,
    tag: u64,
    expected: u32,
    received: u32,
    released: u32,
    buffered: VecDeque<Response>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Lane {
    Read,
    Write,
}

impl Lane {
    fn of(request_type: RequestType) -> Self {
        if request_type.is_write() {
            Lane::Write
        } else {
            Lane::Read
        }
    }
}

#[derive(Debug)]
struct LaneState {
    request_counter: usize,
    response_counter: usize,
    outstanding: usize,
    entries: Vec<Option<RobEntry>>,
    /// Ids of transactions whose request beats are still arriving.
    open: HashMap<u64, usize>,
}

impl LaneState {
    fn new(num_entries: usize) -> Self {
        Self {
            request_counter: 0,
            response_counter: 0,
            outstanding: 0,
            entries: (0..num_entries).map(|_| None).collect(),
            open: HashMap::new(),
        }
    }
}

pub struct ReorderBuffer {
    id: ModuleId,
    name: String,
    config: ReorderBufferConfig,
    clock_period: Time,
    lanes: [LaneState; 2],
    downstream: RequestIssuer,
    upstream: ResponseIssuer,
    fault: Option<Error>,
    naccs: u64,
}

impl ReorderBuffer {
    pub fn new(
        id: ModuleId,
        name: &str,
        ctx: &SimContext,
        config: ReorderBufferConfig,
    ) -> Result<Self, Error> {
        if !VALID_NUM_ENTRIES.contains(&config.num_entries) {
            return Err(Error::config(
                name,
                format!(
                    "num_entries {} is not one of {:?}",
                    config.num_entries, VALID_NUM_ENTRIES
                ),
            ));
        }
        if config.request_fifo_depth == 0 {
            return Err(Error::config(name, "request_fifo_depth must be at least 1"));
        }
        let clock_period = ctx.period_or_default(config.clock_period);
        Ok(Self {
            id,
            name: name.to_string(),
            clock_period,
            lanes: [
                LaneState::new(config.num_entries),
                LaneState::new(config.num_entries),
            ],
            downstream: RequestIssuer::new(
                &format!("{}.downstream", name),
                id,
                DOWNSTREAM,
                0,
                clock_period,
                config.nacc_wait_time,
            )?,
            upstream: ResponseIssuer::new(&format!("{}.upstream", name), id, UPSTREAM, 0, clock_period),
            fault: None,
            naccs: 0,
            config,
        })
    }

    fn lane(&self, lane: Lane) -> &LaneState {
        &self.lanes[lane as usize]
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut LaneState {
        &mut self.lanes[lane as usize]
    }

    /// `(request_counter, response_counter)` of a lane.
    pub fn counters(&self, lane: Lane) -> (usize, usize) {
        let state = self.lane(lane);
        (state.request_counter, state.response_counter)
    }

    pub fn outstanding(&self, lane: Lane) -> usize {
        self.lane(lane).outstanding
    }

    pub fn naccs(&self) -> u64 {
        self.naccs
    }

    fn fail(&mut self, err: Error, sched: &mut Scheduler) {
        log::error!("{}", err);
        if self.fault.is_none() {
            self.fault = Some(err);
        }
        sched.notify(self.id, FAULT, 0);
    }

    fn expected_responses(request: &Request) -> u32 {
        if request.request_type.is_read() && request.request_type != RequestType::Rcw {
            request.num_transfers.max(1)
        } else {
            1
        }
    }

    fn drain(&mut self, sched: &mut Scheduler) {
        let delay = self.config.response_delay * self.clock_period;
        let num_entries = self.config.num_entries;
        for lane in [Lane::Read, Lane::Write] {
            loop {
                let state = &mut self.lanes[lane as usize];
                let counter = state.response_counter;
                let entry = match state.entries[counter].as_mut() {
                    Some(entry) => entry,
                    None => break,
                };
                while let Some(mut response) = entry.buffered.pop_front() {
                    response.id = entry.original_id;
                    entry.released += 1;
                    log::trace!("{}: releasing id {} {}", self.name, counter, response);
                    self.upstream.push(response, delay, sched);
                }
                if entry.released < entry.expected {
                    break;
                }
                log::trace!("{}: {:?} lane retires id {} (tag {})", self.name, lane, counter, entry.tag);
                state.entries[counter] = None;
                state.outstanding -= 1;
                state.response_counter = (counter + 1) % num_entries;
            }
        }
    }
}

impl RequestSink for ReorderBuffer {
    fn nb_request(&mut self, _port: usize, request: Request, sched: &mut Scheduler) {
        let lane = Lane::of(request.request_type);
        let num_entries = self.config.num_entries;
        let first_beat = !self.lane(lane).open.contains_key(&request.tag);
        let fifo_full = self.downstream.pending() >= self.config.request_fifo_depth;
        let lane_full = first_beat && self.lane(lane).outstanding >= num_entries;
        if fifo_full || lane_full {
            log::trace!(
                "{}: NACC {} ({})",
                self.name,
                request,
                if fifo_full { "fifo full" } else { "lane full" }
            );
            self.naccs += 1;
            self.upstream.push_nacc(Response::nacc(&request), sched);
            return;
        }
        let expected = Self::expected_responses(&request);
        let state = self.lane_mut(lane);
        let assigned = if first_beat {
            let assigned = state.request_counter;
            if state.entries[assigned].is_some() {
                let err = Error::protocol(
                    &self.name,
                    Some(request.tag),
                    Some(request.address),
                    format!("id {} is still in use", assigned),
                );
                self.fail(err, sched);
                return;
            }
            state.entries[assigned] = Some(RobEntry {
                original_id: request.id,
                tag: request.tag,
                expected,
                received: 0,
                released: 0,
                buffered: VecDeque::new(),
            });
            state.outstanding += 1;
            state.request_counter = (assigned + 1) % num_entries;
            state.open.insert(request.tag, assigned);
            assigned
        } else {
            state.open[&request.tag]
        };
        if request.last_transfer {
            state.open.remove(&request.tag);
        }
        let mut forwarded = request;
        forwarded.id = assigned as u32;
        log::trace!("{}: forwarding {}", self.name, forwarded);
        let delay = self.config.request_delay * self.clock_period;
        self.downstream.push(forwarded, delay, sched);
    }

    fn nb_peek(&mut self, _port: usize, address: u64, buffer: &mut [u8]) -> Result<(), Error> {
        self.downstream.link()?.nb_peek(address, buffer)
    }

    fn nb_poke(&mut self, _port: usize, address: u64, data: &[u8]) -> Result<(), Error> {
        self.downstream.link()?.nb_poke(address, data)
    }

    fn bind_upstream(&mut self, port: usize, link: ResponseLink) -> Result<(), Error> {
        if port != 0 {
            return Err(Error::InvalidPort(port));
        }
        self.upstream.bind(link)
    }
}

impl ResponseSink for ReorderBuffer {
    fn nb_respond(&mut self, _port: usize, response: Response, sched: &mut Scheduler) -> bool {
        if response.status.is_nacc() {
            if !self.downstream.on_nacc(&response) {
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
        let lane = Lane::of(response.request_type);
        let id = response.id as usize;
        let known = self
            .lane_mut(lane)
            .entries
            .get_mut(id)
            .and_then(|entry| entry.as_mut())
            .filter(|entry| entry.received < entry.expected);
        match known {
            Some(entry) => {
                entry.received += 1;
                // An early error response may end a read short.
                if response.last_transfer {
                    entry.expected = entry.received;
                }
                entry.buffered.push_back(response);
                sched.notify(self.id, DRAIN, 0);
            }
            None => {
                let err = Error::protocol(
                    &self.name,
                    Some(response.tag),
                    Some(response.address),
                    format!("unknown response id {}", id),
                );
                self.fail(err, sched);
            }
        }
        true
    }

    fn bind_downstream(&mut self, port: usize, link: RequestLink) -> Result<(), Error> {
        if port != 0 {
            return Err(Error::InvalidPort(port));
        }
        self.downstream.bind(link)
    }
}

impl Module for ReorderBuffer {
    fn id(&self) -> ModuleId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn wake(&mut self, process: ProcessId, sched: &mut Scheduler) -> Result<(), Error> {
        match process {
            DOWNSTREAM => self.downstream.wake(sched).map(|_| ()),
            UPSTREAM => self.upstream.wake(sched).map(|_| ()),
            DRAIN => {
                self.drain(sched);
                Ok(())
            }
            FAULT => match self.fault.take() {
                Some(err) => Err(err),
                None => Ok(()),
            },
            _ => Err(Error::protocol(&self.name, None, None, format!("no process {}", process))),
        }
    }

    fn command(&mut self, words: &[&str], _sched: &mut Scheduler) -> Result<String, Error> {
        match words {
            ["dump_statistic_info"] => {
                let (rq, rs) = self.counters(Lane::Read);
                let (wq, ws) = self.counters(Lane::Write);
                Ok(format!(
                    "read: request_counter={} response_counter={} outstanding={}\n\
                     write: request_counter={} response_counter={} outstanding={}\n\
                     naccs={} retries={}",
                    rq,
                    rs,
                    self.outstanding(Lane::Read),
                    wq,
                    ws,
                    self.outstanding(Lane::Write),
                    self.naccs,
                    self.downstream.retries()
                ))
            }
            _ => Err(Error::UnknownCommand(words.join(" "))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MasterConfig, MemoryConfig};
    use crate::master::Master;
    use crate::memory::Memory;
    use crate::protocol::Status;
    use crate::sim::Kernel;
    use itertools::Itertools;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Answers the first `pass` requests as they come, then holds batches
    /// of `order.len()` and answers each batch in the given order.
    struct Shuffler {
        id: ModuleId,
        order: Vec<usize>,
        pass: usize,
        held: Vec<Request>,
        responses: ResponseIssuer,
    }

    impl Shuffler {
        fn answer(&mut self, request: &Request, fill: u8, sched: &mut Scheduler) {
            for beat in 0..request.num_transfers {
                let response = Response::new(request, Status::Ok)
                    .with_beat(beat + 1, beat + 1 == request.num_transfers)
                    .with_data(vec![fill; request.size as usize]);
                self.responses.push(response, 1000, sched);
            }
        }
    }

    impl Module for Shuffler {
        fn id(&self) -> ModuleId {
            self.id
        }
        fn name(&self) -> &str {
            "shuffler"
        }
        fn wake(&mut self, _: ProcessId, sched: &mut Scheduler) -> Result<(), Error> {
            self.responses.wake(sched).map(|_| ())
        }
    }

    impl RequestSink for Shuffler {
        fn nb_request(&mut self, _: usize, request: Request, sched: &mut Scheduler) {
            if self.pass > 0 {
                self.pass -= 1;
                self.answer(&request, 0, sched);
                return;
            }
            self.held.push(request);
            if self.held.len() == self.order.len() {
                let held = std::mem::take(&mut self.held);
                for i in self.order.clone() {
                    self.answer(&held[i], i as u8, sched);
                }
            }
        }
        fn bind_upstream(&mut self, _: usize, link: ResponseLink) -> Result<(), Error> {
            self.responses.bind(link)
        }
    }

    fn master(kernel: &mut Kernel) -> Rc<RefCell<Master>> {
        kernel
            .add_module(|id, ctx| Master::new(id, "master", ctx, MasterConfig::default()))
            .unwrap()
    }

    fn rob(kernel: &mut Kernel, config: ReorderBufferConfig) -> Rc<RefCell<ReorderBuffer>> {
        kernel
            .add_module(|id, ctx| ReorderBuffer::new(id, "rob", ctx, config))
            .unwrap()
    }

    fn shuffler(kernel: &mut Kernel, order: Vec<usize>, pass: usize) -> Rc<RefCell<Shuffler>> {
        kernel
            .add_module(|id, ctx| {
                Ok(Shuffler {
                    id,
                    order,
                    pass,
                    held: vec![],
                    responses: ResponseIssuer::new("shuffler", id, 0, 0, ctx.clock_period),
                })
            })
            .unwrap()
    }

    #[test]
    fn test_permuted_completion_is_released_in_order() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let mut kernel = Kernel::new(SimContext::default());
        let m = master(&mut kernel);
        let r = rob(
            &mut kernel,
            ReorderBufferConfig {
                request_fifo_depth: 8,
                ..Default::default()
            },
        );
        let s = shuffler(&mut kernel, vec![3, 0, 5, 1, 4, 2], 0);
        kernel.connect(&m, 0, &r, 0).unwrap();
        kernel.connect(&r, 0, &s, 0).unwrap();
        let tags = {
            let mut m = m.borrow_mut();
            (0..6)
                .map(|i| {
                    let request = if i % 2 == 0 {
                        Request::block_read(0x1000 * i as u64, 8, 2)
                    } else {
                        Request::read(0x1000 * i as u64, 4)
                    };
                    m.issue(0, vec![request.with_id(40 + i)], 0, kernel.scheduler())
                        .unwrap()
                })
                .collect::<Vec<_>>()
        };
        kernel.run_to_completion(1_000_000).unwrap();
        let m = m.borrow();
        let arrival = m
            .responses()
            .iter()
            .map(|(_, _, r)| r.tag)
            .dedup()
            .collect::<Vec<_>>();
        assert_eq!(arrival, tags);
        // Original ids are restored.
        assert!(m
            .responses()
            .iter()
            .all(|(_, _, r)| r.id == 40 + tags.iter().position(|t| *t == r.tag).unwrap() as u32));
        assert_eq!(r.borrow().counters(Lane::Read), (6, 6));
        assert_eq!(r.borrow().outstanding(Lane::Read), 0);
    }

    #[test]
    fn test_every_completion_order_across_the_wrap() {
        for order in (0..4usize).permutations(4) {
            let mut kernel = Kernel::new(SimContext::default());
            let m = master(&mut kernel);
            let r = rob(
                &mut kernel,
                ReorderBufferConfig {
                    request_fifo_depth: 8,
                    ..Default::default()
                },
            );
            // Two in-order answers first, so one batch spans entries 30..34.
            let s = shuffler(&mut kernel, order.clone(), 2);
            kernel.connect(&m, 0, &r, 0).unwrap();
            kernel.connect(&r, 0, &s, 0).unwrap();
            let tags = {
                let mut m = m.borrow_mut();
                (0..38u32)
                    .map(|i| {
                        let request = Request::read(0x40 * i as u64, 4).with_id(i);
                        m.issue(0, vec![request], 0, kernel.scheduler()).unwrap()
                    })
                    .collect::<Vec<_>>()
            };
            kernel.run_to_completion(10_000_000).unwrap();
            let m = m.borrow();
            let arrival = m.responses().iter().map(|(_, _, r)| r.tag).collect::<Vec<_>>();
            assert_eq!(arrival, tags, "completion order {:?}", order);
            assert!(m
                .responses()
                .iter()
                .zip(0u32..)
                .all(|((_, _, r), i)| r.id == i));
            assert_eq!(r.borrow().counters(Lane::Read), (6, 6));
            assert_eq!(r.borrow().outstanding(Lane::Read), 0);
        }
    }

    #[test]
    fn test_counters_wrap_at_num_entries() {
        let mut kernel = Kernel::new(SimContext::default());
        let m = master(&mut kernel);
        let r = rob(&mut kernel, ReorderBufferConfig::default());
        let mem = kernel
            .add_module(|id, ctx| Memory::new(id, "mem", ctx, MemoryConfig::default()))
            .unwrap();
        kernel.connect(&m, 0, &r, 0).unwrap();
        kernel.connect(&r, 0, &mem, 0).unwrap();
        {
            let mut m = m.borrow_mut();
            for i in 0..32u64 {
                m.write(0, i * 4, &[i as u8; 4], kernel.scheduler()).unwrap();
            }
        }
        kernel.run_to_completion(10_000_000).unwrap();
        assert_eq!(r.borrow().counters(Lane::Write), (0, 0));
        {
            let mut m = m.borrow_mut();
            for i in 0..8u64 {
                m.read(0, i * 4, 4, kernel.scheduler()).unwrap();
            }
        }
        kernel.run_to_completion(10_000_000).unwrap();
        assert_eq!(r.borrow().counters(Lane::Read), (8, 8));
        assert_eq!(m.borrow().outstanding(), 0);
        assert_eq!(m.borrow().responses().len(), 40);
    }

    #[test]
    fn test_full_lane_naccs() {
        let mut kernel = Kernel::new(SimContext::default());
        let m = master(&mut kernel);
        let r = rob(
            &mut kernel,
            ReorderBufferConfig {
                request_fifo_depth: 4,
                ..Default::default()
            },
        );
        // Never completes: it waits for 64 requests.
        let s = shuffler(&mut kernel, (0..64).collect(), 0);
        kernel.connect(&m, 0, &r, 0).unwrap();
        kernel.connect(&r, 0, &s, 0).unwrap();
        {
            let mut m = m.borrow_mut();
            for i in 0..33u64 {
                m.read(0, i * 4, 4, kernel.scheduler()).unwrap();
            }
        }
        kernel.run_cycles(200).unwrap();
        assert_eq!(r.borrow().outstanding(Lane::Read), 32);
        assert!(r.borrow().naccs() > 0);
        assert_eq!(s.borrow().held.len(), 32);
        assert!(m.borrow().retries() > 0);
    }

    #[test]
    fn test_unknown_response_id_is_fatal() {
        let mut kernel = Kernel::new(SimContext::default());
        let m = master(&mut kernel);
        let r = rob(&mut kernel, ReorderBufferConfig::default());
        let s = shuffler(&mut kernel, vec![0], 0);
        kernel.connect(&m, 0, &r, 0).unwrap();
        kernel.connect(&r, 0, &s, 0).unwrap();
        let bogus = Response::new(&Request::read(0x60, 4).with_id(7).with_tag(99), Status::Ok);
        r.borrow_mut().nb_respond(0, bogus, kernel.scheduler());
        match kernel.run_to_completion(1_000_000) {
            Err(Error::Protocol { module, tag, .. }) => {
                assert_eq!(module, "rob");
                assert_eq!(tag, Some(99));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bad_num_entries() {
        let result = ReorderBuffer::new(
            ModuleId::from_index(0),
            "rob",
            &SimContext::default(),
            ReorderBufferConfig {
                num_entries: 40,
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }
}
