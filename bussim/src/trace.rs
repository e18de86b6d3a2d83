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

//! A transparent observer placed between a master and a slave.
//!
//! Every request and response beat passes through unmodified. Along the way
//! the trace keeps per-(port, request type) statistics and, when a
//! `VcdWriter` is attached, a waveform of the beats.

pub mod statistics;

use crate::config::MemoryTraceConfig;
use crate::pool::{Handle, Pool};
use crate::protocol::{
    Ports, Request, RequestLink, RequestSink, RequestType, Response, ResponseLink, ResponseSink,
};
use crate::sim::{Module, ModuleId, ProcessId, Scheduler, SimContext, Time};
use crate::vcd::{VcdComponent, VcdWriter, DEFAULT_TOP_MODULE};
use crate::Error;
use statistics::{round_cycles, Counter, Filter, StatisticsTable};

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

const FAULT: ProcessId = 0;

#[derive(Debug)]
struct TransactionInfo {
    port: usize,
    request_type: RequestType,
    request_begin: Time,
    request_end: Option<Time>,
    response_begin: Option<Time>,
}

pub struct MemoryTrace {
    id: ModuleId,
    name: String,
    config: MemoryTraceConfig,
    system_clock_period: Time,
    clock_period: Time,
    upstream: Ports<ResponseLink>,
    downstream: Ports<RequestLink>,
    infos: Pool<TransactionInfo>,
    open: HashMap<u64, Handle>,
    statistics: StatisticsTable,
    tracing: bool,
    vcd: Option<Rc<RefCell<VcdWriter>>>,
    beats: Vec<(u64, u64)>,
    fault: Option<Error>,
}

fn parse_bool(text: &str) -> Result<bool, Error> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "1" | "on" => Ok(true),
        "false" | "0" | "off" => Ok(false),
        _ => Err(Error::InvalidArgument(format!("not a boolean: {}", text))),
    }
}

impl MemoryTrace {
    pub fn new(
        id: ModuleId,
        name: &str,
        ctx: &SimContext,
        config: MemoryTraceConfig,
    ) -> Result<Self, Error> {
        if config.num_ports == 0 {
            return Err(Error::config(name, "num_ports must be at least 1"));
        }
        let clock_period = ctx.period_or_default(config.clock_period);
        if clock_period == 0 {
            return Err(Error::config(name, "clock period must be positive"));
        }
        Ok(Self {
            id,
            name: name.to_string(),
            system_clock_period: ctx.clock_period,
            clock_period,
            upstream: Ports::new(name, config.num_ports),
            downstream: Ports::new(name, config.num_ports),
            infos: Pool::new(),
            open: HashMap::new(),
            statistics: StatisticsTable::default(),
            tracing: config.enable_tracing,
            vcd: None,
            beats: vec![(0, 0); config.num_ports],
            fault: None,
            config,
        })
    }

    /// Records waveforms into `writer`. Its header must declare this trace
    /// as a `VcdComponent`.
    pub fn attach_vcd(&mut self, writer: Rc<RefCell<VcdWriter>>) {
        self.vcd = Some(writer);
    }

    pub fn statistics(&self) -> &StatisticsTable {
        &self.statistics
    }

    pub fn clock_period(&self) -> Time {
        self.clock_period
    }

    /// Transactions whose last response beat has not been accepted yet.
    pub fn in_flight(&self) -> usize {
        self.infos.len()
    }

    fn fail(&mut self, err: Error, sched: &mut Scheduler) {
        log::error!("{}", err);
        if self.fault.is_none() {
            self.fault = Some(err);
        }
        sched.notify(self.id, FAULT, 0);
    }

    fn open_transaction(&mut self, port: usize, request: &Request, now: Time) {
        let handle = match self.open.get(&request.tag) {
            Some(handle) => *handle,
            None => {
                let handle = self.infos.acquire(TransactionInfo {
                    port,
                    request_type: request.request_type,
                    request_begin: now,
                    request_end: None,
                    response_begin: None,
                });
                self.open.insert(request.tag, handle);
                handle
            }
        };
        if request.last_transfer {
            if let Some(info) = self.infos.get_mut(handle) {
                info.request_end = Some(now);
            }
        }
    }

    fn close_transaction(&mut self, response: &Response, now: Time) {
        let handle = match self.open.get(&response.tag) {
            Some(handle) => *handle,
            None => {
                log::warn!("{}: response for unknown tag {}", self.name, response.tag);
                return;
            }
        };
        if let Some(info) = self.infos.get_mut(handle) {
            info.response_begin.get_or_insert(now);
        }
        if !response.last_transfer {
            return;
        }
        self.open.remove(&response.tag);
        if let Some(info) = self.infos.release(handle) {
            let request_end = info.request_end.unwrap_or(info.request_begin);
            let response_begin = info.response_begin.unwrap_or(now);
            let latency = round_cycles(response_begin.saturating_sub(request_end), self.clock_period);
            let lifetime = round_cycles(now.saturating_sub(info.request_begin), self.clock_period);
            log::trace!(
                "{}: tag {} closed: latency {} lifetime {}",
                self.name,
                response.tag,
                latency,
                lifetime
            );
            if self.config.track_statistics {
                self.statistics
                    .entry(info.port, info.request_type)
                    .complete(response.tag, latency, lifetime);
            }
        }
    }

    fn vcd_writer(&self) -> Option<Rc<RefCell<VcdWriter>>> {
        match (&self.vcd, self.tracing) {
            (Some(writer), true) => Some(Rc::clone(writer)),
            _ => None,
        }
    }

    fn trace_request(&self, port: usize, request: &Request, now: Time) {
        let writer = match self.vcd_writer() {
            Some(writer) => writer,
            None => return,
        };
        let _top = VcdWriter::managed_trace_scope(Rc::clone(&writer), DEFAULT_TOP_MODULE);
        let _trace = VcdWriter::managed_trace_scope(Rc::clone(&writer), &self.name);
        let _port = VcdWriter::managed_trace_scope(Rc::clone(&writer), &format!("port{}", port));
        let mut w = writer.borrow_mut();
        w.enter_time(now);
        w.change_vector_immediately("request_type", request.request_type as u64);
        w.change_vector_immediately("request_address", request.address);
        w.change_vector_immediately("request_tag", request.tag);
        w.change_vector_immediately("request_valid", 1);
        w.change_vector("request_valid", 0);
        w.change_vector_immediately("requests", self.beats[port].0);
    }

    fn trace_response(&self, port: usize, response: &Response, now: Time) {
        let writer = match self.vcd_writer() {
            Some(writer) => writer,
            None => return,
        };
        let _top = VcdWriter::managed_trace_scope(Rc::clone(&writer), DEFAULT_TOP_MODULE);
        let _trace = VcdWriter::managed_trace_scope(Rc::clone(&writer), &self.name);
        let _port = VcdWriter::managed_trace_scope(Rc::clone(&writer), &format!("port{}", port));
        let mut w = writer.borrow_mut();
        w.enter_time(now);
        w.change_vector_immediately("response_status", response.status as u64);
        w.change_vector_immediately("response_tag", response.tag);
        w.change_vector_immediately("response_valid", 1);
        w.change_vector("response_valid", 0);
        w.change_vector_immediately("responses", self.beats[port].1);
    }

    fn filter(&self, types: &str, ports: &str) -> Result<Filter, Error> {
        Filter::parse(types, ports, self.config.num_ports)
    }
}

impl RequestSink for MemoryTrace {
    fn nb_request(&mut self, port: usize, request: Request, sched: &mut Scheduler) {
        let link = match self.downstream.get(port) {
            Ok(link) => link.clone(),
            Err(err) => {
                self.fail(err, sched);
                return;
            }
        };
        let now = sched.now();
        if self.config.track_statistics {
            self.statistics
                .entry(port, request.request_type)
                .request_beats += 1;
        }
        self.beats[port].0 += 1;
        self.open_transaction(port, &request, now);
        self.trace_request(port, &request, now);
        log::trace!("{}: port {} request {}", self.name, port, request);
        link.nb_request(request, sched);
    }

    fn nb_peek(&mut self, port: usize, address: u64, buffer: &mut [u8]) -> Result<(), Error> {
        self.downstream.get(port)?.nb_peek(address, buffer)
    }

    fn nb_poke(&mut self, port: usize, address: u64, data: &[u8]) -> Result<(), Error> {
        self.downstream.get(port)?.nb_poke(address, data)
    }

    fn bind_upstream(&mut self, port: usize, link: ResponseLink) -> Result<(), Error> {
        self.upstream.bind(port, link)
    }
}

impl ResponseSink for MemoryTrace {
    fn nb_respond(&mut self, port: usize, response: Response, sched: &mut Scheduler) -> bool {
        let link = match self.upstream.get(port) {
            Ok(link) => link.clone(),
            Err(err) => {
                self.fail(err, sched);
                return false;
            }
        };
        let now = sched.now();
        let request_type = response.request_type;
        if response.status.is_nacc() {
            if self.config.track_statistics {
                self.statistics.entry(port, request_type).request_busys += 1;
            }
            return link.nb_respond(response, sched);
        }
        if !link.nb_respond(response.clone(), sched) {
            if self.config.track_statistics {
                self.statistics.entry(port, request_type).response_busys += 1;
            }
            return false;
        }
        if self.config.track_statistics {
            self.statistics.entry(port, request_type).response_beats += 1;
        }
        self.beats[port].1 += 1;
        self.trace_response(port, &response, now);
        self.close_transaction(&response, now);
        true
    }

    fn bind_downstream(&mut self, port: usize, link: RequestLink) -> Result<(), Error> {
        self.downstream.bind(port, link)
    }
}

impl Module for MemoryTrace {
    fn id(&self) -> ModuleId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn wake(&mut self, _process: ProcessId, _sched: &mut Scheduler) -> Result<(), Error> {
        match self.fault.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn command(&mut self, words: &[&str], _sched: &mut Scheduler) -> Result<String, Error> {
        match words {
            ["dump_statistic_info"] => Ok(self.statistics.to_string()),
            ["get_counter", name, types, ports] => {
                let counter = Counter::from_name(name)?;
                let filter = self.filter(types, ports)?;
                Ok(self.statistics.counter(counter, &filter).to_string())
            }
            ["dump_latency_histogram", types, ports] => {
                let filter = self.filter(types, ports)?;
                Ok(self.statistics.latency_histogram(&filter).to_string())
            }
            ["dump_lifetime_histogram", types, ports] => {
                let filter = self.filter(types, ports)?;
                Ok(self.statistics.lifetime_histogram(&filter).to_string())
            }
            ["enable_tracing", value] => {
                let previous = self.tracing;
                self.tracing = parse_bool(value)?;
                Ok(previous.to_string())
            }
            ["reset"] => {
                self.statistics.clear();
                Ok(String::new())
            }
            ["reset", hard] => {
                self.statistics.clear();
                if parse_bool(hard)? {
                    self.infos.clear();
                    self.open.clear();
                    self.beats.iter_mut().for_each(|b| *b = (0, 0));
                }
                Ok(String::new())
            }
            ["change_clock_period", factor] => {
                let factor = factor
                    .parse::<u64>()
                    .ok()
                    .filter(|f| *f > 0)
                    .ok_or_else(|| Error::InvalidArgument(format!("bad factor {}", factor)))?;
                let previous = self.clock_period;
                self.clock_period = self.system_clock_period * factor;
                log::debug!(
                    "{}: clock period {} -> {}",
                    self.name,
                    previous,
                    self.clock_period
                );
                Ok(previous.to_string())
            }
            _ => Err(Error::UnknownCommand(words.join(" "))),
        }
    }
}

impl VcdComponent for MemoryTrace {
    fn vcd_write_scope(&self, writer: Rc<RefCell<VcdWriter>>) {
        let _scope = VcdWriter::managed_decl_scope(Rc::clone(&writer), &self.name);
        for port in 0..self.config.num_ports {
            let _port = VcdWriter::managed_decl_scope(Rc::clone(&writer), &format!("port{}", port));
            let mut w = writer.borrow_mut();
            w.add_wire(4, "request_type");
            w.add_wire(64, "request_address");
            w.add_wire(64, "request_tag");
            w.add_wire(1, "request_valid");
            w.add_wire(4, "response_status");
            w.add_wire(64, "response_tag");
            w.add_wire(1, "response_valid");
            w.add_integer_var::<u64>("requests");
            w.add_integer_var::<u64>("responses");
        }
    }

    fn vcd_init(&self, writer: Rc<RefCell<VcdWriter>>) {
        let _scope = VcdWriter::managed_trace_scope(Rc::clone(&writer), &self.name);
        for port in 0..self.config.num_ports {
            let _port = VcdWriter::managed_trace_scope(Rc::clone(&writer), &format!("port{}", port));
            let mut w = writer.borrow_mut();
            w.change_undefined_immediately("request_type");
            w.change_undefined_immediately("request_address");
            w.change_undefined_immediately("request_tag");
            w.change_vector_immediately("request_valid", 0);
            w.change_undefined_immediately("response_status");
            w.change_undefined_immediately("response_tag");
            w.change_vector_immediately("response_valid", 0);
            w.change_vector_immediately("requests", 0);
            w.change_vector_immediately("responses", 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::statistics::Histogram;
    use super::*;
    use crate::config::{MasterConfig, MemoryConfig};
    use crate::master::Master;
    use crate::memory::Memory;
    use crate::sim::Kernel;
    use crate::vcd::tests::SharedBuffer;

    struct Bench {
        kernel: Kernel,
        master: Rc<RefCell<Master>>,
        trace: Rc<RefCell<MemoryTrace>>,
        memory: Rc<RefCell<Memory>>,
    }

    fn bench(num_ports: usize, memory: MemoryConfig) -> Bench {
        let mut kernel = Kernel::new(SimContext::default());
        let master = kernel
            .add_module(|id, ctx| {
                Master::new(
                    id,
                    "master",
                    ctx,
                    MasterConfig {
                        num_ports,
                        ..Default::default()
                    },
                )
            })
            .unwrap();
        let trace = kernel
            .add_module(|id, ctx| {
                MemoryTrace::new(
                    id,
                    "trace",
                    ctx,
                    MemoryTraceConfig {
                        num_ports,
                        ..Default::default()
                    },
                )
            })
            .unwrap();
        let memory = kernel
            .add_module(|id, ctx| {
                Memory::new(
                    id,
                    "mem",
                    ctx,
                    MemoryConfig {
                        num_ports,
                        ..memory
                    },
                )
            })
            .unwrap();
        for port in 0..num_ports {
            kernel.connect(&master, port, &trace, port).unwrap();
            kernel.connect(&trace, port, &memory, port).unwrap();
        }
        Bench {
            kernel,
            master,
            trace,
            memory,
        }
    }

    fn run_mixed_traffic(b: &mut Bench) -> Vec<u64> {
        let mut tags = vec![];
        {
            let mut m = b.master.borrow_mut();
            let sched = b.kernel.scheduler();
            for i in 0..6u64 {
                let port = (i % 2) as usize;
                tags.push(m.write(port, 0x100 + 8 * i, &[i as u8; 8], sched).unwrap());
                tags.push(m.read(port, 0x100 + 8 * i, 8, sched).unwrap());
                tags.push(
                    m.issue(port, vec![Request::block_read(0x200, 8, 4)], 0, sched)
                        .unwrap(),
                );
            }
        }
        b.kernel.run_to_completion(10_000_000).unwrap();
        tags
    }

    #[test]
    fn test_pass_through_is_transparent() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let mut b = bench(2, MemoryConfig::default());
        let tags = run_mixed_traffic(&mut b);
        let m = b.master.borrow();
        for tag in &tags {
            assert!(m.is_complete(*tag));
        }
        assert_eq!(m.data_for(tags[1]), vec![0; 8]);
        assert_eq!(m.data_for(tags[4]), vec![1; 8]);
        assert_eq!(b.trace.borrow().in_flight(), 0);
    }

    #[test]
    fn test_histograms_sum_to_transactions() {
        let mut b = bench(2, MemoryConfig::default());
        let tags = run_mixed_traffic(&mut b);
        let trace = b.trace.borrow();
        let table = trace.statistics();
        let all = Filter::all();
        assert_eq!(table.counter(Counter::Transactions, &all), tags.len() as u64);
        assert_eq!(table.latency_histogram(&all).total(), tags.len() as u64);
        assert_eq!(table.lifetime_histogram(&all).total(), tags.len() as u64);
        for port in 0..2 {
            for request_type in RequestType::ALL {
                let filter = Filter::parse(request_type.name(), &port.to_string(), 2).unwrap();
                let transactions = table.counter(Counter::Transactions, &filter);
                assert_eq!(table.latency_histogram(&filter).total(), transactions);
                assert_eq!(table.lifetime_histogram(&filter).total(), transactions);
            }
        }
        // Block reads carry four response beats each.
        let block_reads = Filter::parse("BLOCK_READ", "*", 2).unwrap();
        assert_eq!(table.counter(Counter::ResponseBeats, &block_reads), 24);
    }

    #[test]
    fn test_wildcard_equals_union() {
        let mut b = bench(2, MemoryConfig::default());
        run_mixed_traffic(&mut b);
        let mut union = Histogram::default();
        {
            let trace = b.trace.borrow();
            for request_type in RequestType::ALL {
                let filter = Filter::parse(request_type.name(), "*", 2).unwrap();
                union.merge(&trace.statistics().latency_histogram(&filter));
            }
        }
        let dumped = b
            .kernel
            .command("trace", "dump_latency_histogram * *")
            .unwrap();
        assert_eq!(dumped, union.to_string());
        assert!(!dumped.is_empty());
        let by_port = b
            .kernel
            .command("trace", "dump_latency_histogram * 0,1")
            .unwrap();
        assert_eq!(by_port, dumped);
    }

    fn counter(kernel: &mut Kernel, name: &str) -> u64 {
        kernel
            .command("trace", &format!("get_counter {} * *", name))
            .unwrap()
            .parse::<u64>()
            .unwrap()
    }

    #[test]
    fn test_refused_response_counts_as_busy() {
        let mut b = bench(1, MemoryConfig::default());
        let tag = {
            let mut m = b.master.borrow_mut();
            m.refuse_next(1);
            m.read(0, 0x40, 4, b.kernel.scheduler()).unwrap()
        };
        b.kernel.run_to_completion(1_000_000).unwrap();
        assert_eq!(b.master.borrow().latency(tag), Some(2000));
        assert_eq!(counter(&mut b.kernel, "response_busys"), 1);
        assert_eq!(counter(&mut b.kernel, "response_beats"), 1);
        assert_eq!(counter(&mut b.kernel, "latency_sum"), 2);
        assert_eq!(counter(&mut b.kernel, "max_lifetime"), 2);
    }

    #[test]
    fn test_naccs_count_as_request_busys() {
        // The memory serves every other master clock.
        let mut b = bench(
            1,
            MemoryConfig {
                request_fifo_depth: 1,
                clock_period: Some(2000),
                ..Default::default()
            },
        );
        {
            let mut m = b.master.borrow_mut();
            for i in 0..4 {
                m.read(0, 0x40 + 4 * i, 4, b.kernel.scheduler()).unwrap();
            }
        }
        b.kernel.run_to_completion(10_000_000).unwrap();
        let naccs = b.memory.borrow().naccs();
        assert!(naccs > 0);
        assert_eq!(counter(&mut b.kernel, "request_busys"), naccs);
        assert_eq!(counter(&mut b.kernel, "request_beats"), 4 + naccs);
        assert_eq!(counter(&mut b.kernel, "transactions"), 4);
        assert_eq!(b.master.borrow().retries(), naccs);
    }

    #[test]
    fn test_commands() {
        let mut b = bench(1, MemoryConfig::default());
        let tag = {
            let mut m = b.master.borrow_mut();
            m.read(0, 0x40, 4, b.kernel.scheduler()).unwrap()
        };
        b.kernel.run_to_completion(1_000_000).unwrap();
        assert_eq!(b.master.borrow().latency(tag), Some(1000));
        assert_eq!(
            b.kernel.command("trace", "dump_latency_histogram READ 0").unwrap(),
            "1: 1"
        );
        assert_eq!(
            b.kernel.command("trace", "change_clock_period 4").unwrap(),
            "1000"
        );
        assert_eq!(b.trace.borrow().clock_period(), 4000);
        assert_eq!(b.kernel.command("trace", "reset").unwrap(), "");
        assert_eq!(
            b.kernel.command("trace", "get_counter transactions * *").unwrap(),
            "0"
        );
        assert_eq!(b.kernel.command("trace", "enable_tracing false").unwrap(), "true");
        assert!(b.kernel.command("trace", "get_counter transactions FOO *").is_err());
        assert!(b.kernel.command("trace", "dump_lifetime_histogram * 3").is_err());
        assert!(b.kernel.command("trace", "frobnicate").is_err());
        {
            let mut m = b.master.borrow_mut();
            m.read(0, 0x40, 4, b.kernel.scheduler()).unwrap();
        }
        b.kernel.run_to_completion(10_000_000).unwrap();
        // One cycle at the old period rounds to zero at the new one.
        assert_eq!(
            b.kernel.command("trace", "dump_lifetime_histogram * *").unwrap(),
            "0: 1"
        );
    }

    #[test]
    fn test_vcd_waveform() {
        let mut b = bench(1, MemoryConfig::default());
        let buffer = SharedBuffer::default();
        let writer = Rc::new(RefCell::new(VcdWriter::new(Box::new(buffer.clone()))));
        {
            let trace = b.trace.borrow();
            VcdWriter::write_header(Rc::clone(&writer), 1000, &[&*trace]);
        }
        b.trace.borrow_mut().attach_vcd(Rc::clone(&writer));
        {
            let mut m = b.master.borrow_mut();
            m.write(0, 0x80, &[7; 4], b.kernel.scheduler()).unwrap();
        }
        let end = b.kernel.run_to_completion(1_000_000).unwrap();
        writer.borrow_mut().flush_after_simulation(end);
        assert!(!writer.borrow().is_error_state());
        let text = buffer.text();
        assert!(text.contains("$scope module trace $end"), "{}", text);
        assert!(text.contains("$scope module port0 $end"));
        assert!(text.contains("request_valid"));
        assert!(text.contains("#1000"));
        assert!(text.contains("#1001"));
    }
}
