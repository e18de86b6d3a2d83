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

//! The discrete-event kernel every bus device runs on.
//!
//! Devices are cooperative processes: a device registers with the
//! [`Kernel`], and each of its processes sleeps until it is notified, either
//! after a delay in simulated time or in the next delta cycle. Exactly one
//! process runs at a time, in `(time, delta, sequence)` order, so mutation
//! never needs a lock.
//!
//! Notifications follow event semantics: if a process already has a pending
//! wakeup earlier than (or equal to) the requested one, the new request is
//! dropped; a strictly earlier request replaces the pending one.

use crate::netlist::Netlist;
use crate::protocol::{bind, RequestSink, ResponseSink};
use crate::Error;

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;

/// Simulated time in units of the context's time resolution.
pub type Time = u64;

/// Index of a process (an independent thread of control) inside a module.
pub type ProcessId = usize;

/// The default clock period, in time units.
pub const DEFAULT_CLOCK_PERIOD: Time = 1000;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ModuleId(usize);

impl ModuleId {
    #[cfg(test)]
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// Simulation-wide timing parameters handed to every component when it is
/// built.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SimContext {
    /// The system clock period, in time units.
    pub clock_period: Time,
    /// Offset of the first rising clock edge from time zero.
    pub posedge_offset: Time,
    /// Picoseconds per time unit; used for waveform time scales.
    pub time_resolution_ps: u64,
}

impl Default for SimContext {
    fn default() -> Self {
        Self {
            clock_period: DEFAULT_CLOCK_PERIOD,
            posedge_offset: 0,
            time_resolution_ps: 1,
        }
    }
}

impl SimContext {
    /// Resolves a component's optional clock period against the system one.
    pub fn period_or_default(&self, clock_period: Option<Time>) -> Time {
        clock_period.unwrap_or(self.clock_period)
    }

    /// Time of the first rising edge at or after `time`, for a clock with the
    /// given period.
    pub fn next_posedge(&self, time: Time, clock_period: Time) -> Time {
        if time <= self.posedge_offset {
            return self.posedge_offset;
        }
        let since = time - self.posedge_offset;
        let phase = since % clock_period;
        if phase == 0 {
            time
        } else {
            time + clock_period - phase
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct Stamp {
    time: Time,
    delta: u64,
    sequence: u64,
}

impl Stamp {
    fn instant(&self) -> (Time, u64) {
        (self.time, self.delta)
    }
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd)]
struct Wakeup {
    stamp: Stamp,
    module: ModuleId,
    process: ProcessId,
}

/// The event queue and clock shared by all modules.
pub struct Scheduler {
    now: Time,
    delta: u64,
    sequence: u64,
    pending: BinaryHeap<Reverse<Wakeup>>,
    /// The live wakeup of each armed process; heap entries that do not match
    /// are stale and skipped.
    armed: HashMap<(ModuleId, ProcessId), Stamp>,
    last_tag: u64,
}

impl Scheduler {
    fn new() -> Self {
        Self {
            now: 0,
            delta: 0,
            sequence: 0,
            pending: BinaryHeap::new(),
            armed: HashMap::new(),
            last_tag: 0,
        }
    }

    pub fn now(&self) -> Time {
        self.now
    }

    pub fn delta(&self) -> u64 {
        self.delta
    }

    /// Wakes `process` of `module` after `delay`; a zero delay means the next
    /// delta cycle.
    pub fn notify(&mut self, module: ModuleId, process: ProcessId, delay: Time) {
        let stamp = if delay == 0 {
            Stamp {
                time: self.now,
                delta: self.delta + 1,
                sequence: self.sequence,
            }
        } else {
            Stamp {
                time: self.now + delay,
                delta: 0,
                sequence: self.sequence,
            }
        };
        self.sequence += 1;
        if let Some(armed) = self.armed.get(&(module, process)) {
            if armed.instant() <= stamp.instant() {
                return;
            }
        }
        self.armed.insert((module, process), stamp);
        self.pending.push(Reverse(Wakeup {
            stamp,
            module,
            process,
        }));
    }

    /// Wakes `process` of `module` at absolute `time` (next delta if that
    /// time is not in the future).
    pub fn notify_at(&mut self, module: ModuleId, process: ProcessId, time: Time) {
        let delay = time.saturating_sub(self.now);
        self.notify(module, process, delay);
    }

    /// Issues a new, globally unique transaction tag.
    pub fn next_tag(&mut self) -> u64 {
        self.last_tag += 1;
        self.last_tag
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse(head)) = self.pending.peek() {
            match self.armed.get(&(head.module, head.process)) {
                Some(stamp) if *stamp == head.stamp => return,
                _ => {
                    self.pending.pop();
                }
            }
        }
    }

    fn next_instant(&mut self) -> Option<(Time, u64)> {
        self.discard_stale();
        self.pending.peek().map(|Reverse(w)| w.stamp.instant())
    }

    fn pop(&mut self) -> Option<Wakeup> {
        self.discard_stale();
        let Reverse(wakeup) = self.pending.pop()?;
        self.armed.remove(&(wakeup.module, wakeup.process));
        self.now = wakeup.stamp.time;
        self.delta = wakeup.stamp.delta;
        Some(wakeup)
    }

    fn advance_to(&mut self, time: Time) {
        if time > self.now {
            self.now = time;
            self.delta = 0;
        }
    }
}

/// A simulated device.
///
/// `wake` runs one activation of one of the module's processes. Sinks
/// (`nb_request`, `nb_respond`) must only record state and notify the
/// module's own processes; they never call back into their caller.
pub trait Module {
    fn id(&self) -> ModuleId;

    fn name(&self) -> &str;

    /// Called once, before the first wakeup is dispatched.
    fn start(&mut self, _sched: &mut Scheduler) -> Result<(), Error> {
        Ok(())
    }

    fn wake(&mut self, process: ProcessId, sched: &mut Scheduler) -> Result<(), Error>;

    /// Textual command surface; `words[0]` is the command name.
    fn command(&mut self, words: &[&str], _sched: &mut Scheduler) -> Result<String, Error> {
        Err(Error::UnknownCommand(words.join(" ")))
    }
}

pub struct Kernel {
    context: SimContext,
    scheduler: Scheduler,
    modules: Vec<Rc<RefCell<dyn Module>>>,
    names: HashMap<String, ModuleId>,
    netlist: Netlist,
    started: bool,
}

impl Kernel {
    pub fn new(context: SimContext) -> Self {
        Self {
            context,
            scheduler: Scheduler::new(),
            modules: vec![],
            names: HashMap::new(),
            netlist: Netlist::default(),
            started: false,
        }
    }

    pub fn context(&self) -> &SimContext {
        &self.context
    }

    pub fn now(&self) -> Time {
        self.scheduler.now()
    }

    /// Direct access to the event queue, for stimulus injected by a testbench
    /// between runs.
    pub fn scheduler(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Builds a module with a fresh id and registers it.
    pub fn add_module<M, F>(&mut self, build: F) -> Result<Rc<RefCell<M>>, Error>
    where
        M: Module + 'static,
        F: FnOnce(ModuleId, &SimContext) -> Result<M, Error>,
    {
        let id = ModuleId(self.modules.len());
        let module = build(id, &self.context)?;
        let name = module.name().to_string();
        if self.names.contains_key(&name) {
            return Err(Error::config(&name, "duplicate module name"));
        }
        log::debug!("registering module {} as {:?}", name, id);
        let module = Rc::new(RefCell::new(module));
        self.netlist.add_module(id, &name);
        self.names.insert(name, id);
        self.modules.push(Rc::clone(&module) as Rc<RefCell<dyn Module>>);
        if self.started {
            module.borrow_mut().start(&mut self.scheduler)?;
        }
        Ok(module)
    }

    /// Binds `master_port` of `master` to `slave_port` of `slave`.
    pub fn connect<M, S>(
        &mut self,
        master: &Rc<RefCell<M>>,
        master_port: usize,
        slave: &Rc<RefCell<S>>,
        slave_port: usize,
    ) -> Result<(), Error>
    where
        M: Module + ResponseSink + 'static,
        S: Module + RequestSink + 'static,
    {
        let master_id = master.borrow().id();
        let slave_id = slave.borrow().id();
        self.netlist
            .add_binding(master_id, master_port, slave_id, slave_port)?;
        bind(master, master_port, slave, slave_port)
    }

    /// Validates the netlist and starts every module. Implicit on the first
    /// run.
    pub fn elaborate(&mut self) -> Result<(), Error> {
        if self.started {
            return Ok(());
        }
        self.netlist.check()?;
        self.started = true;
        for module in self.modules.clone() {
            module.borrow_mut().start(&mut self.scheduler)?;
        }
        Ok(())
    }

    /// Dispatches one wakeup. Returns false when nothing is pending.
    pub fn step(&mut self) -> Result<bool, Error> {
        self.elaborate()?;
        let wakeup = match self.scheduler.pop() {
            Some(wakeup) => wakeup,
            None => return Ok(false),
        };
        let module = Rc::clone(&self.modules[wakeup.module.index()]);
        let mut module = module.borrow_mut();
        log::trace!(
            "@{} delta {}: waking {} process {}",
            self.scheduler.now(),
            self.scheduler.delta(),
            module.name(),
            wakeup.process
        );
        module
            .wake(wakeup.process, &mut self.scheduler)
            .map_err(|err| {
                log::error!("{} failed at {}: {}", module.name(), self.scheduler.now(), err);
                err
            })?;
        Ok(true)
    }

    /// Runs every delta cycle pending at the current time.
    pub fn settle(&mut self) -> Result<(), Error> {
        let now = self.now();
        self.run_until(now)
    }

    /// Runs all wakeups up to and including `end`, then moves the clock to
    /// `end`.
    pub fn run_until(&mut self, end: Time) -> Result<(), Error> {
        self.elaborate()?;
        while let Some((time, _)) = self.scheduler.next_instant() {
            if time > end {
                break;
            }
            self.step()?;
        }
        self.scheduler.advance_to(end);
        Ok(())
    }

    pub fn run_for(&mut self, duration: Time) -> Result<(), Error> {
        let end = self.now() + duration;
        self.run_until(end)
    }

    pub fn run_cycles(&mut self, cycles: u64) -> Result<(), Error> {
        self.run_for(cycles * self.context.clock_period)
    }

    /// Runs until no wakeup is pending or `limit` is passed. Returns the time
    /// of the last dispatched wakeup.
    pub fn run_to_completion(&mut self, limit: Time) -> Result<Time, Error> {
        self.elaborate()?;
        while let Some((time, _)) = self.scheduler.next_instant() {
            if time > limit {
                log::warn!("simulation stopped at limit {} with work pending", limit);
                break;
            }
            self.step()?;
        }
        Ok(self.now())
    }

    pub fn module(&self, name: &str) -> Option<Rc<RefCell<dyn Module>>> {
        self.names
            .get(name)
            .map(|id| Rc::clone(&self.modules[id.index()]))
    }

    /// Dispatches a textual command line to the named module.
    pub fn command(&mut self, module: &str, line: &str) -> Result<String, Error> {
        let target = self
            .module(module)
            .ok_or_else(|| Error::InvalidArgument(format!("no module named {}", module)))?;
        let words = line.split_whitespace().collect::<Vec<_>>();
        if words.is_empty() {
            return Err(Error::InvalidArgument("empty command".to_string()));
        }
        let mut target = target.borrow_mut();
        target.command(&words, &mut self.scheduler)
    }
}
