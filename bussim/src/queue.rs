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

//! A FIFO of fixed-width values shared by producers and consumers.
//!
//! With one producer and one consumer the queue is a plain bounded FIFO and
//! pushed values are visible to the consumer immediately. With more clients
//! every producer owns a one-entry skid buffer and every consumer a
//! one-entry jerk buffer; a delta-cycle arbitration process moves values
//! from skid buffers into the FIFO and from the FIFO into empty jerk
//! buffers, each side starting from a round-robin pointer that advances one
//! client per arbitration.

use crate::config::QueueConfig;
use crate::sim::{Module, ModuleId, ProcessId, Scheduler, Time};
use crate::Error;

use bitvec::prelude::*;
use std::collections::VecDeque;

pub type Value = BitVec<u8, Lsb0>;

const ARBITRATE: ProcessId = 0;

#[derive(Clone, Debug, PartialEq)]
struct Entry {
    value: Value,
    ticket: u64,
    pushed_at: Time,
}

type Listener = (ModuleId, ProcessId);

pub struct Queue {
    id: ModuleId,
    name: String,
    config: QueueConfig,
    fifo: VecDeque<Entry>,
    skid: Vec<Option<Entry>>,
    jerk: Vec<Option<Entry>>,
    producer_rr: usize,
    consumer_rr: usize,
    nonempty_listeners: Vec<Vec<Listener>>,
    nonfull_listeners: Vec<Vec<Listener>>,
    pushed: u64,
    popped: u64,
    max_occupancy: usize,
}

impl Queue {
    pub fn new(id: ModuleId, name: &str, config: QueueConfig) -> Result<Self, Error> {
        if config.depth == 0 {
            return Err(Error::config(name, "depth must be at least 1"));
        }
        if config.num_producers == 0 || config.num_consumers == 0 {
            return Err(Error::config(
                name,
                "num_producers and num_consumers must be at least 1",
            ));
        }
        if config.bit_width == 0 {
            return Err(Error::config(name, "bit_width must be at least 1"));
        }
        Ok(Self {
            id,
            name: name.to_string(),
            fifo: VecDeque::with_capacity(config.depth),
            skid: vec![None; config.num_producers],
            jerk: vec![None; config.num_consumers],
            producer_rr: 0,
            consumer_rr: 0,
            nonempty_listeners: vec![vec![]; config.num_consumers],
            nonfull_listeners: vec![vec![]; config.num_producers],
            pushed: 0,
            popped: 0,
            max_occupancy: 0,
            config,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn is_multi_client(&self) -> bool {
        self.config.num_producers > 1 || self.config.num_consumers > 1
    }

    /// Wakes `process` of `module` in the next delta cycle whenever a value
    /// becomes poppable by `consumer`.
    pub fn add_nonempty_listener(
        &mut self,
        consumer: usize,
        module: ModuleId,
        process: ProcessId,
    ) -> Result<(), Error> {
        self.nonempty_listeners
            .get_mut(consumer)
            .ok_or(Error::InvalidPort(consumer))?
            .push((module, process));
        Ok(())
    }

    /// Wakes `process` of `module` in the next delta cycle whenever
    /// `producer` regains room to push.
    pub fn add_nonfull_listener(
        &mut self,
        producer: usize,
        module: ModuleId,
        process: ProcessId,
    ) -> Result<(), Error> {
        self.nonfull_listeners
            .get_mut(producer)
            .ok_or(Error::InvalidPort(producer))?
            .push((module, process));
        Ok(())
    }

    pub fn can_push(&self, producer: usize) -> bool {
        if producer >= self.config.num_producers {
            return false;
        }
        if self.is_multi_client() {
            self.skid[producer].is_none()
        } else {
            self.fifo.len() < self.config.depth
        }
    }

    /// Pushes `value` and returns its ticket. Fails without side effects if
    /// the producer has no room.
    pub fn push(&mut self, producer: usize, value: Value, sched: &mut Scheduler) -> Result<u64, Error> {
        if producer >= self.config.num_producers {
            return Err(Error::InvalidPort(producer));
        }
        if value.len() != self.config.bit_width {
            return Err(Error::InvalidValueWidth {
                expected: self.config.bit_width,
                actual: value.len(),
            });
        }
        if !self.can_push(producer) {
            return Err(Error::QueueFull(producer));
        }
        let entry = Entry {
            value,
            ticket: sched.next_tag(),
            pushed_at: sched.now(),
        };
        let ticket = entry.ticket;
        log::trace!("{}: producer {} pushed ticket {}", self.name, producer, ticket);
        self.pushed += 1;
        if self.is_multi_client() {
            self.skid[producer] = Some(entry);
            sched.notify(self.id, ARBITRATE, 0);
        } else {
            self.fifo.push_back(entry);
            if self.fifo.len() == 1 {
                Self::notify_all(&self.nonempty_listeners[0], sched);
            }
        }
        self.max_occupancy = self.max_occupancy.max(self.occupancy());
        Ok(ticket)
    }

    pub fn can_pop(&self, consumer: usize) -> bool {
        if consumer >= self.config.num_consumers {
            return false;
        }
        if self.is_multi_client() {
            self.jerk[consumer].is_some()
        } else {
            !self.fifo.is_empty()
        }
    }

    /// Pops the next value for `consumer` with the ticket it was pushed
    /// under.
    pub fn pop(&mut self, consumer: usize, sched: &mut Scheduler) -> Result<(Value, u64), Error> {
        if consumer >= self.config.num_consumers {
            return Err(Error::InvalidPort(consumer));
        }
        let entry = if self.is_multi_client() {
            let entry = self.jerk[consumer]
                .take()
                .ok_or(Error::QueueEmpty(consumer))?;
            sched.notify(self.id, ARBITRATE, 0);
            entry
        } else {
            let was_full = self.fifo.len() == self.config.depth;
            let entry = self.fifo.pop_front().ok_or(Error::QueueEmpty(consumer))?;
            if was_full {
                Self::notify_all(&self.nonfull_listeners[0], sched);
            }
            entry
        };
        log::trace!(
            "{}: consumer {} popped ticket {} after {}",
            self.name,
            consumer,
            entry.ticket,
            sched.now() - entry.pushed_at
        );
        self.popped += 1;
        Ok((entry.value, entry.ticket))
    }

    /// The `nth` value in the central FIFO, oldest first.
    pub fn peek(&self, nth: usize) -> Result<&Value, Error> {
        self.fifo
            .get(nth)
            .map(|entry| &entry.value)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "{}: cannot peek element {} of {}",
                    self.name,
                    nth,
                    self.fifo.len()
                ))
            })
    }

    /// Replaces the `nth` value in the central FIFO; its ticket is kept.
    pub fn poke(&mut self, nth: usize, value: Value) -> Result<(), Error> {
        if value.len() != self.config.bit_width {
            return Err(Error::InvalidValueWidth {
                expected: self.config.bit_width,
                actual: value.len(),
            });
        }
        let len = self.fifo.len();
        let entry = self.fifo.get_mut(nth).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "{}: cannot poke element {} of {}",
                self.name, nth, len
            ))
        })?;
        entry.value = value;
        Ok(())
    }

    /// Values poppable now or after arbitration.
    pub fn num_available(&self) -> usize {
        self.fifo.len() + self.jerk.iter().filter(|j| j.is_some()).count()
    }

    pub fn num_free(&self) -> usize {
        self.config.depth - self.fifo.len()
    }

    /// Every value held, buffers included.
    pub fn occupancy(&self) -> usize {
        self.fifo.len()
            + self.skid.iter().filter(|s| s.is_some()).count()
            + self.jerk.iter().filter(|j| j.is_some()).count()
    }

    pub fn max_occupancy(&self) -> usize {
        self.max_occupancy
    }

    fn notify_all(listeners: &[Listener], sched: &mut Scheduler) {
        for (module, process) in listeners {
            sched.notify(*module, *process, 0);
        }
    }

    fn arbitrate(&mut self, sched: &mut Scheduler) {
        let producers = self.config.num_producers;
        let consumers = self.config.num_consumers;
        for i in 0..producers {
            let p = (self.producer_rr + i) % producers;
            if self.fifo.len() == self.config.depth {
                break;
            }
            if let Some(entry) = self.skid[p].take() {
                self.fifo.push_back(entry);
                Self::notify_all(&self.nonfull_listeners[p], sched);
            }
        }
        for i in 0..consumers {
            let c = (self.consumer_rr + i) % consumers;
            if self.fifo.is_empty() {
                break;
            }
            if self.jerk[c].is_none() {
                self.jerk[c] = self.fifo.pop_front();
                Self::notify_all(&self.nonempty_listeners[c], sched);
            }
        }
        self.producer_rr = (self.producer_rr + 1) % producers;
        self.consumer_rr = (self.consumer_rr + 1) % consumers;
        // Skid buffers blocked by a full FIFO are retried when a pop frees
        // a jerk buffer, which re-arms arbitration.
        let drainable = self.fifo.len() < self.config.depth && self.skid.iter().any(|s| s.is_some());
        let fillable = !self.fifo.is_empty() && self.jerk.iter().any(|j| j.is_none());
        if drainable || fillable {
            sched.notify(self.id, ARBITRATE, 0);
        }
    }

    pub fn reset(&mut self) {
        self.fifo.clear();
        self.skid.iter_mut().for_each(|s| *s = None);
        self.jerk.iter_mut().for_each(|j| *j = None);
        self.producer_rr = 0;
        self.consumer_rr = 0;
        self.pushed = 0;
        self.popped = 0;
        self.max_occupancy = 0;
    }
}

impl Module for Queue {
    fn id(&self) -> ModuleId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn wake(&mut self, process: ProcessId, sched: &mut Scheduler) -> Result<(), Error> {
        match process {
            ARBITRATE => {
                self.arbitrate(sched);
                Ok(())
            }
            _ => Err(Error::protocol(
                &self.name,
                None,
                None,
                format!("no process {}", process),
            )),
        }
    }

    fn command(&mut self, words: &[&str], _sched: &mut Scheduler) -> Result<String, Error> {
        match words {
            ["num_available"] => Ok(self.num_available().to_string()),
            ["num_free"] => Ok(self.num_free().to_string()),
            ["peek", nth] => {
                let nth = nth
                    .parse::<usize>()
                    .map_err(|_| Error::InvalidArgument(nth.to_string()))?;
                let value = self.peek(nth)?;
                Ok(value
                    .iter()
                    .rev()
                    .map(|b| if *b { '1' } else { '0' })
                    .collect())
            }
            ["dump_statistic_info"] => Ok(format!(
                "pushed={} popped={} max_occupancy={}",
                self.pushed, self.popped, self.max_occupancy
            )),
            ["reset"] => {
                self.reset();
                Ok(String::new())
            }
            _ => Err(Error::UnknownCommand(words.join(" "))),
        }
    }
}
