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

//! A scripted initiator for testbenches and demo systems.

use crate::config::MasterConfig;
use crate::issuer::RequestIssuer;
use crate::protocol::{Request, RequestLink, Response, ResponseSink, Status};
use crate::sim::{Module, ModuleId, ProcessId, Scheduler, SimContext, Time};
use crate::Error;

use std::collections::HashMap;

/// Issues scripted transactions on its master ports and records every
/// response beat it takes.
pub struct Master {
    id: ModuleId,
    name: String,
    issuers: Vec<RequestIssuer>,
    responses: Vec<(Time, usize, Response)>,
    issued_at: HashMap<u64, Time>,
    completed: HashMap<u64, Time>,
    refuse: u32,
    refused: u64,
}

impl Master {
    pub fn new(id: ModuleId, name: &str, ctx: &SimContext, config: MasterConfig) -> Result<Self, Error> {
        if config.num_ports == 0 {
            return Err(Error::config(name, "num_ports must be at least 1"));
        }
        let clock_period = ctx.period_or_default(config.clock_period);
        let issuers = (0..config.num_ports)
            .map(|port| {
                RequestIssuer::new(
                    &format!("{}.port{}", name, port),
                    id,
                    port,
                    port,
                    clock_period,
                    config.nacc_wait_time,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            id,
            name: name.to_string(),
            issuers,
            responses: vec![],
            issued_at: HashMap::new(),
            completed: HashMap::new(),
            refuse: 0,
            refused: 0,
        })
    }

    /// Queues the beats of one transaction on `port`, `delay` from now, under
    /// a fresh tag. Returns the tag.
    pub fn issue(
        &mut self,
        port: usize,
        beats: Vec<Request>,
        delay: Time,
        sched: &mut Scheduler,
    ) -> Result<u64, Error> {
        let issuer = self.issuers.get_mut(port).ok_or(Error::InvalidPort(port))?;
        if beats.is_empty() {
            return Err(Error::InvalidArgument("empty transaction".to_string()));
        }
        let tag = sched.next_tag();
        self.issued_at.insert(tag, sched.now() + delay);
        for beat in beats {
            issuer.push(beat.with_tag(tag), delay, sched);
        }
        Ok(tag)
    }

    pub fn read(&mut self, port: usize, address: u64, size: u32, sched: &mut Scheduler) -> Result<u64, Error> {
        self.issue(port, vec![Request::read(address, size)], 0, sched)
    }

    pub fn write(&mut self, port: usize, address: u64, data: &[u8], sched: &mut Scheduler) -> Result<u64, Error> {
        self.issue(port, vec![Request::write(address, data)], 0, sched)
    }

    /// Refuses the next `count` response beats, as a busy master would.
    pub fn refuse_next(&mut self, count: u32) {
        self.refuse = count;
    }

    pub fn refused(&self) -> u64 {
        self.refused
    }

    pub fn responses(&self) -> &[(Time, usize, Response)] {
        &self.responses
    }

    pub fn responses_for(&self, tag: u64) -> Vec<&Response> {
        self.responses
            .iter()
            .filter(|(_, _, r)| r.tag == tag)
            .map(|(_, _, r)| r)
            .collect()
    }

    /// Response data of `tag`, concatenated in arrival order.
    pub fn data_for(&self, tag: u64) -> Vec<u8> {
        self.responses_for(tag)
            .into_iter()
            .flat_map(|r| r.data.iter().copied())
            .collect()
    }

    /// The most severe status among the response beats of `tag`.
    pub fn status_for(&self, tag: u64) -> Option<Status> {
        self.responses_for(tag)
            .into_iter()
            .map(|r| r.status)
            .fold(None, |acc, s| Some(acc.map_or(s, |a: Status| a.combine(s))))
    }

    pub fn is_complete(&self, tag: u64) -> bool {
        self.completed.contains_key(&tag)
    }

    /// Time from issue to the last response beat.
    pub fn latency(&self, tag: u64) -> Option<Time> {
        Some(self.completed.get(&tag)? - self.issued_at.get(&tag)?)
    }

    pub fn outstanding(&self) -> usize {
        self.issued_at.len() - self.completed.len()
    }

    pub fn retries(&self) -> u64 {
        self.issuers.iter().map(|i| i.retries()).sum()
    }

    pub fn link(&self, port: usize) -> Result<&RequestLink, Error> {
        self.issuers.get(port).ok_or(Error::InvalidPort(port))?.link()
    }
}

impl ResponseSink for Master {
    fn nb_respond(&mut self, port: usize, response: Response, sched: &mut Scheduler) -> bool {
        if response.status.is_nacc() {
            let matched = self
                .issuers
                .get_mut(port)
                .map_or(false, |issuer| issuer.on_nacc(&response));
            if !matched {
                log::warn!("{}: stray NACC {}", self.name, response);
            }
            return true;
        }
        if self.refuse > 0 {
            self.refuse -= 1;
            self.refused += 1;
            return false;
        }
        log::trace!("{}: port {} got {}", self.name, port, response);
        if response.last_transfer {
            self.completed.insert(response.tag, sched.now());
        }
        self.responses.push((sched.now(), port, response));
        true
    }

    fn bind_downstream(&mut self, port: usize, link: RequestLink) -> Result<(), Error> {
        self.issuers
            .get_mut(port)
            .ok_or(Error::InvalidPort(port))?
            .bind(link)
    }
}

impl Module for Master {
    fn id(&self) -> ModuleId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn wake(&mut self, process: ProcessId, sched: &mut Scheduler) -> Result<(), Error> {
        let issuer = self
            .issuers
            .get_mut(process)
            .ok_or_else(|| Error::protocol(&self.name, None, None, format!("no process {}", process)))?;
        issuer.wake(sched).map(|_| ())
    }

    fn command(&mut self, words: &[&str], _sched: &mut Scheduler) -> Result<String, Error> {
        match words {
            ["dump_statistic_info"] => Ok(format!(
                "issued={} completed={} responses={} retries={} refused={}",
                self.issued_at.len(),
                self.completed.len(),
                self.responses.len(),
                self.retries(),
                self.refused
            )),
            _ => Err(Error::UnknownCommand(words.join(" "))),
        }
    }
}
