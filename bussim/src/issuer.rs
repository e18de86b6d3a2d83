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

//! Port drivers shared by every device.
//!
//! A [`RequestIssuer`] owns one master port: it sends at most one request
//! beat per clock period, then holds the beat for the NACC window. A NACC
//! received inside the window makes it resend the identical beat; a window
//! that closes quietly means the beat was accepted. A [`ResponseIssuer`]
//! owns one slave port and sends at most one response beat per clock
//! period, retrying a clock later when the master is busy.
//!
//! Both run on a process of their owning module: the owner forwards
//! wakeups of that process to `wake`.

use crate::protocol::{Request, RequestLink, Response, ResponseLink};
use crate::sim::{ModuleId, ProcessId, Scheduler, Time};
use crate::Error;

use std::collections::VecDeque;

#[derive(Debug)]
struct Window {
    request: Request,
    closes: (Time, u64),
    nacced: bool,
}

fn arm(owner: ModuleId, process: ProcessId, at: (Time, u64), sched: &mut Scheduler) {
    if at.0 > sched.now() {
        sched.notify_at(owner, process, at.0);
    } else {
        sched.notify(owner, process, 0);
    }
}

#[derive(Debug)]
pub struct RequestIssuer {
    name: String,
    owner: ModuleId,
    process: ProcessId,
    port: usize,
    clock_period: Time,
    nacc_wait: Time,
    link: Option<RequestLink>,
    queue: VecDeque<(Time, Request)>,
    retry: Option<Request>,
    window: Option<Window>,
    next_send: Time,
    sent: u64,
    retries: u64,
}

impl RequestIssuer {
    /// `nacc_wait` defaults to the clock period and may not exceed it.
    pub fn new(
        name: &str,
        owner: ModuleId,
        process: ProcessId,
        port: usize,
        clock_period: Time,
        nacc_wait: Option<Time>,
    ) -> Result<Self, Error> {
        let nacc_wait = nacc_wait.unwrap_or(clock_period);
        if nacc_wait > clock_period {
            return Err(Error::config(
                name,
                format!(
                    "nacc_wait_time {} exceeds clock period {}",
                    nacc_wait, clock_period
                ),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            owner,
            process,
            port,
            clock_period,
            nacc_wait,
            link: None,
            queue: VecDeque::new(),
            retry: None,
            window: None,
            next_send: 0,
            sent: 0,
            retries: 0,
        })
    }

    pub fn bind(&mut self, link: RequestLink) -> Result<(), Error> {
        if self.link.is_some() {
            return Err(Error::AlreadyBound {
                module: self.name.clone(),
                port: self.port,
            });
        }
        self.link = Some(link);
        Ok(())
    }

    /// The downstream link, for debug accesses.
    pub fn link(&self) -> Result<&RequestLink, Error> {
        self.link.as_ref().ok_or_else(|| Error::UnboundPort {
            module: self.name.clone(),
            port: self.port,
        })
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    /// Queues `request` to go out no earlier than `delay` from now.
    pub fn push(&mut self, request: Request, delay: Time, sched: &mut Scheduler) {
        let ready = sched.now() + delay;
        self.queue.push_back((ready, request));
        if self.window.is_none() && self.retry.is_none() && self.queue.len() == 1 {
            let at = ready.max(self.next_send);
            arm(self.owner, self.process, (at, 0), sched);
        }
    }

    /// Marks the beat in the window as rejected. Returns false if `response`
    /// is not a NACC for that beat.
    pub fn on_nacc(&mut self, response: &Response) -> bool {
        match self.window.as_mut() {
            Some(window)
                if response.status.is_nacc()
                    && window.request.tag == response.tag
                    && window.request.transfer_number == response.transfer_number =>
            {
                log::trace!("{}: NACC for {}", self.name, window.request);
                window.nacced = true;
                true
            }
            _ => false,
        }
    }

    /// Closes an expired window and sends the next beat if one is due.
    /// Returns the beat whose window closed without a NACC.
    pub fn wake(&mut self, sched: &mut Scheduler) -> Result<Option<Request>, Error> {
        if let Some(window) = &self.window {
            if (sched.now(), sched.delta()) < window.closes {
                arm(self.owner, self.process, window.closes, sched);
                return Ok(None);
            }
        }
        let mut accepted = None;
        if let Some(window) = self.window.take() {
            if window.nacced {
                self.retries += 1;
                self.retry = Some(window.request);
            } else {
                accepted = Some(window.request);
            }
        }
        self.send_next(sched)?;
        Ok(accepted)
    }

    fn send_next(&mut self, sched: &mut Scheduler) -> Result<(), Error> {
        let now = sched.now();
        let ready = match (&self.retry, self.queue.front()) {
            (Some(_), _) => now,
            (None, Some((ready, _))) => *ready,
            (None, None) => return Ok(()),
        };
        let at = ready.max(self.next_send);
        if at > now {
            sched.notify_at(self.owner, self.process, at);
            return Ok(());
        }
        let link = self.link()?.clone();
        let request = match self.retry.take() {
            Some(request) => request,
            None => match self.queue.pop_front() {
                Some((_, request)) => request,
                None => return Ok(()),
            },
        };
        let closes = if self.nacc_wait == 0 {
            (now, sched.delta() + 1)
        } else {
            (now + self.nacc_wait, 0)
        };
        log::trace!("{}: sending {}", self.name, request);
        self.window = Some(Window {
            request: request.clone(),
            closes,
            nacced: false,
        });
        self.next_send = now + self.clock_period;
        self.sent += 1;
        link.nb_request(request, sched);
        arm(self.owner, self.process, closes, sched);
        Ok(())
    }

    /// Beats queued, in flight or awaiting a resend.
    pub fn pending(&self) -> usize {
        self.queue.len() + self.retry.iter().count() + self.window.iter().count()
    }

    /// Beats put on the wire, resends included.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn retries(&self) -> u64 {
        self.retries
    }
}

#[derive(Debug)]
pub struct ResponseIssuer {
    name: String,
    owner: ModuleId,
    process: ProcessId,
    port: usize,
    clock_period: Time,
    link: Option<ResponseLink>,
    naccs: VecDeque<Response>,
    queue: VecDeque<(Time, Response)>,
    next_send: Time,
    sent: u64,
    busy: u64,
}

impl ResponseIssuer {
    pub fn new(
        name: &str,
        owner: ModuleId,
        process: ProcessId,
        port: usize,
        clock_period: Time,
    ) -> Self {
        Self {
            name: name.to_string(),
            owner,
            process,
            port,
            clock_period,
            link: None,
            naccs: VecDeque::new(),
            queue: VecDeque::new(),
            next_send: 0,
            sent: 0,
            busy: 0,
        }
    }

    pub fn bind(&mut self, link: ResponseLink) -> Result<(), Error> {
        if self.link.is_some() {
            return Err(Error::AlreadyBound {
                module: self.name.clone(),
                port: self.port,
            });
        }
        self.link = Some(link);
        Ok(())
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    /// Queues a response beat to go out no earlier than `delay` from now.
    pub fn push(&mut self, response: Response, delay: Time, sched: &mut Scheduler) {
        let ready = sched.now() + delay;
        self.queue.push_back((ready, response));
        if self.queue.len() == 1 {
            arm(self.owner, self.process, (ready.max(self.next_send), 0), sched);
        }
    }

    /// NACCs go out in the next delta cycle and are not throttled.
    pub fn push_nacc(&mut self, response: Response, sched: &mut Scheduler) {
        self.naccs.push_back(response);
        sched.notify(self.owner, self.process, 0);
    }

    /// Sends pending NACCs and at most one due response. Returns the
    /// response the master took.
    pub fn wake(&mut self, sched: &mut Scheduler) -> Result<Option<Response>, Error> {
        if self.naccs.is_empty() && self.queue.is_empty() {
            return Ok(None);
        }
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| Error::UnboundPort {
                module: self.name.clone(),
                port: self.port,
            })?
            .clone();
        while let Some(nacc) = self.naccs.pop_front() {
            log::trace!("{}: NACC {}", self.name, nacc);
            if !link.nb_respond(nacc, sched) {
                log::warn!("{}: master refused a NACC", self.name);
            }
        }
        let now = sched.now();
        let due = match self.queue.front() {
            Some((ready, _)) => (*ready).max(self.next_send),
            None => return Ok(None),
        };
        if due > now {
            sched.notify_at(self.owner, self.process, due);
            return Ok(None);
        }
        let mut delivered = None;
        if let Some((ready, response)) = self.queue.pop_front() {
            if link.nb_respond(response.clone(), sched) {
                log::trace!("{}: responded {}", self.name, response);
                self.sent += 1;
                delivered = Some(response);
            } else {
                log::trace!("{}: master busy for {}", self.name, response);
                self.busy += 1;
                self.queue.push_front((ready, response));
            }
            self.next_send = now + self.clock_period;
        }
        if let Some((ready, _)) = self.queue.front() {
            let at = (*ready).max(self.next_send);
            sched.notify_at(self.owner, self.process, at);
        }
        Ok(delivered)
    }

    pub fn pending(&self) -> usize {
        self.queue.len() + self.naccs.len()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Times the master refused a response.
    pub fn busy(&self) -> u64 {
        self.busy
    }
}
