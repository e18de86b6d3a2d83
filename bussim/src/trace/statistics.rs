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

use crate::protocol::RequestType;
use crate::sim::Time;
use crate::Error;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::fmt;

/// Rounds a time span to the nearest whole number of clock periods.
pub fn round_cycles(delta: Time, clock_period: Time) -> u64 {
    (delta + clock_period / 2) / clock_period
}

/// Occurrence counts keyed by cycle count.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Histogram(BTreeMap<u64, u64>);

impl Histogram {
    pub fn add(&mut self, cycles: u64) {
        *self.0.entry(cycles).or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &Histogram) {
        for (cycles, count) in &other.0 {
            *self.0.entry(*cycles).or_insert(0) += count;
        }
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn get(&self, cycles: u64) -> u64 {
        self.0.get(&cycles).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.0.iter().map(|(c, n)| (*c, *n))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            self.iter()
                .map(|(cycles, count)| format!("{}: {}", cycles, count))
                .join("\n")
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Counter {
    Transactions,
    LatencySum,
    LifetimeSum,
    RequestBeats,
    RequestBusys,
    ResponseBeats,
    ResponseBusys,
    MaxLatency,
    MaxLifetime,
}

impl Counter {
    pub const ALL: [Counter; 9] = [
        Counter::Transactions,
        Counter::LatencySum,
        Counter::LifetimeSum,
        Counter::RequestBeats,
        Counter::RequestBusys,
        Counter::ResponseBeats,
        Counter::ResponseBusys,
        Counter::MaxLatency,
        Counter::MaxLifetime,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Counter::Transactions => "transactions",
            Counter::LatencySum => "latency_sum",
            Counter::LifetimeSum => "lifetime_sum",
            Counter::RequestBeats => "request_beats",
            Counter::RequestBusys => "request_busys",
            Counter::ResponseBeats => "response_beats",
            Counter::ResponseBusys => "response_busys",
            Counter::MaxLatency => "max_latency",
            Counter::MaxLifetime => "max_lifetime",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::InvalidArgument(format!("unknown counter {}", name)))
    }

    /// Maxima combine by maximum, everything else by sum.
    fn is_maximum(&self) -> bool {
        matches!(self, Counter::MaxLatency | Counter::MaxLifetime)
    }
}

/// A maximum observed value and the tag of the transaction that set it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Maximum {
    pub cycles: u64,
    pub tag: Option<u64>,
}

impl Maximum {
    fn observe(&mut self, cycles: u64, tag: u64) {
        if self.tag.is_none() || cycles > self.cycles {
            self.cycles = cycles;
            self.tag = Some(tag);
        }
    }
}

/// Counters of one (port, request type) pair.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    pub transactions: u64,
    pub latency_sum: u64,
    pub lifetime_sum: u64,
    pub request_beats: u64,
    pub request_busys: u64,
    pub response_beats: u64,
    pub response_busys: u64,
    pub latency_histogram: Histogram,
    pub lifetime_histogram: Histogram,
    pub max_latency: Maximum,
    pub max_lifetime: Maximum,
}

impl Statistics {
    /// Accounts one completed transaction.
    pub fn complete(&mut self, tag: u64, latency: u64, lifetime: u64) {
        self.transactions += 1;
        self.latency_sum += latency;
        self.lifetime_sum += lifetime;
        self.latency_histogram.add(latency);
        self.lifetime_histogram.add(lifetime);
        self.max_latency.observe(latency, tag);
        self.max_lifetime.observe(lifetime, tag);
    }

    pub fn counter(&self, counter: Counter) -> u64 {
        match counter {
            Counter::Transactions => self.transactions,
            Counter::LatencySum => self.latency_sum,
            Counter::LifetimeSum => self.lifetime_sum,
            Counter::RequestBeats => self.request_beats,
            Counter::RequestBusys => self.request_busys,
            Counter::ResponseBeats => self.response_beats,
            Counter::ResponseBusys => self.response_busys,
            Counter::MaxLatency => self.max_latency.cycles,
            Counter::MaxLifetime => self.max_lifetime.cycles,
        }
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let average = |sum: u64| {
            if self.transactions == 0 {
                0.0
            } else {
                sum as f64 / self.transactions as f64
            }
        };
        write!(
            f,
            "transactions={} request_beats={} request_busys={} response_beats={} \
             response_busys={} avg_latency={:.2} avg_lifetime={:.2}",
            self.transactions,
            self.request_beats,
            self.request_busys,
            self.response_beats,
            self.response_busys,
            average(self.latency_sum),
            average(self.lifetime_sum)
        )?;
        if let Some(tag) = self.max_latency.tag {
            write!(f, " max_latency={} (tag {})", self.max_latency.cycles, tag)?;
        }
        if let Some(tag) = self.max_lifetime.tag {
            write!(f, " max_lifetime={} (tag {})", self.max_lifetime.cycles, tag)?;
        }
        Ok(())
    }
}

/// Selects (port, type) pairs; `*` selects all of a dimension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    types: Option<Vec<RequestType>>,
    ports: Option<Vec<usize>>,
}

impl Filter {
    pub fn all() -> Self {
        Self {
            types: None,
            ports: None,
        }
    }

    /// Parses comma separated type names (`READ,BLOCK_READ`) and port
    /// numbers (`0,2`).
    pub fn parse(types: &str, ports: &str, num_ports: usize) -> Result<Self, Error> {
        let types = if types == "*" {
            None
        } else {
            Some(
                types
                    .split(',')
                    .map(|name| {
                        RequestType::from_name(&name.to_ascii_uppercase()).ok_or_else(|| {
                            Error::InvalidArgument(format!("unknown request type {}", name))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            )
        };
        let ports = if ports == "*" {
            None
        } else {
            Some(
                ports
                    .split(',')
                    .map(|port| match port.parse::<usize>() {
                        Ok(port) if port < num_ports => Ok(port),
                        _ => Err(Error::InvalidArgument(format!("bad port {}", port))),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            )
        };
        Ok(Self { types, ports })
    }

    pub fn matches(&self, port: usize, request_type: RequestType) -> bool {
        self.ports.as_ref().map_or(true, |p| p.contains(&port))
            && self
                .types
                .as_ref()
                .map_or(true, |t| t.contains(&request_type))
    }
}

/// Statistics of every (port, type) pair seen so far.
#[derive(Clone, Debug, Default)]
pub struct StatisticsTable {
    entries: BTreeMap<(usize, RequestType), Statistics>,
}

impl StatisticsTable {
    pub fn entry(&mut self, port: usize, request_type: RequestType) -> &mut Statistics {
        self.entries.entry((port, request_type)).or_default()
    }

    pub fn get(&self, port: usize, request_type: RequestType) -> Option<&Statistics> {
        self.entries.get(&(port, request_type))
    }

    pub fn selected<'a>(
        &'a self,
        filter: &'a Filter,
    ) -> impl Iterator<Item = (&'a (usize, RequestType), &'a Statistics)> + 'a {
        self.entries
            .iter()
            .filter(move |((port, request_type), _)| filter.matches(*port, *request_type))
    }

    pub fn counter(&self, counter: Counter, filter: &Filter) -> u64 {
        let values = self.selected(filter).map(|(_, s)| s.counter(counter));
        if counter.is_maximum() {
            values.max().unwrap_or(0)
        } else {
            values.sum()
        }
    }

    pub fn latency_histogram(&self, filter: &Filter) -> Histogram {
        let mut histogram = Histogram::default();
        for (_, statistics) in self.selected(filter) {
            histogram.merge(&statistics.latency_histogram);
        }
        histogram
    }

    pub fn lifetime_histogram(&self, filter: &Filter) -> Histogram {
        let mut histogram = Histogram::default();
        for (_, statistics) in self.selected(filter) {
            histogram.merge(&statistics.lifetime_histogram);
        }
        histogram
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Display for StatisticsTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            self.entries
                .iter()
                .map(|((port, request_type), s)| format!("port {} {}: {}", port, request_type, s))
                .join("\n")
        )
    }
}
