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

mod config;
mod error;
mod issuer;
mod master;
mod memory;
mod netlist;
mod pool;
mod protocol;
mod queue;
mod reorder_buffer;
mod sim;
pub mod trace;
pub mod transactor;
pub mod udma;
mod vcd;

pub use crate::config::{
    Axi2PifConfig, BusProtocol, LocalMemoryRange, MasterConfig, MemoryConfig, MemoryTraceConfig,
    Pif2AxiConfig, QueueConfig, ReorderBufferConfig, SystemConfig, UdmaConfig,
};
pub use crate::error::Error;
pub use crate::issuer::{RequestIssuer, ResponseIssuer};
pub use crate::master::Master;
pub use crate::memory::{parse_number, Memory, PagedMemory};
pub use crate::netlist::{Binding, Netlist};
pub use crate::pool::{Handle, Pool};
pub use crate::protocol::{
    all_byte_enables, BurstType, Ports, Request, RequestLink, RequestSink, RequestType, Response,
    ResponseLink, ResponseSink, Status,
};
pub use crate::queue::{Queue, Value};
pub use crate::reorder_buffer::{Lane, ReorderBuffer, VALID_NUM_ENTRIES};
pub use crate::sim::{
    Kernel, Module, ModuleId, ProcessId, Scheduler, SimContext, Time, DEFAULT_CLOCK_PERIOD,
};
pub use crate::trace::MemoryTrace;
pub use crate::transactor::axi2pif::Axi2Pif;
pub use crate::transactor::pif2axi::Pif2Axi;
pub use crate::udma::{Descriptor, SimulationMode, Udma, UdmaError};
pub use crate::vcd::{VcdComponent, VcdWriter};
