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

//! Construction parameters of every device.
//!
//! Delays are counted in clock cycles of the device. Clock periods and NACC
//! waits are in time units; `None` means "use the system clock period".

use crate::sim::{SimContext, Time};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Which bus convention a memory speaks on its ports.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum BusProtocol {
    Pif,
    Axi,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub bit_width: usize,
    pub depth: usize,
    pub num_producers: usize,
    pub num_consumers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            bit_width: 32,
            depth: 16,
            num_producers: 1,
            num_consumers: 1,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReorderBufferConfig {
    /// IDs per lane; one of 32, 48, 64 or 128.
    pub num_entries: usize,
    pub request_fifo_depth: usize,
    pub request_delay: u64,
    pub response_delay: u64,
    pub nacc_wait_time: Option<Time>,
    pub clock_period: Option<Time>,
}

impl Default for ReorderBufferConfig {
    fn default() -> Self {
        Self {
            num_entries: 32,
            request_fifo_depth: 2,
            request_delay: 1,
            response_delay: 1,
            nacc_wait_time: None,
            clock_period: None,
        }
    }
}

/// An address range served by the uDMA's local-memory port.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct LocalMemoryRange {
    pub start: u64,
    pub size: u64,
}

impl LocalMemoryRange {
    pub fn contains(&self, address: u64, len: u64) -> bool {
        address >= self.start && address + len <= self.start + self.size
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct UdmaConfig {
    pub pif_byte_width: u32,
    pub local_byte_width: u32,
    pub local_memories: Vec<LocalMemoryRange>,
    pub read_priority: u8,
    pub write_priority: u8,
    pub read_delay: u64,
    pub write_delay: u64,
    pub register_response_delay: u64,
    /// Start in the fast functional engine.
    pub turbo: bool,
    pub nacc_wait_time: Option<Time>,
    pub clock_period: Option<Time>,
}

impl Default for UdmaConfig {
    fn default() -> Self {
        Self {
            pif_byte_width: 8,
            local_byte_width: 8,
            local_memories: vec![LocalMemoryRange {
                start: 0x6000_0000,
                size: 0x1_0000,
            }],
            read_priority: 0,
            write_priority: 0,
            read_delay: 1,
            write_delay: 1,
            register_response_delay: 1,
            turbo: false,
            nacc_wait_time: None,
            clock_period: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Axi2PifConfig {
    pub axi_byte_width: u32,
    pub pif_byte_width: u32,
    /// Largest PIF block the bridge forms; one of 2, 4, 8 or 16.
    pub max_block_beats: u32,
    pub read_request_fifo_depth: usize,
    pub write_request_fifo_depth: usize,
    pub outstanding_pif_request_ids: usize,
    pub maintain_order: bool,
    pub wait_on_outstanding_write: bool,
    pub request_delay: u64,
    pub response_delay: u64,
    pub nacc_wait_time: Option<Time>,
    pub clock_period: Option<Time>,
}

impl Default for Axi2PifConfig {
    fn default() -> Self {
        Self {
            axi_byte_width: 8,
            pif_byte_width: 8,
            max_block_beats: 16,
            read_request_fifo_depth: 2,
            write_request_fifo_depth: 2,
            outstanding_pif_request_ids: 16,
            maintain_order: true,
            wait_on_outstanding_write: false,
            request_delay: 1,
            response_delay: 1,
            nacc_wait_time: None,
            clock_period: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Pif2AxiConfig {
    pub pif_byte_width: u32,
    pub axi_byte_width: u32,
    pub read_request_fifo_depth: usize,
    pub write_request_fifo_depth: usize,
    pub outstanding_axi_request_ids: usize,
    pub maintain_order: bool,
    pub wait_on_outstanding_write: bool,
    /// Unaligned PIF blocks become one critical-word-first WRAP burst
    /// instead of beat-by-beat reads.
    pub wrap_unaligned_blocks: bool,
    pub rcw_retry_limit: u32,
    pub request_delay: u64,
    pub response_delay: u64,
    pub nacc_wait_time: Option<Time>,
    pub clock_period: Option<Time>,
}

impl Default for Pif2AxiConfig {
    fn default() -> Self {
        Self {
            pif_byte_width: 8,
            axi_byte_width: 8,
            read_request_fifo_depth: 2,
            write_request_fifo_depth: 2,
            outstanding_axi_request_ids: 16,
            maintain_order: true,
            wait_on_outstanding_write: false,
            wrap_unaligned_blocks: true,
            rcw_retry_limit: 4,
            request_delay: 1,
            response_delay: 1,
            nacc_wait_time: None,
            clock_period: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MemoryTraceConfig {
    pub num_ports: usize,
    /// Waveform recording; ignored without a VCD writer.
    pub enable_tracing: bool,
    pub track_statistics: bool,
    pub byte_width: u32,
    pub clock_period: Option<Time>,
}

impl Default for MemoryTraceConfig {
    fn default() -> Self {
        Self {
            num_ports: 1,
            enable_tracing: true,
            track_statistics: true,
            byte_width: 8,
            clock_period: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    pub protocol: BusProtocol,
    pub num_ports: usize,
    pub start_address: u64,
    pub size: u64,
    pub byte_width: u32,
    pub page_byte_size: u64,
    pub initial_value: u8,
    pub read_delay: u64,
    pub write_delay: u64,
    /// Cycles between successive response beats of one transaction.
    pub burst_repeat: u64,
    pub request_fifo_depth: usize,
    /// Chance, in percent, of NACCing an acceptable request.
    pub fail_percentage: u32,
    pub fail_seed: u64,
    pub clock_period: Option<Time>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            protocol: BusProtocol::Pif,
            num_ports: 1,
            start_address: 0,
            size: 1 << 32,
            byte_width: 8,
            page_byte_size: 16 * 1024,
            initial_value: 0,
            read_delay: 1,
            write_delay: 1,
            burst_repeat: 1,
            request_fifo_depth: 2,
            fail_percentage: 0,
            fail_seed: 0x5eed,
            clock_period: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MasterConfig {
    pub num_ports: usize,
    pub nacc_wait_time: Option<Time>,
    pub clock_period: Option<Time>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            num_ports: 1,
            nacc_wait_time: None,
            clock_period: None,
        }
    }
}

/// Named device configurations of one system.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SystemConfig {
    pub context: SimContext,
    pub queues: BTreeMap<String, QueueConfig>,
    pub reorder_buffers: BTreeMap<String, ReorderBufferConfig>,
    pub udmas: BTreeMap<String, UdmaConfig>,
    pub axi2pifs: BTreeMap<String, Axi2PifConfig>,
    pub pif2axis: BTreeMap<String, Pif2AxiConfig>,
    pub traces: BTreeMap<String, MemoryTraceConfig>,
    pub memories: BTreeMap<String, MemoryConfig>,
    pub masters: BTreeMap<String, MasterConfig>,
}

impl SystemConfig {
    pub fn from_file<P: AsRef<Path>>(file_name: P) -> anyhow::Result<Self> {
        let file = File::open(file_name.as_ref())
            .with_context(|| format!("cannot open {}", file_name.as_ref().display()))?;
        let reader = BufReader::new(file);
        serde_yaml::from_reader(reader)
            .with_context(|| format!("cannot parse {}", file_name.as_ref().display()))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(config: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(config).context("cannot parse system configuration")
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_yaml_config() {
        let conf_str = "---
context:
  clock_period: 500
  posedge_offset: 0
  time_resolution_ps: 1
memories:
  sysmem:
    protocol: Pif
    start_address: 0
    size: 268435456
    read_delay: 3
    fail_percentage: 10
  localmem:
    start_address: 1610612736
    size: 65536
    byte_width: 16
udmas:
  udma0:
    pif_byte_width: 16
    local_byte_width: 16
    local_memories:
      - start: 1610612736
        size: 65536
    turbo: true
    nacc_wait_time: 250
reorder_buffers:
  rob:
    num_entries: 48
queues:
  q:
    depth: 4
    num_producers: 2
";
        let config = SystemConfig::from_str(conf_str).unwrap();
        assert_eq!(config.context.clock_period, 500);
        assert_eq!(config.memories.len(), 2);
        let sysmem = &config.memories["sysmem"];
        assert_eq!(sysmem.read_delay, 3);
        assert_eq!(sysmem.fail_percentage, 10);
        assert_eq!(sysmem.write_delay, MemoryConfig::default().write_delay);
        assert_eq!(config.memories["localmem"].byte_width, 16);
        let udma = &config.udmas["udma0"];
        assert!(udma.turbo);
        assert_eq!(udma.nacc_wait_time, Some(250));
        assert_eq!(udma.clock_period, None);
        assert_eq!(udma.local_memories[0].size, 0x1_0000);
        assert_eq!(config.reorder_buffers["rob"].num_entries, 48);
        assert_eq!(config.reorder_buffers["rob"].request_fifo_depth, 2);
        assert_eq!(config.queues["q"].num_producers, 2);
        assert_eq!(config.queues["q"].bit_width, 32);
        assert!(config.axi2pifs.is_empty());
    }

    #[test]
    fn write_yaml_config() {
        let mut config = SystemConfig::default();
        config.memories.insert("mem".to_string(), MemoryConfig::default());
        config.pif2axis.insert(
            "bridge".to_string(),
            Pif2AxiConfig {
                axi_byte_width: 16,
                ..Default::default()
            },
        );
        config
            .traces
            .insert("trace".to_string(), MemoryTraceConfig::default());
        let yaml = config.to_yaml().unwrap();
        assert_eq!(SystemConfig::from_str(&yaml).unwrap(), config);
    }

    #[test]
    fn missing_file_is_reported() {
        let err = SystemConfig::from_file("/nonexistent/system.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/system.yaml"));
    }

    #[test]
    fn local_range_bounds() {
        let range = LocalMemoryRange {
            start: 0x1000,
            size: 0x100,
        };
        assert!(range.contains(0x1000, 0x100));
        assert!(!range.contains(0x10f8, 16));
        assert!(!range.contains(0xff0, 4));
    }
}
