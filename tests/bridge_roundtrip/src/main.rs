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

//! Random PIF traffic through a PIF-to-AXI bridge and back, checked
//! against a snapshot of the memory behind it.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{bail, ensure};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use bussim::transactor::pif2axi::{AXI_READ_PORT, AXI_WRITE_PORT};
use bussim::*;

const REGION: u64 = 0x100;
const OPS_PER_BATCH: u64 = 8;
const MEMORY_SIZE: u64 = 0x10_0000;

#[derive(Debug)]
enum Op {
    Read { address: u64, size: u32 },
    Write { address: u64, data: Vec<u8> },
    BlockRead { address: u64, beats: u32 },
    BlockWrite { address: u64, data: Vec<u8> },
    Rcw { address: u64, compare: Vec<u8>, swap: Vec<u8> },
}

impl Op {
    /// A random operation inside `region`; read-conditional-writes only
    /// when `rcw` is set.
    fn random(rng: &mut StdRng, region: u64, snapshot: &[u8], rcw: bool) -> Self {
        let beats = [2, 4, 8][rng.gen_range(0..3)];
        match rng.gen_range(0..if rcw { 5 } else { 4 }) {
            0 => {
                let size = [1, 2, 4, 8][rng.gen_range(0..4)];
                let address = region + rng.gen_range(0..REGION / size as u64) * size as u64;
                Op::Read { address, size }
            }
            1 => {
                let size = [1, 2, 4, 8][rng.gen_range(0..4)];
                let address = region + rng.gen_range(0..REGION / size as u64) * size as u64;
                Op::Write {
                    address,
                    data: random_bytes(rng, size as usize),
                }
            }
            2 => Op::BlockRead {
                address: region + rng.gen_range(0..REGION / 8) * 8,
                beats,
            },
            3 => {
                let block = 8 * beats as u64;
                Op::BlockWrite {
                    address: region + rng.gen_range(0..REGION / block) * block,
                    data: random_bytes(rng, block as usize),
                }
            }
            _ => {
                let offset = rng.gen_range(0..REGION / 4) * 4;
                let old = &snapshot[offset as usize..offset as usize + 4];
                let compare = if rng.gen_bool(0.5) {
                    old.to_vec()
                } else {
                    old.iter().map(|b| !b).collect()
                };
                Op::Rcw {
                    address: region + offset,
                    compare,
                    swap: random_bytes(rng, 4),
                }
            }
        }
    }

    fn beats(&self) -> Vec<Request> {
        match self {
            Op::Read { address, size } => vec![Request::read(*address, *size)],
            Op::Write { address, data } => vec![Request::write(*address, data)],
            Op::BlockRead { address, beats } => vec![Request::block_read(*address, 8, *beats)],
            Op::BlockWrite { address, data } => Request::block_write(*address, 8, data),
            Op::Rcw {
                address,
                compare,
                swap,
            } => Request::rcw(*address, compare, swap),
        }
    }

    /// The data the master should see and the region contents afterwards.
    fn expect(&self, region: u64, snapshot: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut after = snapshot.to_vec();
        let at = |address: u64| (address - region) as usize;
        let data = match self {
            Op::Read { address, size } => snapshot[at(*address)..at(*address) + *size as usize].to_vec(),
            Op::Write { address, data } | Op::BlockWrite { address, data } => {
                after[at(*address)..at(*address) + data.len()].copy_from_slice(data);
                vec![]
            }
            Op::BlockRead { address, beats } => {
                let first = Request::block_read(*address, 8, *beats);
                (0..*beats)
                    .flat_map(|beat| {
                        let from = at(first.beat_address(beat));
                        snapshot[from..from + 8].to_vec()
                    })
                    .collect()
            }
            Op::Rcw {
                address,
                compare,
                swap,
            } => {
                let old = snapshot[at(*address)..at(*address) + 4].to_vec();
                if old == *compare {
                    after[at(*address)..at(*address) + 4].copy_from_slice(swap);
                }
                old
            }
        };
        (data, after)
    }
}

fn random_bytes(rng: &mut StdRng, len: usize) -> Vec<u8> {
    (0..len).map(|_| rng.gen()).collect()
}

struct Bench {
    kernel: Kernel,
    master: Rc<RefCell<Master>>,
    memory: Rc<RefCell<Memory>>,
}

fn build(pif2axi: Pif2AxiConfig, axi2pif: Axi2PifConfig, fail_percentage: u32) -> anyhow::Result<Bench> {
    let mut kernel = Kernel::new(SimContext::default());
    let master = kernel.add_module(|id, ctx| Master::new(id, "cpu", ctx, MasterConfig::default()))?;
    let pif2axi = kernel.add_module(|id, ctx| Pif2Axi::new(id, "pif2axi", ctx, pif2axi))?;
    let axi2pif = kernel.add_module(|id, ctx| Axi2Pif::new(id, "axi2pif", ctx, axi2pif))?;
    let memory = kernel.add_module(|id, ctx| {
        Memory::new(
            id,
            "memory",
            ctx,
            MemoryConfig {
                size: MEMORY_SIZE,
                fail_percentage,
                ..Default::default()
            },
        )
    })?;
    kernel.connect(&master, 0, &pif2axi, 0)?;
    kernel.connect(&pif2axi, AXI_READ_PORT, &axi2pif, 0)?;
    kernel.connect(&pif2axi, AXI_WRITE_PORT, &axi2pif, 1)?;
    kernel.connect(&axi2pif, 0, &memory, 0)?;
    Ok(Bench {
        kernel,
        master,
        memory,
    })
}

/// Runs `batches` batches of concurrent operations on disjoint regions and
/// returns the number of operations checked.
fn run_scenario(name: &str, mut bench: Bench, seed: u64, batches: usize) -> anyhow::Result<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut checked = 0;
    {
        let noise = random_bytes(&mut rng, MEMORY_SIZE as usize);
        bench.memory.borrow_mut().store_mut().poke(0, &noise)?;
    }
    for _ in 0..batches {
        let base = rng.gen_range(0..MEMORY_SIZE / REGION - OPS_PER_BATCH) * REGION;
        let mut pending = vec![];
        for i in 0..OPS_PER_BATCH {
            let region = base + i * REGION;
            let snapshot = bench.memory.borrow().store().read(region, REGION as usize)?;
            // One exclusive reservation per batch.
            let op = Op::random(&mut rng, region, &snapshot, i == 0);
            let delay = rng.gen_range(0..4) * DEFAULT_CLOCK_PERIOD;
            let tag = {
                let mut master = bench.master.borrow_mut();
                master.issue(0, op.beats(), delay, bench.kernel.scheduler())?
            };
            pending.push((region, snapshot, op, tag));
        }
        bench.kernel.run_to_completion(1_000_000_000)?;
        for (region, snapshot, op, tag) in pending {
            let (data, after) = op.expect(region, &snapshot);
            let master = bench.master.borrow();
            let status = master.status_for(tag);
            ensure!(status == Some(Status::Ok), "{}: {:?} ended with {:?}", name, op, status);
            if master.data_for(tag) != data {
                bail!("{}: {:?} returned {:x?}, expected {:x?}", name, op, master.data_for(tag), data);
            }
            if bench.memory.borrow().store().read(region, REGION as usize)? != after {
                bail!("{}: {:?} left region {:#x} wrong", name, op, region);
            }
            checked += 1;
        }
    }
    let retries = bench.master.borrow().retries();
    log::info!(
        "{}: {} operations checked, {} retries, finished at {}",
        name,
        checked,
        retries,
        bench.kernel.now()
    );
    Ok(checked)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let narrow = build(Pif2AxiConfig::default(), Axi2PifConfig::default(), 0)?;
    run_scenario("narrow", narrow, 1, 50)?;

    let wide = build(
        Pif2AxiConfig {
            axi_byte_width: 16,
            outstanding_axi_request_ids: 4,
            ..Default::default()
        },
        Axi2PifConfig {
            axi_byte_width: 16,
            max_block_beats: 4,
            outstanding_pif_request_ids: 4,
            ..Default::default()
        },
        10,
    )?;
    run_scenario("wide_with_naccs", wide, 2, 50)?;

    let no_wrap = build(
        Pif2AxiConfig {
            wrap_unaligned_blocks: false,
            wait_on_outstanding_write: true,
            ..Default::default()
        },
        Axi2PifConfig {
            wait_on_outstanding_write: true,
            ..Default::default()
        },
        0,
    )?;
    run_scenario("beat_by_beat", no_wrap, 3, 50)?;
    Ok(())
}
