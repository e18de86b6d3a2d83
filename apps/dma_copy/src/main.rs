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

//! Copies a block of rows between a local memory and system memory with
//! the micro-DMA engine, and reports what the PIF trace saw.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{bail, Context};
use env_logger::Target;
use rand::{Rng, SeedableRng};
use structopt::StructOpt;

use bussim::udma::registers::*;
use bussim::udma::{DESCRIPTOR_SIZE, LOCAL_PORT, PIF_PORT};
use bussim::*;

const DEFAULT_SYSTEM: &str = "---
memories:
  localmem:
    start_address: 1610612736
    size: 65536
  sysmem:
    size: 16777216
    read_delay: 4
    write_delay: 2
udmas:
  udma: {}
traces:
  pif_trace: {}
";

/// The descriptor sits at the top of the first local memory.
const RING_OFFSET: u64 = 0x40;

#[derive(StructOpt)]
#[structopt(name = "dma_copy", about = "Runs a micro-DMA copy on a simulated bus")]
struct Arguments {
    /// YAML system configuration; needs memories `localmem` and `sysmem`,
    /// udma `udma` and trace `pif_trace`
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,
    #[structopt(long, default_value = "256")]
    bytes_per_row: u32,
    #[structopt(long, default_value = "4")]
    rows: u32,
    /// PIF beats per block transfer; 0 for partial transfers
    #[structopt(long, default_value = "8")]
    block: u32,
    #[structopt(long, default_value = "4")]
    outstanding: u32,
    /// Copy from system memory into the local memory instead
    #[structopt(long)]
    to_local: bool,
    #[structopt(long, default_value = "0x100000", parse(try_from_str = parse_number))]
    external_address: u64,
    #[structopt(long)]
    turbo: bool,
    #[structopt(long, default_value = "1")]
    seed: u64,
    /// Write a waveform of the PIF trace
    #[structopt(long, parse(from_os_str))]
    vcd: Option<PathBuf>,
    #[structopt(long, default_value = "1000000000")]
    limit: Time,
}

struct System {
    kernel: Kernel,
    udma: Rc<RefCell<Udma>>,
    local: Rc<RefCell<Memory>>,
    sysmem: Rc<RefCell<Memory>>,
    trace: Rc<RefCell<MemoryTrace>>,
}

fn build(config: &SystemConfig, turbo: bool) -> anyhow::Result<System> {
    let mut udma_config = config
        .udmas
        .get("udma")
        .cloned()
        .context("missing udmas.udma")?;
    udma_config.turbo |= turbo;
    let local_config = config
        .memories
        .get("localmem")
        .cloned()
        .context("missing memories.localmem")?;
    let sysmem_config = config
        .memories
        .get("sysmem")
        .cloned()
        .context("missing memories.sysmem")?;
    let trace_config = config
        .traces
        .get("pif_trace")
        .cloned()
        .context("missing traces.pif_trace")?;

    let mut kernel = Kernel::new(config.context.clone());
    let udma = kernel.add_module(|id, ctx| Udma::new(id, "udma", ctx, udma_config))?;
    let local = kernel.add_module(|id, ctx| Memory::new(id, "localmem", ctx, local_config))?;
    let trace = kernel.add_module(|id, ctx| MemoryTrace::new(id, "pif_trace", ctx, trace_config))?;
    let sysmem = kernel.add_module(|id, ctx| Memory::new(id, "sysmem", ctx, sysmem_config))?;
    kernel.connect(&udma, LOCAL_PORT, &local, 0)?;
    kernel.connect(&udma, PIF_PORT, &trace, 0)?;
    kernel.connect(&trace, 0, &sysmem, 0)?;
    Ok(System {
        kernel,
        udma,
        local,
        sysmem,
        trace,
    })
}

fn main() -> anyhow::Result<()> {
    let args = Arguments::from_args();

    let _logger = env_logger::builder()
        .filter(Some("bussim"), log::LevelFilter::Info)
        .target(Target::Stderr)
        .init();

    let config = match &args.config {
        Some(path) => SystemConfig::from_file(path)?,
        None => SystemConfig::from_str(DEFAULT_SYSTEM)?,
    };
    let mut system = build(&config, args.turbo)?;

    let local_base = system.local.borrow().store().start();
    let ring = local_base + RING_OFFSET;
    let local_data = ring + DESCRIPTOR_SIZE;
    let (source, destination) = if args.to_local {
        (args.external_address, local_data)
    } else {
        (local_data, args.external_address)
    };
    let descriptor = Descriptor {
        source_address: u32::try_from(source)?,
        destination_address: u32::try_from(destination)?,
        num_bytes_per_row: args.bytes_per_row,
        max_block_transfers: args.block,
        max_outstanding: args.outstanding,
        sync_interrupt_enable: true,
        num_rows: args.rows,
        source_pitch: args.bytes_per_row,
        destination_pitch: args.bytes_per_row,
    };
    let total = descriptor.total_bytes() as usize;
    let mut rng = rand::rngs::StdRng::seed_from_u64(args.seed);
    let data: Vec<u8> = (0..total).map(|_| rng.gen()).collect();
    if args.to_local {
        system.sysmem.borrow_mut().store_mut().poke(source, &data)?;
    } else {
        system.local.borrow_mut().store_mut().poke(source, &data)?;
    }
    system
        .local
        .borrow_mut()
        .store_mut()
        .poke(ring, &descriptor.to_bytes())?;

    let vcd = match &args.vcd {
        Some(path) => {
            let writer = Rc::new(RefCell::new(
                VcdWriter::create(path).with_context(|| format!("cannot create {}", path.display()))?,
            ));
            {
                let trace = system.trace.borrow();
                VcdWriter::write_header(
                    Rc::clone(&writer),
                    config.context.time_resolution_ps,
                    &[&*trace],
                );
            }
            system.trace.borrow_mut().attach_vcd(Rc::clone(&writer));
            Some(writer)
        }
        None => None,
    };

    {
        let mut udma = system.udma.borrow_mut();
        let sched = system.kernel.scheduler();
        udma.write_register(DESC_START, ring as u32, sched)?;
        udma.write_register(DESC_END, ring as u32, sched)?;
        udma.write_register(DESC_CUR_PTR, ring as u32, sched)?;
        udma.write_register(DESC_NUM, 1, sched)?;
        udma.write_register(SETTINGS, SETTINGS_ENABLE | SETTINGS_ERROR_INTERRUPT, sched)?;
    }
    let end = system.kernel.run_to_completion(args.limit)?;
    if let Some(writer) = vcd {
        writer.borrow_mut().flush_after_simulation(end);
        if writer.borrow().is_error_state() {
            log::warn!("waveform is incomplete");
        }
    }

    let status = system.udma.borrow().read_register(STATUS)?;
    if status != 0 {
        bail!("descriptor failed with status {:#x}", status);
    }
    let copied = if args.to_local {
        system.local.borrow().store().read(destination, total)?
    } else {
        system.sysmem.borrow().store().read(destination, total)?
    };
    if copied != data {
        bail!("destination does not match the source");
    }
    log::info!(
        "copied {} bytes in {} ({} mode)",
        total,
        end,
        system.udma.borrow().mode()
    );
    println!("{}", system.kernel.command("udma", "dump_statistic_info")?);
    println!("{}", system.kernel.command("pif_trace", "dump_statistic_info")?);
    Ok(())
}
