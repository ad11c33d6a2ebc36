// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::Parser;
use log::{error, info, warn};
use pcx::core::config::MachineConfig;
use pcx::core::cpu::registers::SegReg;
use pcx::core::error::Result;
use pcx::core::system::{SliceOutcome, System};

/// x86 PC emulator
#[derive(Parser)]
#[command(name = "pcx")]
#[command(about = "x86 PC emulator core", long_about = None)]
struct Args {
    /// Path to BIOS image (overrides bios_path from the config file)
    bios_file: Option<String>,

    /// Machine configuration file (TOML)
    #[arg(short = 'c', long)]
    config: Option<String>,

    /// Number of scheduler slices to run (0 = until the CPU halts for good)
    #[arg(short = 's', long, default_value = "1000")]
    slices: u64,

    /// Write an execution trace to this file
    #[arg(short = 't', long)]
    trace: Option<String>,

    /// Maximum number of traced instructions (0 = unlimited)
    #[arg(long, default_value = "0")]
    trace_limit: usize,
}

fn main() -> Result<()> {
    // .env may carry RUST_LOG, PCX_CONFIG and PCX_TRACE; a missing file is fine
    dotenvy::dotenv().ok();

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    info!("pcx v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .or_else(|| std::env::var("PCX_CONFIG").ok());
    let mut config = match &config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            MachineConfig::load(path)?
        }
        None => MachineConfig::default(),
    };
    if let Some(bios) = &args.bios_file {
        config.bios_path = Some(bios.clone());
    }
    if let Some(trace) = args.trace.clone().or_else(|| std::env::var("PCX_TRACE").ok()) {
        config.trace_path = Some(trace);
        config.trace_limit = args.trace_limit;
    }
    if config.bios_path.is_none() {
        warn!("No BIOS image given; execution starts from an empty ROM window");
    }

    let mut system = match System::from_config(config) {
        Ok(system) => system,
        Err(e) => {
            error!("Failed to initialize machine: {}", e);
            return Err(e);
        }
    };

    info!("Starting emulation...");

    let mut slice = 0u64;
    loop {
        if args.slices != 0 && slice >= args.slices {
            break;
        }
        slice += 1;

        match system.run_slice() {
            Ok(SliceOutcome::Yielded { .. }) => {}
            Ok(SliceOutcome::Halted { .. }) => {
                let cpu = system.cpu();
                if cpu.is_shutdown() || !cpu.interrupts_enabled() || system.pending_interrupts() == 0 {
                    info!("CPU halted with no way to wake up");
                    break;
                }
            }
            Ok(SliceOutcome::Paused) => break,
            Err(e) => {
                let eip = system.cpu().eip();
                error!("Error at EIP=0x{:08X}: {}", eip, e);
                error!("Instruction count: {}", system.instruction_count());
                system.cpu().dump_registers();
                return Err(e);
            }
        }
    }

    info!("Emulation stopped");
    info!("Slices: {}", system.slices());
    info!("Total instructions: {}", system.instruction_count());
    info!(
        "Final CS:EIP: {:04X}:{:08X}",
        system.cpu().segment(SegReg::Cs).value(),
        system.cpu().eip()
    );

    Ok(())
}
