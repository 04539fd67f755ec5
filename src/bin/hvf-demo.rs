//! Run the sample arithmetic guest through hvf-kvm
//!
//! Usage: hvf-demo [--config vm.json] [--mem-base 0x69420000] [--max-exits 16]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, info, warn};
use vm_memory::{Address, GuestAddress, GuestMemoryMmap};

use hvf_kvm::sample::{ARITH_GUEST, MEM_BASE, MEM_SIZE, RESULT_OFFSET};
use hvf_kvm::vmm::memory::{read_u64_from_guest, write_to_guest};
use hvf_kvm::{ExitReason, MemoryFlags, Reg, VcpuConfig, Vm, VmConfig};

/// Compute (2 + 2) - 1 inside a KVM guest
#[derive(Parser, Debug)]
#[command(name = "hvf-demo")]
#[command(version)]
struct Args {
    /// JSON VM configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Guest-physical base of guest RAM
    #[arg(long, value_parser = parse_u64, default_value_t = MEM_BASE)]
    mem_base: u64,

    /// Offset into guest RAM that receives the result
    #[arg(long, value_parser = parse_u64, default_value_t = RESULT_OFFSET)]
    result_offset: u64,

    /// Give up after this many exits without a power event
    #[arg(long, default_value = "16")]
    max_exits: u32,
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {:?}: {}", s, e))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.result_offset + 8 > MEM_SIZE as u64 {
        return Err(format!("result offset {:#x} is outside guest RAM", args.result_offset).into());
    }

    let config = match &args.config {
        Some(path) => VmConfig::from_file(path)?,
        None => VmConfig::default(),
    };

    let base = GuestAddress(args.mem_base);
    let result_addr = GuestAddress(args.mem_base + args.result_offset);
    let memory = Arc::new(GuestMemoryMmap::from_ranges(&[(base, MEM_SIZE)])?);
    write_to_guest(&memory, base, &ARITH_GUEST)?;

    let mut vm = Vm::create(&config)?;
    vm.map_guest_memory(Arc::clone(&memory), MemoryFlags::all())?;

    let mut vcpu = vm.create_vcpu(&VcpuConfig::default())?;
    vcpu.set_reg(Reg::Pc, base.raw_value())?;
    vcpu.set_reg(Reg::X1, result_addr.raw_value())?;

    let mut powered_off = false;
    for _ in 0..args.max_exits {
        let exit = vcpu.run()?;
        info!("Exited the VM: {:?}", exit.reason);

        if exit.is_power_event() {
            debug!("System event: {:?}", exit.system_event);
            powered_off = true;
            break;
        }
        match exit.reason {
            ExitReason::Exception => {
                warn!(
                    "Unhandled exception: syndrome={:#x} pa={:#x}",
                    exit.exception.syndrome, exit.exception.physical_address
                );
            }
            ExitReason::Canceled | ExitReason::VtimerActivated | ExitReason::Unknown => {}
        }
    }
    if !powered_off {
        warn!("Guest did not power off within {} exits", args.max_exits);
    }

    let result = read_u64_from_guest(&memory, result_addr)?;
    println!("The result is {}", result);

    vcpu.destroy()?;
    vm.destroy()?;
    Ok(())
}
