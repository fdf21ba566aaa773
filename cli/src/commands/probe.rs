//! Probe command implementation

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use conduit_interop::backend::{PrimaryApi, PrimaryDevice, SecondaryApi};
use conduit_interop::import::check_same_adapter;
use conduit_interop::loopback::LoopbackPlatform;
use conduit_interop::plan_queues;
use conduit_shared::{AdapterLuid, PhysicalDeviceInfo, QueueCapabilities, QueueRequest};

use crate::config::{Backend, BenchConfig};
use crate::output;

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Queue capabilities to plan for, repeatable (e.g., "transfer",
    /// "graphics|compute")
    #[arg(short, long = "queue", default_value = "transfer")]
    pub queues: Vec<QueueCapabilities>,

    /// Backend: loopback or native
    #[arg(short, long)]
    pub backend: Option<Backend>,
}

pub fn run(args: ProbeArgs, mut config: BenchConfig) -> Result<()> {
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    let requests: Vec<QueueRequest> = args.queues.iter().copied().map(QueueRequest::new).collect();

    match config.backend {
        Backend::Loopback => {
            let platform = LoopbackPlatform::single_adapter();
            probe(&platform.primary(), &platform.secondary(), &requests)
        }
        Backend::Native => probe_native(&config, &requests),
    }
}

#[cfg(all(windows, feature = "native"))]
fn probe_native(config: &BenchConfig, requests: &[QueueRequest]) -> Result<()> {
    use conduit_interop::d3d12::D3D12Api;
    use conduit_interop::vulkan::VulkanApi;

    let secondary = VulkanApi::new().context("Failed to initialize Vulkan")?;
    probe(&D3D12Api::new(config.debug_layer), &secondary, requests)
}

#[cfg(not(all(windows, feature = "native")))]
fn probe_native(_config: &BenchConfig, _requests: &[QueueRequest]) -> Result<()> {
    anyhow::bail!("The native backend needs Windows and a build with `--features native`")
}

fn probe<PA, SA>(primary: &PA, secondary: &SA, requests: &[QueueRequest]) -> Result<()>
where
    PA: PrimaryApi,
    SA: SecondaryApi,
{
    let device = primary
        .open_adapter(0)
        .context("Failed to open primary adapter 0")?;
    let identity = device.adapter_identity();
    output::heading("Primary adapter");
    println!("  {} ({})", device.adapter_name(), identity);
    drop(device);

    let devices = secondary
        .physical_devices()
        .context("Failed to enumerate secondary devices")?;
    println!();
    output::heading("Secondary devices");
    for (index, info) in devices.iter().enumerate() {
        print_device(index, info, identity);
    }

    println!();
    match plan_queues(&devices, requests) {
        Ok(plan) => {
            output::heading("Queue plan");
            for family in &plan.families {
                println!(
                    "  family {}: {} x{}",
                    family.family_index, family.capabilities, family.queue_count
                );
            }
            let chosen = &devices[plan.physical_index];
            match check_same_adapter(identity, chosen.luid) {
                Ok(()) => output::success(&format!("{} shares the primary adapter", chosen.name)),
                Err(e) => output::warning(&e.to_string()),
            }
        }
        Err(e) => output::warning(&format!("No queue plan: {}", e)),
    }
    Ok(())
}

fn print_device(index: usize, info: &PhysicalDeviceInfo, primary: AdapterLuid) {
    let luid = match info.luid {
        Some(luid) if luid == primary => luid.to_string().green().to_string(),
        Some(luid) => luid.to_string(),
        None => "no LUID".dimmed().to_string(),
    };
    println!("  [{}] {} ({})", index, info.name, luid);
    for (family, queue_family) in info.queue_families.iter().enumerate() {
        println!(
            "      family {}: {} x{}",
            family, queue_family.capabilities, queue_family.queue_count
        );
    }
}
