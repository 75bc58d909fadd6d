// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

mod config;
mod engine;
mod pools;
mod store;
mod workload;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use waypool_utils::{CacheTopology, ResctrlFs};

use crate::config::Config;
use crate::engine::AllocationContext;
use crate::store::JsonStore;
use crate::workload::Workload;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output, including computed masks and commit steps. Give
    /// multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file to use instead of the system one.
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Partition the root and infra groups")]
    Setup,
    #[command(about = "Allocate cache ways and bandwidth for a workload")]
    Enforce {
        #[arg(short, long, help = "Workload name, doubles as the group name")]
        id: String,
        #[arg(
            long = "core",
            value_delimiter(','),
            help = "Core ids the workload runs on"
        )]
        cores: Vec<String>,
        #[arg(
            long = "task",
            value_delimiter(','),
            help = "Process ids belonging to the workload"
        )]
        tasks: Vec<String>,
        #[arg(long, conflicts_with = "policy", help = "Upper way count")]
        max_ways: Option<u32>,
        #[arg(long, conflicts_with = "policy", help = "Guaranteed way count")]
        min_ways: Option<u32>,
        #[arg(short, long, help = "Named policy supplying the way counts")]
        policy: Option<String>,
        #[arg(long = "mba", help = "Memory bandwidth percent (MBps in mba_MBps mode)")]
        mba_percent: Option<u32>,
    },
    #[command(about = "Tear a workload down and free its ways")]
    Release {
        #[arg(short, long, help = "Workload name")]
        id: String,
    },
    #[command(about = "Show all workload records")]
    List,
    #[command(about = "Show the computed pool layout")]
    Pools,
    #[command(about = "Show resctrl capabilities")]
    Info,
}

fn build_context(cfg: Config) -> Result<AllocationContext> {
    let topo = CacheTopology::from_sysfs(&cfg.resctrl.level)?;
    let fs = match &cfg.resctrl.mount {
        Some(mount) => ResctrlFs::at(mount, topo.nr_cpus())?,
        None => ResctrlFs::mount(topo.nr_cpus())?,
    };
    let store = Box::new(JsonStore::open(&cfg.store.path)?);
    Ok(AllocationContext::new(cfg, fs, topo, store)?)
}

fn cmd_enforce(ctx: &mut AllocationContext, workload: Workload) -> Result<()> {
    let outcome = ctx.enforce(workload)?;
    println!("group {}", outcome.group_name);
    for (level, line) in &outcome.group.cache_schemata {
        for alloc in line {
            println!(
                "  {}:{}={} (ways {})",
                level,
                alloc.cache_id,
                alloc.mask,
                alloc.mask.to_human_string()
            );
        }
    }
    for (level, line) in &outcome.group.mba_schemata {
        for alloc in line {
            println!("  {}:{}={}", level, alloc.cache_id, alloc.value);
        }
    }
    for name in outcome.changed.keys() {
        println!("shrunk {name} to make room");
    }
    Ok(())
}

fn cmd_list(ctx: &AllocationContext) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&ctx.workloads())?);
    Ok(())
}

fn cmd_pools(ctx: &AllocationContext) {
    let layout = ctx.layout();
    println!(
        "{} ways per cache at level {}",
        layout.cbm_len(),
        ctx.config().resctrl.level
    );
    println!("os region ({} ways):", ctx.config().os.cache_ways);
    for (cache_id, mask) in layout.os_region() {
        println!("  cache {cache_id}: {mask} (ways {})", mask.to_human_string());
    }
    for (kind, pool) in layout.pools() {
        println!(
            "{} pool ({} ways, cpus {}):",
            kind,
            pool.ways,
            pool.all_cpus.to_human_string()
        );
        for (cache_id, mask) in &pool.masks {
            let cpus = pool
                .cpus
                .get(cache_id)
                .map(|c| c.to_human_string())
                .unwrap_or_default();
            println!(
                "  cache {cache_id}: {mask} (ways {}, cpus {cpus})",
                mask.to_human_string()
            );
        }
    }
}

fn cmd_info(ctx: &AllocationContext) {
    let fs = ctx.resctrl();
    println!("resctrl at {}", fs.root().display());
    println!(
        "bandwidth mode: {}",
        if fs.mba_mbps() { "MBps" } else { "percent" }
    );
    for (level, info) in fs.info() {
        println!(
            "{}: {} ways (mask {}), at least {} per group, {} classes of service",
            level, info.cbm_len, info.cbm_mask, info.min_cbm_bits, info.num_closids
        );
    }
    let topo = ctx.topology();
    for (cache_id, node) in topo.caches() {
        println!(
            "{} instance {} serves cpus {}",
            topo.level(),
            cache_id,
            node.shared_cpus.to_human_string()
        );
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let llv = match cli.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let cfg = Config::load(cli.config.as_deref())?;
    let mut ctx = build_context(cfg)?;

    match cli.command {
        Commands::Setup => {
            ctx.setup()?;
            println!("partitioning in place");
        }
        Commands::Enforce {
            id,
            cores,
            tasks,
            max_ways,
            min_ways,
            policy,
            mba_percent,
        } => {
            let workload = Workload {
                id,
                core_ids: cores,
                task_ids: tasks,
                max_ways,
                min_ways,
                policy,
                mba_percent,
                ..Default::default()
            };
            cmd_enforce(&mut ctx, workload)?;
        }
        Commands::Release { id } => {
            ctx.release(&id)?;
            println!("released {id}");
        }
        Commands::List => cmd_list(&ctx)?,
        Commands::Pools => cmd_pools(&ctx),
        Commands::Info => cmd_info(&ctx),
    }
    Ok(())
}
