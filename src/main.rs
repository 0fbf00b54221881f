// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::debug;
use log::info;

use core_arbiter::{parse_cpulist, Config, CoreArbiterServer};

/// core_arbiter: exclusive CPU core allocation for cooperating processes.
///
/// The arbiter daemon isolates a set of managed cores into per-core cpusets
/// and hands them out one thread at a time to registered client threads,
/// ordered by per-process priority demand. Cores are reclaimed through a
/// shared-memory release protocol; processes that do not release in time
/// have a thread forcibly moved onto the shared unmanaged cpuset.
///
/// Needs write access to the cpuset filesystem, so it normally runs as
/// root.
#[derive(Debug, Parser)]
struct Opts {
    /// Path of the Unix-domain socket clients connect to.
    #[clap(long, default_value = "/var/run/core_arbiter/socket")]
    socket_path: String,

    /// Filename prefix for per-process shared-memory regions.
    #[clap(long, default_value = "/var/run/core_arbiter/shm_")]
    shared_mem_prefix: String,

    /// CPUs to manage exclusively, as a cpulist (e.g. "1-3,5"). Defaults
    /// to every CPU except 0.
    #[clap(long, default_value = "")]
    exclusive_cores: String,

    /// Root of the mounted cpuset filesystem.
    #[clap(long, default_value = "/sys/fs/cpuset")]
    cpuset_root: String,

    /// Milliseconds to wait for a voluntary core release before forcibly
    /// preempting the offending thread.
    #[clap(long, default_value = "10")]
    preemption_timeout_ms: u64,

    /// Increase log verbosity. Pass twice for trace output.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
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

    debug!("opts={:?}", &opts);

    let cfg = Config {
        socket_path: opts.socket_path,
        shared_mem_path_prefix: opts.shared_mem_prefix,
        exclusive_cores: parse_cpulist(&opts.exclusive_cores)
            .context("parsing --exclusive-cores")?,
        cpuset_root: opts.cpuset_root,
        preemption_timeout_ms: opts.preemption_timeout_ms,
        arbitrate_immediately: true,
    };

    // The handler only pokes the termination eventfd of the most recent
    // server; teardown happens on the main thread once the loop exits.
    ctrlc::set_handler(|| {
        info!("received shutdown signal");
        core_arbiter::request_termination();
    })
    .context("setting signal handler")?;

    let mut server = CoreArbiterServer::new(cfg)?;
    server.start_arbitration()?;
    info!("shutdown complete");
    Ok(())
}
