//! Halyard command-line driver
//!
//! Runs the collector stress workload and the archive + redefinition
//! scenario against a configurable VM.

mod commands;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use halyard_core::config::parse_size;
use halyard_core::{HeuristicKind, VmOptions};
use std::env;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "halyard")]
#[command(about = "Halyard VM driver: GC stress and class-archive scenarios", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    vm: VmFlags,

    #[command(subcommand)]
    command: Commands,
}

/// Launch configuration shared by every command
#[derive(Args)]
struct VmFlags {
    /// TOML file with VM options; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Heap size (e.g. 384M, 1G)
    #[arg(long, global = true)]
    heap: Option<String>,
    /// Region size (power of two, e.g. 256k)
    #[arg(long, global = true)]
    region_size: Option<String>,
    /// GC heuristic (passive, static, adaptive, aggressive, connected,
    /// generational, lru, continuous)
    #[arg(long, global = true)]
    heuristic: Option<HeuristicKind>,
    /// Verify the heap after every collector phase
    #[arg(long, global = true)]
    verify: bool,
    /// Inject evacuation allocation failures
    #[arg(long, global = true)]
    oom_evac_a_lot: bool,
    /// Concurrent GC worker threads
    #[arg(long, global = true)]
    gc_workers: Option<usize>,
}

impl VmFlags {
    fn options(&self) -> anyhow::Result<VmOptions> {
        let mut options = match &self.config {
            Some(path) => VmOptions::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => VmOptions::default(),
        };
        if let Some(heap) = &self.heap {
            options.heap_size = parse_size(heap)?;
        }
        if let Some(region) = &self.region_size {
            options.region_size = parse_size(region)?;
        }
        if let Some(kind) = self.heuristic {
            options.heuristics = kind;
        }
        if let Some(workers) = self.gc_workers {
            options.concurrent_workers = workers;
        }
        options.verify |= self.verify;
        options.oom_during_evac_a_lot |= self.oom_evac_a_lot;
        options.validate()?;
        Ok(options)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run an old-biased allocation workload and print GC statistics
    Stress {
        /// Allocation batches per worker
        #[arg(long, default_value_t = 200)]
        batches: usize,
        /// Mutator threads
        #[arg(long, default_value_t = 2)]
        workers: usize,
        /// Objects per batch kept until the end
        #[arg(long, default_value_t = 50)]
        long_lived: usize,
        /// Objects per batch dropped right away
        #[arg(long, default_value_t = 500)]
        short_lived: usize,
        /// Payload bytes per object
        #[arg(long, default_value = "256")]
        object_size: String,
        /// Drop the long-lived list and start a new one every N batches
        #[arg(long, value_name = "N")]
        replace_every: Option<usize>,
    },

    /// Write a class archive
    Dump {
        /// Output archive
        #[arg(short, long)]
        output: PathBuf,
        /// Class files to archive (defaults to the demo classes)
        classes: Vec<PathBuf>,
        /// Skip the demo object graph
        #[arg(long)]
        no_heap_objects: bool,
        /// Dump with uncompressed references
        #[arg(long)]
        uncompressed_refs: bool,
    },

    /// Map an archive, run the demo workload and redefine `B` mid-run
    Redefine {
        /// Archive written by `halyard dump`
        archive: PathBuf,
        /// Worker threads calling through the subclasses
        #[arg(long, default_value_t = 2)]
        workers: usize,
        /// Calls each worker makes before the redefinition is requested
        #[arg(long, default_value_t = 1000)]
        calls: usize,
    },

    /// Check an archive's header and checksum
    VerifyArchive {
        /// Archive to check
        archive: PathBuf,
        /// Expect uncompressed references
        #[arg(long)]
        uncompressed_refs: bool,
    },
}

fn init_logging() -> anyhow::Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::new().filter_or("HALYARD_LOG", "info"));
    if let Ok(precision) = env::var("HALYARD_LOG_WITH_TIME") {
        match precision.as_str() {
            "s" => builder.format_timestamp_secs(),
            "ms" => builder.format_timestamp_millis(),
            "us" => builder.format_timestamp_micros(),
            "ns" => builder.format_timestamp_nanos(),
            other => bail!(
                "invalid HALYARD_LOG_WITH_TIME precision, expected one of [s, ms, us, ns], got '{}'",
                other
            ),
        };
    } else {
        builder.format_timestamp(None);
    }
    builder.init();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    match cli.command {
        Commands::Stress {
            batches,
            workers,
            long_lived,
            short_lived,
            object_size,
            replace_every,
        } => commands::stress::execute(
            cli.vm.options()?,
            commands::stress::StressArgs {
                batches,
                workers,
                long_lived,
                short_lived,
                object_size: parse_size(&object_size)?,
                replace_every,
            },
        ),

        Commands::Dump {
            output,
            classes,
            no_heap_objects,
            uncompressed_refs,
        } => {
            let options = cli.vm.options()?;
            commands::dump::execute(commands::dump::DumpArgs {
                output,
                classes,
                heap_objects: !no_heap_objects,
                compressed_refs: !uncompressed_refs,
                region_size: options.effective_region_size(),
            })
        }

        Commands::Redefine {
            archive,
            workers,
            calls,
        } => {
            let mut options = cli.vm.options()?;
            options.archive = Some(archive);
            commands::redefine::execute(options, workers, calls)
        }

        Commands::VerifyArchive {
            archive,
            uncompressed_refs,
        } => commands::verify_archive::execute(&archive, !uncompressed_refs),
    }
}
