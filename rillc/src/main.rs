//! Rill MIR driver CLI
//!
//! Consumes typed input modules (JSON, as handed over by the front-end),
//! runs the optimization pipeline, and either prints the resulting MIR or
//! partitions it into codegen units and writes per-unit LLVM IR.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use rillc::codegen::{CodegenPartitioner, ObjectCache, PartitionOptions};
use rillc::mir::optimize::ProfileData;
use rillc::mir::{Builder, OptLevel, PassManager, print_module};
use rillc::{CompileError, Result};

#[derive(Parser)]
#[command(name = "rillc", version, about = "Rill compiler - MIR pipeline driver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lower a typed module and run the optimization pipeline
    Opt {
        /// Typed input module (JSON)
        file: PathBuf,
        /// Optimization level (0-3)
        #[arg(long, short = 'O', default_value_t = 2)]
        opt_level: u8,
        /// Print the optimized MIR instead of the pass statistics
        #[arg(long)]
        print_mir: bool,
        /// Profile data consumed by the inliner and block layout (JSON)
        #[arg(long)]
        profile: Option<PathBuf>,
    },
    /// Optimize, partition into codegen units, and write per-unit LLVM IR
    Cgu {
        /// Typed input module (JSON)
        file: PathBuf,
        /// Requested number of codegen units
        #[arg(long, default_value_t = 16)]
        units: usize,
        /// Optimization level (0-3)
        #[arg(long, short = 'O', default_value_t = 2)]
        opt_level: u8,
        /// Directory for the generated .ll files
        #[arg(long)]
        out: Option<PathBuf>,
        /// Object cache directory; cached units are reported and skipped
        #[arg(long)]
        cache: Option<PathBuf>,
        /// Target triple override
        #[arg(long)]
        target: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Opt {
            file,
            opt_level,
            print_mir,
            profile,
        } => opt_command(&file, opt_level, print_mir, profile.as_deref()),
        Command::Cgu {
            file,
            units,
            opt_level,
            out,
            cache,
            target,
        } => cgu_command(&file, units, opt_level, out.as_deref(), cache.as_deref(), target),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn load_and_optimize(
    file: &Path,
    opt_level: u8,
    profile: Option<&Path>,
) -> Result<(rillc::mir::Module, rillc::mir::OptimizationStats)> {
    let source = std::fs::read_to_string(file)?;
    let input: rillc::tir::Module = serde_json::from_str(&source)?;

    let mut module = Builder::new().build(&input)?;

    let mut manager = PassManager::for_level(OptLevel::from_number(opt_level));
    if let Some(profile_path) = profile {
        let text = std::fs::read_to_string(profile_path)?;
        let data: ProfileData = serde_json::from_str(&text)?;
        manager.set_profile_data(data);
    }

    let stats = manager.run(&mut module);

    let filename = file.display().to_string();
    let errors = rillc::error::report_diagnostics(&filename, None, manager.diagnostics());
    if errors > 0 {
        return Err(CompileError::Analysis { count: errors });
    }

    Ok((module, stats))
}

fn opt_command(
    file: &Path,
    opt_level: u8,
    print_mir: bool,
    profile: Option<&Path>,
) -> Result<()> {
    let (module, stats) = load_and_optimize(file, opt_level, profile)?;

    if print_mir {
        print!("{}", print_module(&module));
    } else {
        println!(
            "{}: {} function(s), {} fixed-point iteration(s)",
            module.name,
            module.functions.len(),
            stats.iterations
        );
        for (pass, count) in &stats.pass_counts {
            println!("  {pass}: {count}");
        }
    }
    Ok(())
}

fn cgu_command(
    file: &Path,
    units: usize,
    opt_level: u8,
    out: Option<&Path>,
    cache: Option<&Path>,
    target: Option<String>,
) -> Result<()> {
    let (module, _) = load_and_optimize(file, opt_level, None)?;

    let partitioner = CodegenPartitioner::new(PartitionOptions {
        num_cgus: units,
        target_triple: target,
    });
    let result = partitioner.partition(&module)?;
    let cache = cache.map(ObjectCache::new);

    for cgu in &result.cgus {
        let object_name = cgu.object_name(&module.name);
        let cached = cache
            .as_ref()
            .is_some_and(|c| c.is_cached(&object_name));
        println!(
            "cgu{} {} {} function(s) [{}]",
            cgu.cgu_index,
            cgu.fingerprint,
            cgu.function_names.len(),
            if cached { "cached" } else { "compile" }
        );
        if cached {
            continue;
        }
        if let Some(out_dir) = out {
            std::fs::create_dir_all(out_dir)?;
            let ll_path = out_dir.join(format!("{}.cgu{}.ll", module.name, cgu.cgu_index));
            std::fs::write(ll_path, &cgu.llvm_ir)?;
        }
    }
    Ok(())
}
