//! Command line driver: parse a tile IR file, lower it and print the result.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tilegen::codegen;
use tilegen::core::CodegenConfig;
use tilegen::target::target_from_name;
use tilegen::tile_ir::parse_module;

/// Lower tile IR kernels to low-level IR.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Input `.tir` file
    input: PathBuf,

    /// Target: sm70, sm80, sm90, gfx90a or host
    #[arg(short, long, default_value = "sm80")]
    target: String,

    /// Warps per thread block (overrides TILEGEN_NUM_WARPS)
    #[arg(long)]
    num_warps: Option<u32>,

    /// Lower load_async through synchronous loads
    #[arg(long)]
    no_async_copy: bool,

    /// Skip verification of the produced IR
    #[arg(long)]
    no_verify: bool,

    /// Print the parsed tile IR before the lowered module
    #[arg(long)]
    print_ir: bool,

    /// Print lowering statistics to stderr
    #[arg(long)]
    stats: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let source = std::fs::read_to_string(&cli.input)
        .map_err(|e| format!("failed to read {}: {e}", cli.input.display()))?;

    let mut config = CodegenConfig::from_env();
    if let Some(n) = cli.num_warps {
        config = config.with_num_warps(n);
    }
    if cli.no_async_copy {
        config = config.with_async_copy(false);
    }
    if cli.no_verify {
        config = config.with_verify(false);
    }
    let target = target_from_name(&cli.target)?;

    let parsed = parse_module(&source)?;
    if cli.print_ir {
        println!("{}", parsed.module);
    }
    let compiled = codegen::compile(&parsed, target.as_ref(), &config)?;
    print!("{}", compiled.module);

    if cli.stats {
        eprint!("{}", compiled.stats);
    }
    Ok(())
}
