use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use beholder_core::format::cps::Cps;
use beholder_core::format::inf::Inf;
use bytes::Bytes;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(clap::Parser, Debug)]
struct Args {
    #[clap(subcommand)]
    action: BduAction,
}

#[derive(clap::Subcommand, Debug)]
enum BduAction {
    /// Work with compressed resource files
    #[clap(subcommand)]
    Cps(CpsCommand),
    /// Work with level-script resources
    #[clap(subcommand)]
    Inf(InfCommand),
}

#[derive(clap::Subcommand, Debug)]
enum CpsCommand {
    /// Decompress a resource file to disk
    Decompress {
        cps_path: PathBuf,
        output_path: PathBuf,
    },
}

#[derive(clap::Subcommand, Debug)]
enum InfCommand {
    /// Print the level header, wall mappings and monster placements
    Info { inf_path: PathBuf },
    /// List the level's triggers
    Triggers { inf_path: PathBuf },
    /// Decompile the level scripts to pseudo-assembly
    Decompile {
        inf_path: PathBuf,
        /// Also print the decoded branch records
        #[clap(short, long)]
        branches: bool,
    },
}

fn cps_command(command: CpsCommand) -> Result<()> {
    match command {
        CpsCommand::Decompress {
            cps_path,
            output_path,
        } => {
            let data = std::fs::read(&cps_path)
                .with_context(|| format!("Reading {}", cps_path.display()))?;
            let cps = Cps::from_bytes(&data).context("Parsing CPS file")?;
            std::fs::write(output_path, cps.data()).context("Writing decompressed data")?;
            Ok(())
        }
    }
}

fn load_inf(path: &Path) -> Result<Inf> {
    let data = std::fs::read(path).with_context(|| format!("Reading {}", path.display()))?;
    // level scripts normally ship compressed, but a decompressed buffer may
    // be fed back in (e.g. the output of `cps decompress`)
    match Inf::from_cps_bytes(&data) {
        Ok(inf) => Ok(inf),
        Err(_) => Inf::new(Bytes::from(data)).context("Parsing level script"),
    }
}

fn inf_command(command: InfCommand) -> Result<()> {
    match command {
        InfCommand::Info { inf_path } => {
            let inf = load_inf(&inf_path)?;
            println!("maze:    {}", inf.maze_name);
            println!("tileset: {}", inf.tileset_name);
            println!("palette: {}", inf.palette_name);
            for graphics in &inf.monster_graphics {
                if !graphics.name.is_empty() {
                    println!(
                        "monster graphics: {} (compression {})",
                        graphics.name, graphics.compression
                    );
                }
            }
            println!();
            println!("wall mappings:");
            for mapping in inf.wall_mappings.values() {
                println!(
                    "  {:3}: set {:2} decoration 0x{:02x} events 0x{:02x} flags 0x{:02x} {} {}",
                    mapping.index,
                    mapping.wall_set,
                    mapping.decoration,
                    mapping.event_mask,
                    mapping.flags,
                    mapping.cps_name,
                    mapping.dat_name,
                );
            }
            println!();
            println!("decoration resources: {:?}", inf.decoration_resources());
            Ok(())
        }
        InfCommand::Triggers { inf_path } => {
            let inf = load_inf(&inf_path)?;
            for (index, trigger) in inf.triggers().iter().enumerate() {
                println!(
                    "${:02x}: [{:2},{:2}] flags 0x{:02x} (class {:2}) -> _0x{:04x}",
                    index,
                    trigger.x,
                    trigger.y,
                    trigger.flags,
                    trigger.collapsed_flags,
                    trigger.address,
                );
            }
            Ok(())
        }
        InfCommand::Decompile { inf_path, branches } => {
            let inf = load_inf(&inf_path)?;
            let result = inf.decompile().context("Decompiling level script")?;
            print!("{}", result.text);
            if branches {
                println!();
                println!("; branches:");
                for record in &result.branches {
                    println!(
                        ";   _0x{:04x} -> _0x{:04x} ({:?})",
                        record.source, record.target, record.kind
                    );
                }
            }
            Ok(())
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .compact()
        .init();
    let args = Args::parse();
    match args.action {
        BduAction::Cps(cmd) => cps_command(cmd),
        BduAction::Inf(cmd) => inf_command(cmd),
    }
}
