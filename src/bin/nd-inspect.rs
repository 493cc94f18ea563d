//! Read-only inspector for persisted store files.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pdom::primitives::store::{FileHeader, StoreStats, FILE_HEADER_LEN};
use pdom::{Address, MemChunkStore, NdOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "nd-inspect",
    version,
    about = "Inspect a persisted store file without opening it for writing",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(help = "Path to the store file")]
    path: PathBuf,

    #[arg(
        long,
        env = "ND_OPTIONS",
        help = "TOML options file supplying the accepted version window"
    )]
    options: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Show header and allocator statistics")]
    Info,
    #[command(about = "Check header, checksum, block chain and version window")]
    Verify,
    #[command(about = "List non-null root slots")]
    Roots,
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn print_section(title: &str) {
    println!();
    println!("─── {} {}", title, "─".repeat(40usize.saturating_sub(title.len())));
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {:.<24} {}", name, value);
}

fn cmd_info(cli: &Cli, hdr: &FileHeader, stats: &StoreStats) {
    print_section("File");
    print_field("Path", cli.path.display());
    print_field("Version", hdr.version);
    print_field("Header", format!("{} bytes", FILE_HEADER_LEN));
    print_field("Data", format_bytes(hdr.data_len));
    print_field("CRC32", format!("{:08x}", hdr.crc32));

    print_section("Allocator");
    print_field("Live blocks", stats.live_blocks);
    print_field("Free blocks", stats.free_blocks);
}

fn cmd_verify(hdr: &FileHeader, options: &NdOptions) -> Result<(), Box<dyn Error>> {
    if !(options.min_version..=options.max_version).contains(&hdr.version) {
        return Err(format!(
            "version {} outside accepted window {}..={}; opening would recreate the file",
            hdr.version, options.min_version, options.max_version
        )
        .into());
    }
    println!("ok: header, checksum and block chain verified (version {})", hdr.version);
    Ok(())
}

fn cmd_roots(roots: &[Address]) {
    let mut any = false;
    for (slot, root) in roots.iter().enumerate() {
        if !root.is_null() {
            println!("slot {slot:>2}: {root}");
            any = true;
        }
    }
    if !any {
        println!("no roots set");
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let options = match &cli.options {
        Some(path) => NdOptions::load(path)?,
        None => NdOptions::default(),
    };
    let (hdr, stats, roots) = MemChunkStore::inspect(&cli.path)?;
    match cli.command {
        Command::Info => cmd_info(&cli, &hdr, &stats),
        Command::Verify => cmd_verify(&hdr, &options)?,
        Command::Roots => cmd_roots(&roots),
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
