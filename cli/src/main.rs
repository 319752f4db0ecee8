//! demux CLI — inspect engine defaults.
//!
//! Usage:
//! ```bash
//! demux info
//! demux version
//! demux help
//! ```

use std::env;
use std::process;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "info" => cmd_info(),
        "version" | "--version" | "-V" => {
            println!("demux {}", env!("CARGO_PKG_VERSION"));
        }
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    println!("demux {}", env!("CARGO_PKG_VERSION"));
    println!("Deterministic ingestion and dispatch engine for reorg-capable chains\n");
    println!("USAGE:");
    println!("    demux <COMMAND>\n");
    println!("COMMANDS:");
    println!("    info     Show engine configuration defaults");
    println!("    version  Print version");
    println!("    help     Print this help");
}

fn cmd_info() {
    println!("demux v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default start block: 1");
    println!("  Default poll interval: 250 ms");
    println!("  Default history window: 180 blocks");
    println!("  Default retry budget: 10 attempts/block");
    println!("  Default effect run mode: fire-and-forget");
    println!("  Datastore backends: memory, SQLite (feature: sqlite)");
}
