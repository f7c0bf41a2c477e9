mod commands;
mod util;

use std::process::{ExitCode, Termination};

use bcache_core::Registry;

/// Print main usage, with commands grouped by category.
fn bcache_usage() {
    let groups: &[(&str, &[(&str, &str)])] = &[
        ("Cache sets:", &[
            ("format", "Create a cache set over one or more cache devices"),
            ("list", "List cache sets registered in this process"),
        ]),
        ("I/O:", &[
            ("io", "Exercise the request pipeline and report statistics"),
        ]),
        ("Options:", &[
            ("set-option", "Validate a runtime option assignment"),
        ]),
        ("Miscellaneous:", &[
            ("version", "Display version"),
        ]),
    ];

    println!("bcache - block-device cache engine tool");
    println!("usage: bcache <command> [<args>]\n");

    for (heading, cmds) in groups {
        println!("{heading}");
        for (name, about) in *cmds {
            println!("  {name:<26}{about}");
        }
        println!();
    }
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        println!("missing command");
        bcache_usage();
        return ExitCode::from(1);
    }

    // The registry is process-scope: constructed here, passed down.
    let registry = Registry::new();

    let cmd = args[1].as_str();
    match cmd {
        "--help" | "help" => {
            bcache_usage();
            ExitCode::SUCCESS
        }
        "version" => {
            println!(env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        "format" => commands::cmd_format(&registry, args[1..].to_vec()).report(),
        "list" => commands::cmd_list(&registry, args[1..].to_vec()).report(),
        "io" => commands::cmd_io(&registry, args[1..].to_vec()).report(),
        "set-option" => commands::cmd_set_option(args[1..].to_vec()).report(),
        _ => {
            println!("Unknown command {cmd}");
            bcache_usage();
            ExitCode::from(1)
        }
    }
}
