use std::{
    env,
    path::PathBuf,
    process,
    sync::{Arc, atomic::Ordering},
};

use dotenv::dotenv;
use eyre::bail;
use mcsweep::{
    config::Config,
    database::{Database, MemoryStore, ServerStore},
    exclude, rescan,
    scanner::{
        ScanContext, scan_ranges,
        targets::{Ipv4Range, Ipv4Ranges, ScanRange, ScanRanges, parse_range},
    },
    targets_file,
    terminal_colors::*,
    tracing::init_tracing,
};
use tracing::info;

const USAGE: &str = "usage:
    mcsweep <range> [--config <path>]            scan a range like 10.0.0.0/24 or 10.0.0.1-10.0.0.5
    mcsweep --targets <file> [--config <path>]   scan around the servers listed in a file
    mcsweep --rescan [--config <path>]           ping known servers again";

#[derive(Debug, PartialEq)]
enum Command {
    Range(Ipv4Range),
    TargetsFile(PathBuf),
    Rescan,
}

#[derive(Debug, PartialEq)]
struct Args {
    command: Command,
    config_path: PathBuf,
}

fn parse_args(args: &[String]) -> eyre::Result<Args> {
    let mut command = None;
    let mut config_path = PathBuf::from("config.toml");

    let mut args = args.iter();
    while let Some(arg) = args.next() {
        let next = match arg.as_str() {
            "--config" => {
                let Some(path) = args.next() else {
                    bail!("--config needs a path");
                };
                config_path = PathBuf::from(path);
                continue;
            }
            "--targets" => {
                let Some(path) = args.next() else {
                    bail!("--targets needs a file");
                };
                Command::TargetsFile(PathBuf::from(path))
            }
            "--rescan" => Command::Rescan,
            "-h" | "--help" => bail!("{USAGE}"),
            other if other.starts_with('-') => bail!("unknown option {other}"),
            range => Command::Range(parse_range(range)?),
        };
        if command.replace(next).is_some() {
            bail!("only one of <range>, --targets, and --rescan can be given");
        }
    }

    let Some(command) = command else {
        bail!("nothing to scan");
    };
    Ok(Args {
        command,
        config_path,
    })
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv().ok();

    let args = env::args().skip(1).collect::<Vec<_>>();
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{RED}{err}{RESET}\n\n{USAGE}");
            process::exit(2);
        }
    };

    let config = Config::load(&args.config_path)?;
    init_tracing(&config);
    info!("Logging initialized");
    config.log_summary();

    let exclude_ranges = match &config.exclude_file {
        Some(path) => {
            println!("parsing exclude file");
            let ranges = exclude::parse_file(path)?;
            println!(
                "excluding {} ips ({} ranges)",
                ranges.count(),
                ranges.ranges().len()
            );
            ranges
        }
        None => Ipv4Ranges::default(),
    };

    let mut ctx = ScanContext::new(config);

    let has_ended = ctx.has_ended.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("{YELLOW}Stopping, waiting for in-flight writes...{RESET}");
            has_ended.store(true, Ordering::Relaxed);
        }
    });

    match ctx.config.mongodb_uri.clone() {
        Some(mongodb_uri) => {
            let database = Database::connect(&mongodb_uri, &ctx.config).await?;
            run(&mut ctx, args.command, Arc::new(database), &exclude_ranges).await?;
        }
        None => {
            run(
                &mut ctx,
                args.command,
                Arc::new(MemoryStore::new()),
                &exclude_ranges,
            )
            .await?;
        }
    }

    println!("done");
    Ok(())
}

async fn run<S: ServerStore>(
    ctx: &mut ScanContext,
    command: Command,
    store: Arc<S>,
    exclude_ranges: &Ipv4Ranges,
) -> eyre::Result<()> {
    match command {
        Command::Range(range) => {
            let mut ranges = ScanRanges::new();
            ranges.extend(vec![ScanRange::from_ipv4_range(
                range,
                ctx.config.target.port,
            )]);
            scan_ranges(ctx, ranges, exclude_ranges, store).await?;
        }
        Command::Rescan => {
            let mut ranges = ScanRanges::new();
            ranges.extend(rescan::get_ranges(store.as_ref(), &ctx.config.rescan).await?);
            if ranges.is_empty() {
                println!("nothing to rescan");
                return Ok(());
            }
            scan_ranges(ctx, ranges, exclude_ranges, store).await?;
        }
        Command::TargetsFile(path) => {
            targets_file::run(ctx, &path, store, exclude_ranges).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;

    fn args(args: &[&str]) -> eyre::Result<Args> {
        parse_args(&args.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(
            args(&["10.0.0.0/30"]).unwrap(),
            Args {
                command: Command::Range(Ipv4Range {
                    start: Ipv4Addr::new(10, 0, 0, 0),
                    end: Ipv4Addr::new(10, 0, 0, 3),
                }),
                config_path: PathBuf::from("config.toml"),
            }
        );
        assert_eq!(
            args(&["--targets", "ips.txt", "--config", "other.toml"]).unwrap(),
            Args {
                command: Command::TargetsFile(PathBuf::from("ips.txt")),
                config_path: PathBuf::from("other.toml"),
            }
        );
        assert_eq!(args(&["--rescan"]).unwrap().command, Command::Rescan);
    }

    #[test]
    fn test_bad_args() {
        assert!(args(&[]).is_err());
        assert!(args(&["10.0.0.0/33"]).is_err());
        assert!(args(&["10.0.0.0/24", "--rescan"]).is_err());
        assert!(args(&["--targets"]).is_err());
        assert!(args(&["--bogus"]).is_err());
    }
}
