//! respool command-line front-end
//!
//! Wires the environment, a JSON configuration file and the baseline exec
//! worker into a running pool master.

use anyhow::{anyhow, Result};
use respool::config::{FileConfigLoader, PoolOptions};
use respool::worker::ExecWorker;
use respool::{logging, Master};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;

const DEFAULT_CONFIG_PATH: &str = "respool.json";

struct CliOptions {
    config: PathBuf,
    environment: Option<String>,
    pidfile: Option<PathBuf>,
    worker_cmd: Option<String>,
    handle_winch: bool,
    help: bool,
}

impl CliOptions {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut options = Self {
            config: PathBuf::from(DEFAULT_CONFIG_PATH),
            environment: None,
            pidfile: None,
            worker_cmd: None,
            handle_winch: false,
            help: false,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    options.config = PathBuf::from(required_value(&arg, args.next())?);
                }
                "-E" | "--environment" => {
                    options.environment = Some(required_value(&arg, args.next())?);
                }
                "-p" | "--pidfile" => {
                    options.pidfile = Some(PathBuf::from(required_value(&arg, args.next())?));
                }
                "-C" | "--worker-cmd" => {
                    options.worker_cmd = Some(required_value(&arg, args.next())?);
                }
                "--winch" => options.handle_winch = true,
                "-h" | "--help" => options.help = true,
                other => return Err(anyhow!("unknown argument '{}'", other)),
            }
        }

        Ok(options)
    }
}

fn required_value(flag: &str, value: Option<String>) -> Result<String> {
    value.ok_or_else(|| anyhow!("{} requires a value", flag))
}

fn main() -> Result<()> {
    let cli = match CliOptions::parse(env::args().skip(1)) {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("Error: {err}");
            print_usage();
            process::exit(2);
        }
    };

    if cli.help {
        print_usage();
        return Ok(());
    }

    logging::init(&logging::LogConfig::from_env());

    let mut options = PoolOptions::from_env();
    if cli.environment.is_some() {
        options.environment = cli.environment;
    }
    if cli.handle_winch {
        options.handle_winch = true;
    }

    let worker_cmd = cli
        .worker_cmd
        .or_else(|| env::var("RESPOOL_WORKER_COMMAND").ok())
        .ok_or_else(|| {
            anyhow!(
                "no worker command configured; pass -C/--worker-cmd or set \
                 RESPOOL_WORKER_COMMAND (embedders register their own worker kinds instead)"
            )
        })?;

    let loader = FileConfigLoader::new(cli.config);
    let mut master = Master::new(Box::new(loader), options)?;
    master.register_default(ExecWorker::factory(worker_cmd));

    if let Some(pidfile) = &cli.pidfile {
        write_pidfile(pidfile, master.master_pid().as_raw())?;
    }

    let result = master.run();

    if let Some(pidfile) = &cli.pidfile {
        fs::remove_file(pidfile).ok();
    }

    result
}

fn write_pidfile(path: &PathBuf, pid: i32) -> Result<()> {
    fs::write(path, format!("{pid}\n"))
        .map_err(|err| anyhow!("failed to write pidfile {}: {}", path.display(), err))
}

fn print_usage() {
    println!("respool - worker-pool supervisor for queue-backed job workers");
    println!();
    println!("Usage: respool [options]");
    println!();
    println!("Options:");
    println!("  -c, --config PATH       Pool configuration file (default: {DEFAULT_CONFIG_PATH})");
    println!("  -E, --environment NAME  Environment key for the configuration file");
    println!("  -p, --pidfile PATH      Write the master pid to PATH");
    println!("  -C, --worker-cmd CMD    Command each worker execs (or RESPOOL_WORKER_COMMAND)");
    println!("      --winch             Scale the pool to zero on SIGWINCH");
    println!("  -h, --help              Show this help message");
    println!();
    println!("Signals:");
    println!("  HUP    reload configuration, reopen logs, recycle workers");
    println!("  QUIT   graceful shutdown (immediate when TERM_CHILD is set)");
    println!("  INT    graceful worker shutdown, master exits without waiting");
    println!("  TERM   shutdown per TERM_BEHAVIOR");
    println!("  WINCH  scale to zero (only with --winch)");
    println!("  USR1, USR2, CONT are forwarded to every worker");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliOptions> {
        CliOptions::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_defaults() {
        let cli = parse(&[]).unwrap();
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(cli.environment.is_none());
        assert!(cli.pidfile.is_none());
        assert!(!cli.handle_winch);
        assert!(!cli.help);
    }

    #[test]
    fn test_parse_all_flags() {
        let cli = parse(&[
            "-c",
            "pool.json",
            "-E",
            "production",
            "-p",
            "/tmp/respool.pid",
            "-C",
            "rake resque:work",
            "--winch",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("pool.json"));
        assert_eq!(cli.environment.as_deref(), Some("production"));
        assert_eq!(cli.pidfile, Some(PathBuf::from("/tmp/respool.pid")));
        assert_eq!(cli.worker_cmd.as_deref(), Some("rake resque:work"));
        assert!(cli.handle_winch);
    }

    #[test]
    fn test_parse_missing_value_is_an_error() {
        assert!(parse(&["-c"]).is_err());
        assert!(parse(&["--environment"]).is_err());
    }

    #[test]
    fn test_parse_unknown_flag_is_an_error() {
        assert!(parse(&["--bogus"]).is_err());
    }
}
