use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};
use nix::sys::signal::{signal, SigHandler, Signal};

mod cgi;
mod config;
mod config_parser;
mod conn;
mod error;
mod handler;
mod headers;
mod listener;
mod mime;
mod poller;
mod request;
mod response;
mod server;
mod uri;

use server::Server;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

#[derive(Debug, Default)]
struct Options {
    config_file: Option<String>,
    show_help: bool,
    verbose: bool,
}

fn usage(argv0: &str) {
    print!(
        "usage: {} [options] [config_file]\n\n\
         options:\n\
         \t-c <file>   Specify configuration file\n\
         \t-v          Enable verbose logging\n\
         \t-h          Display this help message\n\n\
         The config file can be given with -c or as a positional argument.\n\
         Without one, a built-in default configuration is used.\n",
        argv0
    );
}

fn parse_commandline() -> Result<Options> {
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" => {
                let file = args.next().ok_or_else(|| anyhow!("missing file after -c"))?;
                if options.config_file.is_some() {
                    return Err(anyhow!("config file specified more than once"));
                }
                options.config_file = Some(file);
            }
            "-v" => options.verbose = true,
            "-h" => options.show_help = true,
            positional if !positional.starts_with('-') => {
                if options.config_file.is_some() {
                    return Err(anyhow!(
                        "config file specified both with -c and as a positional argument"
                    ));
                }
                options.config_file = Some(positional.to_string());
            }
            unknown => return Err(anyhow!("unknown argument `{}'", unknown)),
        }
    }
    Ok(options)
}

fn main() {
    let argv0 = std::env::args()
        .next()
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());

    let options = match parse_commandline() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{}: {}", env!("CARGO_PKG_NAME"), e);
            usage(&argv0);
            std::process::exit(1);
        }
    };
    if options.show_help {
        usage(&argv0);
        return;
    }

    env_logger::Builder::from_default_env()
        .filter_level(if options.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    if let Err(e) = run(&options) {
        log::error!("{}: {:#}", env!("CARGO_PKG_NAME"), e);
        std::process::exit(1);
    }
}

fn run(options: &Options) -> Result<()> {
    // SIGINT/SIGTERM flip the run flag for a graceful drain; a dead client
    // must not take the process down with SIGPIPE.
    unsafe {
        signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
        signal(Signal::SIGINT, SigHandler::Handler(stop_running))?;
        signal(Signal::SIGTERM, SigHandler::Handler(stop_running))?;
    }

    let blocks = match &options.config_file {
        Some(file) => config_parser::load(file)?,
        None => {
            log::info!("no configuration file given, using built-in defaults");
            let mut blocks = config::default_config();
            config::finalize(&mut blocks)?;
            blocks
        }
    };

    let mut server = Server::new(blocks)?;
    log::info!("{}/{} ready", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    while is_running() {
        server.poll_iteration();
    }

    log::info!("shutting down");
    server.shutdown();
    Ok(())
}
