// Copyright © 2024 The Kestrel Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use clap::{Arg, ArgAction, Command};
use log::{info, LevelFilter};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::path::Path;
use std::process;
use std::thread;
use thiserror::Error;
use vmm::config::MachineConfig;
use vmm::Machine;

#[derive(Error, Debug)]
enum Error {
    #[error("Error parsing config: {0}")]
    ParsingConfig(#[source] vmm::config::Error),

    #[error("Error creating machine: {0}")]
    CreateMachine(#[source] vmm::Error),

    #[error("Error running machine: {0}")]
    RunMachine(#[source] vmm::Error),

    #[error("Error registering signal handlers: {0}")]
    RegisterSignals(#[source] std::io::Error),
}

fn create_app() -> Command {
    Command::new("kestrel")
        .version(env!("CARGO_PKG_VERSION"))
        .author("The Kestrel Authors")
        .about("Launch a kestrel virtual machine")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Machine configuration file")
                .value_name("FILE")
                .required(true),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Increase logging verbosity"),
        )
}

fn start_machine(config_path: &Path) -> Result<(), Error> {
    let config = MachineConfig::parse_file(config_path).map_err(Error::ParsingConfig)?;
    let mut machine = Machine::new(config).map_err(Error::CreateMachine)?;

    // Ctrl-C and SIGTERM quit the machine through the same exit event
    // a fatal vCPU error uses.
    let mut signals =
        Signals::new([SIGINT, SIGTERM]).map_err(Error::RegisterSignals)?;
    let exit_evt = machine.exit_handle().map_err(Error::CreateMachine)?;
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if signals.forever().next().is_some() {
                info!("termination signal received, quitting");
                exit_evt.write(1).ok();
            }
        })
        .map_err(Error::RegisterSignals)?;

    machine.run().map_err(Error::RunMachine)?;
    machine.wait().map_err(Error::RunMachine)?;
    machine.quit();
    Ok(())
}

fn main() {
    let matches = create_app().get_matches();

    let log_level = match matches.get_count("v") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let config_path = matches
        .get_one::<String>("config")
        .expect("config is a required argument");

    if let Err(e) = start_machine(Path::new(config_path)) {
        eprintln!("kestrel: {}", e);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_config() {
        assert!(create_app()
            .try_get_matches_from(["kestrel"])
            .is_err());

        let matches = create_app()
            .try_get_matches_from(["kestrel", "-c", "/etc/kestrel/vm.json", "-vv"])
            .unwrap();
        assert_eq!(
            matches.get_one::<String>("config").map(String::as_str),
            Some("/etc/kestrel/vm.json")
        );
        assert_eq!(matches.get_count("v"), 2);
    }
}
