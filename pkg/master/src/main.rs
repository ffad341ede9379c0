#[macro_use]
extern crate log;

use std::process;

use cs_master::config::{parse_master, usage, Invocation};
use cs_master::ProcessManager;
use lib::error_prefix;

fn main() {
    lib::logger::init("master");

    let program = std::env::args()
        .next()
        .unwrap_or_else(|| "./master".to_owned());

    let config = match parse_master(std::env::args_os()) {
        Ok(Invocation::Run(config)) => config,
        Ok(Invocation::Help) => {
            print!("{}", usage(&program));
            return;
        }
        Err(e) => {
            debug!("{}", e);
            print!("{}", usage(&program));
            process::exit(e.exit_code());
        }
    };

    let mut manager = ProcessManager::new(config);
    if let Err(e) = manager.init() {
        eprintln!("{}: {}", error_prefix(&program), e);
        process::exit(1);
    }

    let reason = manager.run();
    debug!("Master exiting after {}", reason);
}
