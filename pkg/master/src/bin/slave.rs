#[macro_use]
extern crate log;

use std::process;

use clap::Parser;
use cs_master::config::SlaveArgs;
use cs_master::worker::run_worker;
use cs_master::EXIT_EXCLUSION_VIOLATED;
use lib::error_prefix;

fn main() {
    lib::logger::init("slave");

    let program = std::env::args()
        .next()
        .unwrap_or_else(|| "./slave".to_owned());
    let args = SlaveArgs::parse();

    let report = args
        .worker
        .build()
        .and_then(|config| run_worker(args.slot, args.shmid, args.semid, &config));

    match report {
        Ok(report) if report.violations > 0 => {
            error!(
                "Mutual exclusion violated {} times out of {}",
                report.violations, report.entries
            );
            process::exit(EXIT_EXCLUSION_VIOLATED);
        }
        Ok(report) => info!("Finished {} passes", report.entries),
        Err(e) => {
            eprintln!("{}: {}", error_prefix(&program), e);
            process::exit(1);
        }
    }
}
