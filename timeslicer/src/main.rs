mod background;
mod cli;
mod collector;
mod config;
mod error;
mod kernel_symbols;
mod output;
mod proc_maps;
mod process;
mod rapl;
mod registry;
mod symbolize;
mod wattsup;

use clap::Parser;
use log::error;

use timeslicer_perf::events::{is_encodable, known_event_names, Preset};

use crate::config::SampleConfig;
use crate::error::CollectorError;

fn main() {
    env_logger::init();

    let opt = cli::Opt::parse();
    let code = match opt.action {
        cli::Action::Record(args) => run_record(args),
        cli::Action::ListEvents => {
            for name in known_event_names() {
                println!("{name}");
            }
            0
        }
        cli::Action::ListPresets => {
            list_presets();
            0
        }
    };
    std::process::exit(code);
}

fn run_record(args: cli::RecordArgs) -> i32 {
    let config = match SampleConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return err.exit_code();
        }
    };

    match collector::record(&config, &args.command, &args.args) {
        Ok(summary) if summary.timeslices == 0 => {
            let err = CollectorError::Interrupted;
            error!("{err}");
            err.exit_code()
        }
        Ok(_) => 0,
        Err(err) => {
            error!("{err}");
            err.exit_code()
        }
    }
}

fn preset_available(preset: Preset) -> bool {
    match preset {
        Preset::Rapl => rapl::zones_available(),
        Preset::Wattsup => {
            wattsup::WattsUp::open(config::DEFAULT_WATTSUP_DEVICE).is_ok()
        }
        other => other.events().iter().all(|event| is_encodable(event)),
    }
}

fn list_presets() {
    println!("{:<12} {:<45} {}", "preset", "events", "status");
    for preset in Preset::ALL {
        let events = if preset.events().is_empty() {
            "-".to_string()
        } else {
            preset.events().join(",")
        };
        let status = if preset_available(preset) {
            "AVAILABLE"
        } else {
            "UNAVAILABLE"
        };
        println!("{:<12} {:<45} {}", preset.name(), events, status);
        println!("{:<12} {}", "", preset.description());
    }
}
