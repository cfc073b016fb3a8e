// -----------------------------------------------------------------------------
// ADR magnet cycle control
//
// This program is free software; you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation; either version 2 of the License, or (at your option) any later
// version.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program; if not, write to the Free Software Foundation, Inc.,
// 59 Temple Place, Suite 330, Boston, MA  02111-1307  USA
//
// -----------------------------------------------------------------------------
//
//! The main entry point for the controller executable.

use std::sync::Arc;
use std::thread;
use log::*;
use clap::{crate_version, Arg, Command};
use mlzutil::fs as fsutil;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use adrctl_core::bus::{Bus, RedisBus};
use adrctl_core::config::{self, Config};
use adrctl_core::supervisor::Supervisor;
use adrctl_modules::SerialInstruments;


fn main() {
    let args = Command::new("adrctl")
        .version(crate_version!())
        .about("ADR magnet cycle control daemon.")
        .arg(Arg::new("verbose").short('v').help("Debug logging output?"))
        .arg(Arg::new("log").long("log").takes_value(true)
             .default_value("log").help("Logging path"))
        .arg(Arg::new("pid").long("pid").takes_value(true)
             .default_value("pid").help("PID path"))
        .arg(Arg::new("daemon").short('d').help("Daemonize?"))
        .arg(Arg::new("user").long("user").takes_value(true)
             .help("User name for daemon"))
        .arg(Arg::new("group").long("group").takes_value(true)
             .help("Group name for daemon"))
        .arg(Arg::new("config").required(true)
             .help("Configuration file name to load"))
        .get_matches();

    let log_path = fsutil::abspath(args.value_of("log").expect(""));
    let pid_path = fsutil::abspath(args.value_of("pid").expect(""));
    if args.is_present("daemon") {
        let mut daemon = daemonize::Daemonize::new();
        if let Some(user) = args.value_of("user") {
            daemon = daemon.user(user);
        }
        if let Some(group) = args.value_of("group") {
            daemon = daemon.group(group);
        }
        if let Err(err) = daemon.start() {
            eprintln!("could not daemonize process: {}", err);
        }
    }

    // handle SIGINT and SIGTERM
    let mut signals = Signals::new([SIGINT, SIGTERM]).expect("signal register failed");

    let cfgname = args.value_of("config").expect("is required");

    if let Err(err) = mlzlog::init(Some(log_path), cfgname, mlzlog::Settings {
                                       debug: args.is_present("verbose"),
                                       use_stdout: !args.is_present("daemon"),
                                       ..Default::default()
                                   }) {
        eprintln!("could not initialize logging: {}", err);
    }
    if let Err(err) = fsutil::write_pidfile(&pid_path, cfgname) {
        error!("could not write PID file: {}", err);
    }

    // set a panic hook to log panics into the logfile
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let payload = if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s
        } else {
            "???"
        };
        if let Some(location) = panic_info.location() {
            error!("panic: {:?} ({})", payload, location);
        } else {
            error!("panic: {:?}", payload)
        }
        // call the original hook to get backtrace if requested
        default_hook(panic_info);
    }));

    let code = match config::load_config(cfgname) {
        Err(err) => {
            error!("could not parse config file {}: {}", cfgname, err);
            1
        }
        Ok(cfg) => run(cfg, &mut signals),
    };

    info!("quitting...");
    fsutil::remove_pidfile(pid_path, cfgname);
    std::process::exit(code);
}


fn run(cfg: Config, signals: &mut Signals) -> i32 {
    // the deployment environment may override the configured bus address
    let mut bus_cfg = cfg.bus.clone();
    if let Ok(host) = std::env::var("ADRCTL_BUS_HOST") {
        bus_cfg.host = host;
    }
    if let Ok(port) = std::env::var("ADRCTL_BUS_PORT") {
        match port.parse() {
            Ok(port) => bus_cfg.port = port,
            Err(_) => warn!("ignoring unparseable ADRCTL_BUS_PORT {:?}", port),
        }
    }
    let addr = bus_cfg.addr();

    let bus: Arc<dyn Bus> = match RedisBus::connect(&addr) {
        Ok(bus) => Arc::new(bus),
        Err(err) => {
            error!("cannot reach the bus at {}: {}", addr, err);
            return 1;
        }
    };
    info!("connected to the bus at {}", addr);

    let instruments = match SerialInstruments::connect(&cfg.instruments) {
        Ok(instruments) => Box::new(instruments),
        Err(err) => {
            error!("instrument startup failed: {}", err);
            return 1;
        }
    };

    let supervisor = match Supervisor::new(bus, instruments, &cfg.statefile) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            error!("controller startup failed: {}", err);
            return 1;
        }
    };
    supervisor.start();

    // the command loop runs until the bus is lost for good; in that case the
    // magnet is already driven down and the process exits with code 1
    {
        let supervisor = supervisor.clone();
        thread::spawn(move || {
            let code = supervisor.command_loop();
            if code != 0 {
                info!("quitting after bus loss...");
                std::process::exit(code);
            }
        });
    }

    if let Some(description) = &cfg.description {
        info!("controller running ({})", description);
    } else {
        info!("controller running");
    }
    // controller is running; wait for a signal to finish
    signals.forever().next();
    supervisor.stop();
    0
}
