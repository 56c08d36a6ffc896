//! sentrywatch: a single-node security-camera daemon.
//!
//! Copyright (C) 2024  Ardalan Amiri Sani
//!
//! This program is free software: you can redistribute it and/or modify
//! it under the terms of the GNU General Public License as published by
//! the Free Software Foundation, either version 3 of the License, or
//! (at your option) any later version.
//!
//! This program is distributed in the hope that it will be useful,
//! but WITHOUT ANY WARRANTY; without even the implied warranty of
//! MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//! GNU General Public License for more details.
//!
//! You should have received a copy of the GNU General Public License
//! along with this program.  If not, see <https://www.gnu.org/licenses/>.

#[macro_use]
extern crate serde_derive;

use docopt::Docopt;
use sentrywatch::config::Config;
use sentrywatch::orchestrator;
use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::Ordering;
use std::time::Duration;

const USAGE: &str = "
sentrywatch: a single-node security-camera daemon.

Usage:
  sentrywatch [--config=<path>] [--base-path=<path>] [--foreground]
  sentrywatch (-h | --help)
  sentrywatch --version

Options:
  -h --help             Show this help.
  --version              Show version.
  --config=<path>         Path to a TOML configuration file.
  --base-path=<path>       Override paths.base from the configuration file.
  --foreground             No-op; kept for parity with service-manager invocations that always pass it.
";

#[derive(Debug, Clone, Deserialize)]
struct Args {
    flag_config: Option<String>,
    flag_base_path: Option<String>,
    flag_foreground: bool,
}

fn main() {
    env_logger::init();

    let version = Some(env!("CARGO_PKG_VERSION").to_string());
    let args: Args = Docopt::new(USAGE)
        .map(|d| d.help(true))
        .map(|d| d.version(version))
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    let mut config = match Config::load(args.flag_config.as_ref().map(PathBuf::from).as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sentrywatch: invalid configuration: {e}");
            exit(1);
        }
    };
    if let Some(base_path) = args.flag_base_path {
        config.paths.base = PathBuf::from(base_path);
    }

    let running = orchestrator::install_signal_handler();

    let system = match orchestrator::System::start(config) {
        Ok(system) => system,
        Err(e) => {
            eprintln!("sentrywatch: startup failed: {e}");
            exit(1);
        }
    };

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    system.shutdown();
    exit(0);
}
