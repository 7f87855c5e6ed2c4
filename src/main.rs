// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

use std::path::PathBuf;
use std::sync::Arc;

use slog::{error, info};

use fuseunit::boundary::Api;
use fuseunit::config::{self, Settings};
use fuseunit::controller::FireController;
use fuseunit::hardware::HardwareController;
use fuseunit::logging;
use fuseunit::{bus, halt};

#[tokio::main]
async fn main() {
    let app = clap::App::new("fuseunit")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            clap::Arg::with_name("config")
                .long("config")
                .help("Set config file path")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("device-id")
                .long("device-id")
                .help("Override the configured device id")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("bus-device")
                .long("bus-device")
                .value_name("PATH")
                .help("Override the configured I2C bus device node")
                .required(false)
                .takes_value(true),
        );

    let matches = app.get_matches();
    let log = logging::root_logger();

    let config_path = matches
        .value_of("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_CONFIG_PATH));

    let mut settings = match Settings::load(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            error!(log, "failed to load configuration"; "path" => %config_path.display(), "error" => %e);
            std::process::exit(1);
        }
    };
    settings.apply_cli_overrides(&matches);

    let shared_bus = match bus::open(&settings.bus_device, &settings.simulation_file, log.clone()) {
        Ok(bus) => bus,
        Err(e) => {
            error!(log, "failed to open I2C bus"; "error" => %e);
            std::process::exit(1);
        }
    };

    let hardware = Arc::new(HardwareController::new(
        shared_bus,
        settings.chip_addresses.clone(),
        log.new(slog::o!("component" => "hardware")),
    ));
    let controller = FireController::new(
        hardware.clone(),
        settings.chip_addresses.clone(),
        settings.ignition,
        settings.resolution,
        settings.testloop_period,
        settings.program_thread_timeout,
        settings.schedule_thread_timeout,
        None,
        log.new(slog::o!("component" => "controller")),
    );
    let api = Arc::new(Api::new(
        settings.device_id.clone(),
        settings.chip_addresses.clone(),
        controller,
        hardware,
        log.new(slog::o!("component" => "api")),
    ));

    let (halt_sender, halt_receiver) = halt::make_pair(log.new(slog::o!("component" => "halt")));

    {
        let ctrlc_sender = halt_sender.clone();
        ctrlc::set_handler(move || {
            futures::executor::block_on(ctrlc_sender.do_stop());
        })
        .expect("failed to install Ctrl-C handler");
    }

    let heartbeat_api = api.clone();
    let heartbeat_period = settings.heartbeat_period;
    let heartbeat_log = log.new(slog::o!("component" => "heartbeat"));
    halt_receiver.spawn(async move {
        loop {
            tokio::time::sleep(heartbeat_period).await;
            match heartbeat_api.heartbeat_snapshot().await {
                Ok(snapshot) => info!(heartbeat_log, "heartbeat"; "program_state" => ?snapshot.program_state),
                Err(e) => error!(heartbeat_log, "failed to assemble heartbeat"; "error" => %e),
            }
        }
    });

    info!(log, "firing unit started"; "device_id" => %api.device_id());

    let mut halt_receiver = halt_receiver;
    halt_receiver.wait_for_halt().await;
    info!(log, "firing unit shutting down");
}
