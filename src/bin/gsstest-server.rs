// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! Identity propagation test server.
//!
//! ```text
//! gsstest-server [CONFIG.yaml]
//! gsstest-server stop [CONFIG.yaml]
//! ```
//!
//! The first form logs in, binds the primary port (and the control
//! port, under the remote-control stop policy), and serves until
//! stopped.  The second form stops a running server started with the
//! same configuration.
use std::path::Path;
use std::process::exit;
use std::time::Duration;

use gsstest::client::send_stop;
use gsstest::config::MechanismConfig;
use gsstest::config::ServerConfig;
use gsstest::config::StopPolicy;
use gsstest::control::send_stop_keyword;
use gsstest::control::ControlChannel;
use gsstest::cred::PasswordHandler;
#[cfg(feature = "gssapi")]
use gsstest::mech::gssapi::GSSAPIMechanism;
use gsstest::mech::loopback::LoopbackMechanism;
use gsstest::mech::Mechanism;
use gsstest::server::reachable_addr;
use gsstest::server::GSSTestServer;
use log::error;
use log::info;

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

fn serve<M>(
    config: ServerConfig,
    mech: M
) -> Result<(), String>
where
    M: Mechanism + Sync,
    M::Credential: Sync {
    let handler =
        PasswordHandler::with_password(config.principal(), config.secret());
    let control = config.control().clone();
    let policy = config.stop_policy();
    let server = GSSTestServer::new(config, mech, &handler)
        .map_err(|err| format!("server failed to start: {}", err))?;

    if policy == StopPolicy::RemoteControl {
        ControlChannel::bind(&control, server.stop_handle())
            .and_then(|channel| channel.spawn())
            .map_err(|err| format!("control channel failed to start: {}", err))?;
    }

    let report = server
        .run()
        .map_err(|err| format!("server failed: {}", err))?;

    info!(target: "gsstest-server",
          "served {} sessions ({} identities, {} failures)",
          report.sessions(), report.identities(), report.failures());

    Ok(())
}

fn start(config: ServerConfig) -> Result<(), String> {
    match config.mechanism().clone() {
        MechanismConfig::Loopback { loopback } => serve(
            config,
            LoopbackMechanism::new(loopback.realm(), loopback.legs())
        ),
        #[cfg(feature = "gssapi")]
        MechanismConfig::GSSAPI { gssapi } => {
            serve(config, GSSAPIMechanism::new(gssapi.time_req()))
        }
        #[cfg(not(feature = "gssapi"))]
        MechanismConfig::GSSAPI { .. } => Err(String::from(
            "built without the gssapi feature (use the loopback mechanism)"
        ))
    }
}

fn stop(config: ServerConfig) -> Result<(), String> {
    match config.stop_policy() {
        StopPolicy::RemoteControl => {
            let addr = reachable_addr(config.control().socket_addr());

            send_stop_keyword(addr, STOP_TIMEOUT)
                .map_err(|err| format!("error contacting {}: {}", addr, err))
        }
        StopPolicy::Command => {
            let addr = reachable_addr(config.socket_addr());

            send_stop(addr, config.command_encoding(), STOP_TIMEOUT)
                .map_err(|err| format!("error contacting {}: {}", addr, err))
        }
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (stopping, path) = match args.first().map(String::as_str) {
        Some("stop") => (true, args.get(1)),
        _ => (false, args.first())
    };
    let res = ServerConfig::load(path.map(Path::new))
        .map_err(|err| format!("bad configuration: {}", err))
        .and_then(|config| {
            if stopping {
                stop(config)
            } else {
                start(config)
            }
        });

    if let Err(msg) = res {
        error!(target: "gsstest-server",
               "{}",
               msg);

        exit(1)
    }
}
