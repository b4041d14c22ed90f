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

//! Identity propagation test client.
//!
//! ```text
//! gsstest-client [CONFIG.yaml]
//! gsstest-client init-spn TARGET...
//! ```
//!
//! The first form asks the server for the identity it authenticates
//! this client as, and prints it.  The second form takes the first
//! step of a context with each target and prints the names the
//! context holds, without contacting a server.  Configuration for
//! `init-spn` comes from the environment only.
use std::path::Path;
use std::process::exit;

use gsstest::client::local_identity;
use gsstest::client::GSSTestClient;
use gsstest::config::ClientConfig;
use gsstest::config::MechanismConfig;
use gsstest::cred::CredUsage;
use gsstest::cred::Login;
use gsstest::cred::PasswordHandler;
#[cfg(feature = "gssapi")]
use gsstest::mech::gssapi::GSSAPIMechanism;
use gsstest::mech::loopback::LoopbackMechanism;
use gsstest::mech::Mechanism;
use log::error;

/// What to do once logged in.
enum Action {
    GetName,
    InitSpn(Vec<String>)
}

fn with_login<M>(
    config: &ClientConfig,
    mech: &M,
    action: &Action
) -> Result<(), String>
where
    M: Mechanism {
    let mut provider = mech.credential_provider();
    let login = match config.principal() {
        Some(principal) => {
            let handler = PasswordHandler::new(
                Some(String::from(principal)),
                config.secret().map(|secret| secret.as_bytes().to_vec())
            );

            Some(
                Login::new(&mut provider, &handler, CredUsage::Initiate)
                    .map_err(|err| format!("login failed: {}", err))?
            )
        }
        // Fall back to the mechanism's default credentials.
        None => None
    };
    let cred = login.as_ref().map(|login| login.credential());

    match action {
        Action::GetName => {
            let client = GSSTestClient::new(config.clone());
            let name = client
                .get_name(mech, cred)
                .map_err(|err| format!("request failed: {}", err))?;

            println!(">>> {}", name);

            Ok(())
        }
        Action::InitSpn(targets) => {
            let mut failed = 0;

            for target in targets {
                match local_identity(mech, target, cred) {
                    Ok((source, target)) => {
                        println!("Source name: {}", source);
                        println!("Target name: {}", target);
                        println!(">>> {}", source);
                    }
                    Err(err) => {
                        error!(target: "gsstest-client",
                               "{}: {}",
                               target, err);

                        failed += 1;
                    }
                }
            }

            if failed == 0 {
                Ok(())
            } else {
                Err(format!("{} of {} targets failed", failed, targets.len()))
            }
        }
    }
}

fn run(
    config: ClientConfig,
    action: Action
) -> Result<(), String> {
    match config.mechanism() {
        MechanismConfig::Loopback { loopback } => {
            let mech = LoopbackMechanism::new(loopback.realm(), loopback.legs());

            with_login(&config, &mech, &action)
        }
        #[cfg(feature = "gssapi")]
        MechanismConfig::GSSAPI { gssapi } => {
            let mech = GSSAPIMechanism::new(gssapi.time_req());

            with_login(&config, &mech, &action)
        }
        #[cfg(not(feature = "gssapi"))]
        MechanismConfig::GSSAPI { .. } => Err(String::from(
            "built without the gssapi feature (use the loopback mechanism)"
        ))
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let res = match args.first().map(String::as_str) {
        Some("init-spn") if args.len() < 2 => {
            Err(String::from("usage: gsstest-client init-spn TARGET..."))
        }
        Some("init-spn") => ClientConfig::load(None)
            .map_err(|err| format!("bad configuration: {}", err))
            .and_then(|config| {
                run(config, Action::InitSpn(args[1..].to_vec()))
            }),
        path => ClientConfig::load(path.map(Path::new))
            .map_err(|err| format!("bad configuration: {}", err))
            .and_then(|config| run(config, Action::GetName))
    };

    if let Err(msg) = res {
        error!(target: "gsstest-client",
               "{}",
               msg);

        exit(1)
    }
}
