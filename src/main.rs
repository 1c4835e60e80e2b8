use std::process::ExitCode;

use sip_registrar_fixture::{fixture, logging, settings, FixtureConfig, RegistrarPolicy, StandaloneHarness};

#[tokio::main]
async fn main() -> ExitCode {
    let _log_guard = logging::init();

    let config = match settings::config_path_from_env() {
        Some(path) => match settings::load_config(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        None => FixtureConfig::default(),
    };

    // Standalone runs accept every registration
    match fixture::go_with(&StandaloneHarness, &config, RegistrarPolicy::NoPolicy).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Fixture failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
