use device_agent::agent::{AgentBuilder, IdentitySource};
use device_agent::config::Settings;
use device_agent::firmware::{FirmwareUpdater, ReqwestFetcher};
use device_agent::mqtt_service::{MqttService, MqttSettings};
use device_agent::service_utils::{abort_on_ctrl_c, init_logging, AbortSignal, ProcessRebooter};
use device_agent::store::FileConfigStore;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    init_logging();

    // Load configuration
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return ExitCode::FAILURE;
        }
    };

    let source = match settings.explicit_identity.clone() {
        Some(identity) => IdentitySource::Explicit(identity),
        None => IdentitySource::Store(Box::new(FileConfigStore::new(&settings.config_path))),
    };

    let abort = AbortSignal::new();
    let builder = match AgentBuilder::new(source) {
        Ok(builder) => builder
            .topic_prefix(settings.topic_prefix.clone())
            .abort_signal(abort.clone()),
        Err(e) => {
            error!("The configuration file is invalid: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let transport = MqttService::new(
        builder.identity().clone(),
        MqttSettings {
            port: settings.mqtt_port,
            ca_path: settings.ca_path.clone(),
            keep_alive: settings.keep_alive,
            connect_timeout: settings.connect_timeout,
            poll_timeout: settings.poll_timeout,
        },
    );

    let fetcher = match ReqwestFetcher::new(settings.download_timeout) {
        Ok(fetcher) => fetcher,
        Err(e) => {
            error!("Failed to create firmware HTTP client: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let rebooter = Arc::new(ProcessRebooter {
        exit_code: settings.reboot_exit_code,
    });
    let updater = FirmwareUpdater::new(
        &settings.app_path,
        &settings.archive_dir,
        Box::new(fetcher),
        rebooter.clone(),
    );

    let mut agent = match builder.build(Box::new(transport), updater, rebooter) {
        Ok(agent) => agent,
        Err(e) => {
            error!("Failed to create device agent: {}", e);
            return ExitCode::FAILURE;
        }
    };

    agent.set_command_handler(|topic, payload| {
        info!("Command on '{}': {}", topic, String::from_utf8_lossy(payload));
    });
    agent.set_metadata_handler(|_, payload| {
        info!("Metadata updated: {}", String::from_utf8_lossy(payload));
    });
    agent.set_reset_handler(|_, _| {
        info!("Factory reset handled.");
    });

    abort_on_ctrl_c(abort);

    if let Err(e) = agent.connect().await {
        error!("Device agent could not connect: {}", e);
        return ExitCode::FAILURE;
    }

    let mut last_pub: Option<Instant> = None;
    while agent.loop_once().await {
        let interval = Duration::from_millis(agent.pub_interval_ms());
        if last_pub.map_or(true, |at| at.elapsed() >= interval) {
            last_pub = Some(Instant::now());
            if let Err(e) = agent.publish_event("status", br#"{"d":{"alive":"true"}}"#).await {
                warn!("Failed to publish status event: {}", e);
            }
        }
    }

    if let Err(e) = agent.shutdown().await {
        warn!("Shutdown did not complete cleanly: {}", e);
    }
    info!("Device agent stopped.");
    ExitCode::SUCCESS
}
