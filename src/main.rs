use log::{error, info};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};

use edgectl::{AppConfig, AppState, Controller, GpioBackend, HttpConfig, ProcessSpawner};

#[cfg(feature = "hardware-gpio")]
use edgectl::LibgpiodBackend;
#[cfg(not(feature = "hardware-gpio"))]
use edgectl::MockGpioBackend;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("EDGECTL_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = Arc::new(
        AppConfig::load_from_file(&config_path)
            .unwrap_or_else(|e| panic!("Failed to load config: {e}")),
    );

    let backend = {
        #[cfg(feature = "hardware-gpio")]
        {
            Arc::new(
                LibgpiodBackend::new(&config.chip)
                    .unwrap_or_else(|e| panic!("Failed to init libgpiod backend: {e}")),
            )
        }
        #[cfg(not(feature = "hardware-gpio"))]
        {
            Arc::new(MockGpioBackend::default())
        }
    };

    let controller = Arc::new(Controller::new(
        config.clone(),
        backend,
        Arc::new(ProcessSpawner),
    ));

    if let Err(e) = controller.start().await {
        error!("Failed to start: {e}");
        return Err(std::io::Error::other(e.to_string()));
    }

    // lines are released in order even when serving fails
    let served = match &config.http {
        Some(http_cfg) => serve(http_cfg, AppState { controller: controller.clone() }).await,
        None => {
            info!("Running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await
        }
    };
    if let Err(e) = &served {
        error!("Stopping early: {e}");
    }

    match controller.stop().await {
        Ok(report) => info!(
            "Stopped after {} presses, {} side effects launched",
            report.total_presses(),
            report.launches.launched
        ),
        Err(e) => return Err(std::io::Error::other(e.to_string())),
    }

    served
}

/// Serves the inspection API until the server receives a stop signal.
async fn serve<B: GpioBackend + 'static>(
    http_cfg: &HttpConfig,
    app_state: AppState<B>,
) -> std::io::Result<()> {
    let scope_path = http_cfg.path.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .service(app_state.api_scope(&scope_path))
    });

    let bind_addrs: String;
    let server = match (&http_cfg.unix_socket, &http_cfg.host) {
        (Some(socket_path), Some(host)) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = format!("{} and {}", socket_path, host);

            server.bind_uds(socket_path)?.bind_auto_h2c(host)?
        }
        (Some(socket_path), None) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = socket_path.clone();

            server.bind_uds(socket_path)?
        }
        (None, Some(host)) => {
            bind_addrs = host.clone();

            server.bind_auto_h2c(host)?
        }
        (None, None) => {
            return Err(std::io::Error::other(
                "Config error: http needs 'unix_socket' or 'host'",
            ));
        }
    };

    info!("Serving inspection API on {}...", bind_addrs);

    server.run().await
}
