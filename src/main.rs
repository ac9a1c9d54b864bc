use log::{info, warn};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpServer, web};
use parking_lot::Mutex;

use onoffd::shutdown::run_button_loop;
use onoffd::{
    AppConfig, AppState, CommandShutdown, GpioManager, HostPlatform, PinStore, SystemPlatform,
};

#[cfg(feature = "hardware-gpio")]
use onoffd::SysfsBackend;
#[cfg(not(feature = "hardware-gpio"))]
use onoffd::MockGpioBackend;

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("ONOFFD_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = AppConfig::load_from_file(&config_path).map_err(io::Error::other)?;

    let backend = {
        #[cfg(feature = "hardware-gpio")]
        {
            Arc::new(SysfsBackend::new(Duration::from_millis(
                config.gpio.export_wait_ms,
            )))
        }
        #[cfg(not(feature = "hardware-gpio"))]
        {
            Arc::new(MockGpioBackend::default())
        }
    };
    let platform: Arc<dyn HostPlatform> = Arc::new(SystemPlatform::new(config.probe.clone()));
    let manager = Arc::new(GpioManager::new(backend, platform));

    info!("Audiophonics on/off initiated");
    let store = PinStore::open(&config.pin_store).map_err(io::Error::other)?;
    let pins = store.pin_config();
    let store = Arc::new(Mutex::new(store));

    match manager.start(&pins) {
        Ok(summary) => {
            for (role, e) in &summary.failed {
                warn!("{role} GPIO left unbound: {e}");
            }
        }
        Err(e) => warn!("GPIO start failed: {e}"),
    }

    if let Some(events) = manager.take_events() {
        let action = Arc::new(CommandShutdown::new(config.shutdown_command.clone()));
        actix_web::rt::spawn(run_button_loop(events, action));
    }

    let app_state = AppState {
        manager: manager.clone(),
        store,
    };

    let http_cfg = config.http.clone();
    let server = HttpServer::new(move || {
        let scope_path = http_cfg.path.clone();
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .service(app_state.api_scope(&scope_path))
    })
    .client_request_timeout(Duration::from_secs(config.http.timeout));

    let bind_addrs: String;
    let http_cfg = config.http.clone();
    let server = match (&http_cfg.unix_socket, &http_cfg.host) {
        (Some(socket_path), Some(host)) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = format!("{} and {}", socket_path, host);

            server.bind_uds(socket_path)?.bind(host)?
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

            server.bind(host)?
        }
        _ => {
            return Err(io::Error::other(
                "Config error: either 'unix_socket' or 'host' must be specified",
            ));
        }
    };

    info!("Starting server on {}...", bind_addrs);

    let result = server.run().await;
    info!("performing stop action");
    manager.stop();
    result
}
