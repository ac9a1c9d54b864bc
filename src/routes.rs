use log::info;
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::{BOOT_OK_KEY, PinStore, SHUTDOWN_BUTTON_KEY, SOFT_SHUTDOWN_KEY};
use crate::error::AppError;
use crate::gpio::GpioBackend;
use crate::lifecycle::{BoundGpioLine, GpioManager, LifecycleState};

pub struct AppState<B: GpioBackend> {
    pub manager: Arc<GpioManager<B>>,
    pub store: Arc<Mutex<PinStore>>,
}

impl<B: GpioBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            store: Arc::clone(&self.store),
        }
    }
}

#[derive(Deserialize)]
struct ConfigPayload {
    soft_shutdown: Option<Value>,
    shutdown_button: Option<Value>,
    boot_ok: Option<Value>,
}

#[derive(Serialize)]
struct StatusResponse {
    state: LifecycleState,
    prefix: u32,
    lines: Vec<BoundGpioLine>,
}

impl<B: GpioBackend + 'static> AppState<B> {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                web::resource("/config")
                    .route(web::get().to(get_config::<B>))
                    .route(web::post().to(update_config::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET, Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/status")
                    .route(web::get().to(get_status::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/hooks/{hook}")
                    .route(web::post().to(run_hook::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
    }
}

async fn get_config<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let pins = state.store.lock().pin_config();

    Ok(web::Json(pins))
}

/// Persists new pin assignments. Bound lines keep their pins until the next start.
async fn update_config<B: GpioBackend + 'static>(
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let payload = parse_config_payload(&body)?;

    let mut updates = Vec::new();
    for (key, value) in [
        (SOFT_SHUTDOWN_KEY, payload.soft_shutdown),
        (SHUTDOWN_BUTTON_KEY, payload.shutdown_button),
        (BOOT_OK_KEY, payload.boot_ok),
    ] {
        if let Some(value) = value {
            updates.push((key, pin_value(key, value)?));
        }
    }

    let pins = {
        let mut store = state.store.lock();
        for (key, value) in updates {
            store.set(key, Some(value));
        }
        store.save()?;
        store.pin_config()
    };
    info!("Successfully saved the new configuration.");

    Ok(web::Json(pins))
}

async fn get_status<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let manager = &state.manager;

    Ok(web::Json(StatusResponse {
        state: manager.state(),
        prefix: manager.prefix(),
        lines: manager.bound_lines(),
    }))
}

async fn run_hook<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    let hook = req
        .match_info()
        .get("hook")
        .ok_or_else(|| AppError::InvalidValue("Missing hook".into()))?;
    let manager = &state.manager;

    match hook {
        "start" => {
            let pins = state.store.lock().pin_config();
            let starting = Arc::clone(manager);
            let summary = web::block(move || starting.start(&pins))
                .await
                .map_err(|e| AppError::Gpio(format!("start task: {e}")))??;
            let failed: Vec<Value> = summary
                .failed
                .iter()
                .map(|(role, e)| json!({ "role": role, "error": e.to_string() }))
                .collect();
            Ok(HttpResponse::Ok().json(json!({ "bound": summary.bound, "failed": failed })))
        }
        "stop" => {
            manager.stop();
            Ok(HttpResponse::Ok().finish())
        }
        "reboot" => {
            manager.reboot_notify()?;
            Ok(HttpResponse::Ok().finish())
        }
        "shutdown" => {
            manager.shutdown_notify().await?;
            Ok(HttpResponse::Ok().finish())
        }
        "install" => {
            manager.install(&mut state.store.lock())?;
            Ok(HttpResponse::Ok().finish())
        }
        "uninstall" => {
            manager.uninstall();
            Ok(HttpResponse::Ok().finish())
        }
        other => Err(AppError::NotFound(format!("Unknown hook {other}"))),
    }
}

fn parse_config_payload(body: &[u8]) -> Result<ConfigPayload, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue("Empty config payload".into()));
    }

    serde_json::from_slice(body)
        .map_err(|e| AppError::InvalidValue(format!("Invalid config payload: {e}")))
}

fn pin_value(key: &str, value: Value) -> Result<String, AppError> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(AppError::InvalidValue(format!(
            "{key} must be a string or a number"
        ))),
    }
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
