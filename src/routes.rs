use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use serde_json::json;

use crate::error::AppError;
use crate::gpio::GpioBackend;
use crate::lifecycle::Controller;

/// Read-only view over the lines a running controller has exported.
pub struct AppState<B: GpioBackend> {
    pub controller: Arc<Controller<B>>,
}

impl<B: GpioBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            controller: Arc::clone(&self.controller),
        }
    }
}

impl<B: GpioBackend + 'static> AppState<B> {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(read_only("/status").route(web::get().to(status::<B>)))
            .service(read_only("/lines").route(web::get().to(list_lines::<B>)))
            .service(read_only("/line/{line_id}").route(web::get().to(line_snapshot::<B>)))
            .service(read_only("/line/{line_id}/value").route(web::get().to(line_value::<B>)))
            .service(read_only("/bindings").route(web::get().to(list_bindings::<B>)))
    }
}

fn read_only(path: &str) -> actix_web::Resource {
    web::resource(path).route(
        web::route()
            .guard(guard_not_methods(&[Method::GET]))
            .to(method_not_allowed),
    )
}

async fn status<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(json!({ "state": state.controller.state() })))
}

async fn list_lines<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.controller.exported_lines()))
}

async fn line_snapshot<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line_id = parse_line_id(&req)?;
    let snapshot = state.controller.line(line_id)?;

    Ok(web::Json(snapshot))
}

async fn line_value<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line_id = parse_line_id(&req)?;
    let level = state.controller.read_level(line_id)?;

    Ok(web::Json(u8::from(level)))
}

async fn list_bindings<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.controller.bindings()))
}

fn parse_line_id(req: &HttpRequest) -> Result<u32, AppError> {
    let line_id = req
        .match_info()
        .get("line_id")
        .ok_or_else(|| AppError::InvalidValue("Missing line id".into()))?;
    let line_id = line_id
        .parse::<u32>()
        .map_err(|_| AppError::InvalidValue(format!("Invalid line id: {line_id}")))?;

    Ok(line_id)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
