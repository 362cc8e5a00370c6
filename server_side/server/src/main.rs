use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::{
    extract::Json,
    routing::get,
    Extension, Router,
};
use clap::Parser;
use cnc::connection::SerialPortOpener;
use common::api::{self, Health, LoadedProgram};
use config::{validate_interpreter, HubConfig};
use gcode::InterpreterConfig;
use hub::Hub;
use server_result::{ServerError, ServerResult};
use tokio::runtime::Builder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cnc;
mod config;
mod file_queue;
mod hub;
mod multiplexer;
mod registry;
mod router;
mod server_result;
mod session;
#[cfg(test)]
mod testing;
mod websocket;

#[derive(Parser, Debug)]
#[command(author, version, about = "Share serial-attached CNC controllers with websocket clients.", long_about = None)]
struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value = "0.0.0.0:8000")]
    listen: SocketAddr,
    /// JSON hub configuration. Missing fields take their defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

async fn health(hub: Extension<Arc<Hub>>) -> Json<Health> {
    Json(hub.health())
}

async fn loaded_gcode(hub: Extension<Arc<Hub>>) -> ServerResult<Json<LoadedProgram>> {
    hub.files.current().map(Json).ok_or_else(|| ServerError::not_found("No program is loaded"))
}

async fn get_interpreter_settings(hub: Extension<Arc<Hub>>) -> Json<InterpreterConfig> {
    Json(hub.interpreter_config())
}

async fn put_interpreter_settings(hub: Extension<Arc<Hub>>, settings: Json<InterpreterConfig>) -> ServerResult<Json<InterpreterConfig>> {
    validate_interpreter(&settings).map_err(ServerError::bad_request)?;
    hub.set_interpreter_config(settings.0.clone());
    Ok(settings)
}

async fn run_server(hub: Arc<Hub>, listen: SocketAddr) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route(api::SOCKET, get(websocket::connect))
        .route(api::HEALTH, get(health))
        .route(api::GCODE, get(loaded_gcode))
        .route(api::INTERPRETER_SETTINGS, get(get_interpreter_settings).put(put_interpreter_settings))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(cors)
        .layer(Extension(hub));

    info!("Listening on {}", listen);
    axum::Server::try_bind(&listen)?
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let config = match &args.config {
        Some(path) => HubConfig::load(path)?,
        None => HubConfig::default(),
    };
    info!("Starting CNC hub with controllers {:?}", config.controllers);
    let hub = Arc::new(Hub::new(config, Arc::new(SerialPortOpener))?);
    let runtime = Builder::new_multi_thread().enable_all().build().context("Failed to start the runtime")?;
    runtime.block_on(run_server(hub, args.listen))
}
