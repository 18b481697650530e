use std::{process::ExitCode, sync::Arc};

use clap::Parser as _;
use teleinfo_exporter::{
    observability,
    proc::{TeleinfoProc, TeleinfoSettings},
    registry::FieldRegistry,
    teleinfo::TeleinfoError,
};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{error, info};
use tracing_subscriber::fmt::time::ChronoLocal;

async fn run(settings: TeleinfoSettings) -> Result<(), TeleinfoError> {
    let addr = settings.socket_addr();
    let proc = Arc::new(TeleinfoProc::open(settings, FieldRegistry::linky()).await?);

    let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
    let app = observability::router(proc, fatal_tx);
    let listener = TcpListener::bind(addr).await?;
    info!("Teleinfo exporter listening on http://{}/metrics", addr);

    tokio::select! {
        served = axum::serve(listener, app).into_future() => served.map_err(TeleinfoError::from),
        Some(err) = fatal_rx.recv() => Err(err),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let settings = TeleinfoSettings::parse();

    tracing_subscriber::fmt()
        .with_max_level(settings.log_level())
        .with_timer(ChronoLocal::new(String::from("%d/%m/%Y %H:%M:%S")))
        .init();

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Teleinfo exporter stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}
