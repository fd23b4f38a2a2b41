use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::timeout,
};
use tracing::{info, warn};

use crate::{
    cli::Cli,
    lottery::FixedDraw,
    store::{FileStore, MemoryStore, SharedStore},
};

mod cli;
mod client;
mod lottery;
mod protocol;
mod store;

// How long in-flight connections get to wrap up after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SharedState {
    lottery: lottery::Handler,
    store: SharedStore,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Cli::parse();

    let store: SharedStore = match &args.store {
        Some(path) => Arc::new(FileStore::open(path.clone()).await?),
        None => Arc::new(MemoryStore::default()),
    };

    let lottery = lottery::System::start(
        store.clone(),
        Arc::new(FixedDraw(args.winning_number)),
        args.agencies,
    );
    let state = SharedState { lottery, store };

    let listener = TcpListener::bind(args.listen).await?;
    info!(
        addr = %listener.local_addr()?,
        agencies = args.agencies,
        "server listening"
    );

    run(listener, state, shutdown_signal()).await
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn run(
    listener: TcpListener,
    state: SharedState,
    shutdown: impl Future<Output = ()> + Send,
) -> Result<()> {
    tokio::pin!(shutdown);

    let mut handlers: Vec<JoinHandle<()>> = Vec::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((conn, peer)) => handlers.push(spawn_handler(conn, state.clone(), peer)),
                    Err(err) => warn!(error = %err, "failed to accept connection"),
                }
                handlers.retain(|handler| !handler.is_finished());
            }
        }
    }

    drop(listener);

    // release every handler blocked on the draw barrier before reaping the tasks
    if let Err(err) = state.lottery.shutdown().await {
        warn!(error = %err, "draw coordinator was already gone at shutdown");
    }

    for mut handler in handlers {
        if timeout(SHUTDOWN_GRACE, &mut handler).await.is_err() {
            handler.abort();
        }
    }

    info!("server stopped");
    Ok(())
}

fn spawn_handler(conn: TcpStream, state: SharedState, peer: SocketAddr) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = client::handle(conn, state).await {
            warn!(%peer, error = ?err, "connection closed with error");
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install the interrupt handler");
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(err) => {
                warn!(error = %err, "failed to install the SIGTERM handler");
                return ctrl_c.await;
            }
        };

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
