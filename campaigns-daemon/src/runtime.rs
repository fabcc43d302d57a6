use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, RwLock};

use crate::config::{EngineConfig, LogFormat};
use crate::engine::Engine;
use crate::error::{io_err, join_err, DaemonError};
use crate::paths::{campaigns_root, run_dir, socket_path, store_path};
use crate::protocol::{EngineRequest, EngineResponse};
use crate::scheduler::{SchedulerConfig, SyncScheduler};
use crate::worker::{worker_task, WorkerStats};

/// Shared by the socket server and the status payload.
struct RuntimeState {
    home: PathBuf,
    engine: Arc<Engine>,
    scheduler: SyncScheduler,
    stats: Arc<RwLock<WorkerStats>>,
    workers: usize,
    started_at: DateTime<Utc>,
}

/// Load config and store from `home`, start the engine, and block the
/// current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    let config = EngineConfig::load_at(home)?;
    init_tracing(config.log_format);
    let engine = Engine::open_at(home, &config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config, Arc::new(engine)))
}

/// Run workers, the sync scheduler, the socket server, and the periodic
/// store flush until a `stop` request or ctrl-c.
pub async fn run(home: PathBuf, config: EngineConfig, engine: Arc<Engine>) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    tracing::info!(
        workers = config.workers,
        store = %store_path(&home).display(),
        "starting campaigns engine",
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let stats = Arc::new(RwLock::new(WorkerStats::default()));

    let scheduler = SyncScheduler::start(
        engine.clone(),
        SchedulerConfig {
            recompute_interval: config.recompute_interval(),
            priority_capacity: config.priority_capacity,
        },
        shutdown_tx.subscribe(),
    );

    let worker_handles: Vec<_> = (0..config.workers)
        .map(|index| {
            let shutdown = shutdown_tx.clone();
            let engine = engine.clone();
            let stats = stats.clone();
            let poll_interval = config.poll_interval();
            tokio::spawn(async move {
                let result =
                    worker_task(index, engine, stats, poll_interval, shutdown.subscribe()).await;
                let _ = shutdown.send(());
                result
            })
        })
        .collect();

    let state = Arc::new(RuntimeState {
        home: home.clone(),
        engine: engine.clone(),
        scheduler,
        stats,
        workers: config.workers,
        started_at: Utc::now(),
    });

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let result = socket_server_task(state, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let flush_handle = {
        let shutdown = shutdown_tx.clone();
        let engine = engine.clone();
        let interval = config.flush_interval();
        tokio::spawn(async move {
            let result = flush_task(engine, interval, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down engine");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (socket_result, flush_result, signal_result) =
        tokio::join!(socket_handle, flush_handle, signal_handle);
    let mut worker_results = Vec::with_capacity(worker_handles.len());
    for handle in worker_handles {
        worker_results.push(handle.await);
    }

    handle_join("socket_server", socket_result)?;
    handle_join("store_flush", flush_result)?;
    handle_join("signal_handler", signal_result)?;
    for result in worker_results {
        handle_join("worker", result)?;
    }

    state.scheduler.stop().await?;

    tokio::task::spawn_blocking(move || engine.flush())
        .await
        .map_err(|err| join_err("final_flush", err))??;
    tracing::info!("campaigns engine stopped");
    Ok(())
}

async fn socket_server_task(
    state: Arc<RuntimeState>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&state.home);
    prepare_socket_for_bind(&socket)?;
    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let state = state.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, state, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    state: Arc<RuntimeState>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("engine socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<EngineRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &EngineResponse::error(format!("invalid request: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stop = request == EngineRequest::Stop;
        let response = match handle_request(&state, request, &shutdown_tx).await {
            Ok(data) => EngineResponse::ok(data),
            Err(err) => EngineResponse::error(err.to_string()),
        };
        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }
    Ok(())
}

async fn handle_request(
    state: &Arc<RuntimeState>,
    request: EngineRequest,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<Value, DaemonError> {
    match request {
        EngineRequest::Status => build_status_payload(state).await,
        EngineRequest::Stop => {
            let _ = shutdown_tx.send(());
            Ok(json!({ "stopping": true }))
        }
        EngineRequest::Sync { changeset } => {
            let queued = state.scheduler.enqueue_priority(changeset);
            Ok(json!({ "changeset": changeset, "queued": queued }))
        }
        request => {
            let engine = state.engine.clone();
            let name = request.name();
            let data = tokio::task::spawn_blocking(move || engine.execute(&request, Utc::now()))
                .await
                .map_err(|err| join_err(name, err))??;
            state.scheduler.reschedule();
            Ok(data)
        }
    }
}

async fn build_status_payload(state: &Arc<RuntimeState>) -> Result<Value, DaemonError> {
    let engine = state.engine.clone();
    let summary = tokio::task::spawn_blocking(move || engine.summary())
        .await
        .map_err(|err| join_err("status", err))??;
    let stats = state.stats.read().await.clone();

    Ok(json!({
        "running": true,
        "started_at": state.started_at,
        "workers": state.workers,
        "store": summary,
        "reconciler": stats,
        "socket": socket_path(&state.home).display().to_string(),
        "root": campaigns_root(&state.home).display().to_string(),
    }))
}

async fn flush_task(
    engine: Arc<Engine>,
    period: std::time::Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await; // consume the first immediate tick

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let engine = engine.clone();
                let flushed = tokio::task::spawn_blocking(move || engine.flush())
                    .await
                    .map_err(|err| join_err("store_flush", err))?;
                if let Err(err) = flushed {
                    tracing::warn!(error = %err, "store flush failed");
                }
            }
        }
    }
    Ok(())
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let run = run_dir(home);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
    }
    Ok(())
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "engine socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale engine socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &EngineResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("engine socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("engine socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("engine socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(join_err(task, err)),
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info`
/// filter; records from the library crates arrive through the `log` bridge.
pub fn init_tracing(format: LogFormat) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = match format {
        LogFormat::Text => fmt().with_env_filter(filter).with_target(false).try_init(),
        LogFormat::Json => fmt().json().with_env_filter(filter).try_init(),
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn stale_socket_file_is_removed() {
        let home = TempDir::new().expect("home");
        let socket = home.path().join("engine.sock");
        fs::write(&socket, "").expect("stale socket");
        prepare_socket_for_bind(&socket).expect("prepare");
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn socket_in_use_is_rejected() {
        let home = TempDir::new().expect("home");
        let socket = home.path().join("engine.sock");
        let _listener = UnixListener::bind(&socket).expect("bind");
        let err = prepare_socket_for_bind(&socket).expect_err("in use");
        assert!(err.to_string().contains("already in use"));
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn flush_task_writes_snapshot_on_interval() {
        let home = TempDir::new().expect("home");
        let engine = Arc::new(Engine::open_at(home.path(), &EngineConfig::default()).expect("open"));
        let (shutdown_tx, _) = broadcast::channel::<()>(4);
        let handle = tokio::spawn(flush_task(
            engine,
            Duration::from_secs(5),
            shutdown_tx.subscribe(),
        ));

        tokio::time::sleep(Duration::from_secs(6)).await;
        let _ = shutdown_tx.send(());
        handle.await.expect("join").expect("flush task");
        assert!(store_path(home.path()).exists());
    }

    #[test]
    fn inner_task_error_passes_through() {
        let err = handle_join("worker", Ok(Err(DaemonError::ChannelClosed("queue"))))
            .expect_err("inner error");
        assert!(matches!(err, DaemonError::ChannelClosed("queue")));
    }

    #[tokio::test]
    async fn join_failure_names_the_task() {
        let handle = tokio::task::spawn_blocking(|| -> Result<(), DaemonError> {
            panic!("worker crashed")
        });
        let err = handle_join("worker", handle.await).expect_err("panicked task");
        assert!(matches!(&err, DaemonError::Join { task, .. } if task == "worker"));
        assert!(err.to_string().starts_with("worker task join failure"));
    }
}
