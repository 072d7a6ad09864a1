//! Process wiring for the long-running modes: logging, engine start-up,
//! mounts and signal-driven shutdown.

use std::path::Path;
use std::sync::Arc;

use object_store::{DryRunBackend, ObjectStoreError, TransferBackend};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer as _;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AgentConfig;
use crate::database::models::Rule;
use crate::engine::{adopt_existing, resume, Engine, EngineConfig, Mode, RuleRuntime};
use crate::error::EngineError;
use crate::registry::RuleRegistry;
use crate::state::AppState;

/// Keeps the file log writer flushing until dropped.
#[must_use = "dropping the guard stops the file log writer"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber: stderr always, plus `log_file` when given.
///
/// `level` is an `EnvFilter` directive such as `info` or `loft_daemon=debug`.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> LogGuard {
    let filter = || EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter());

    let (file, guard) = match log_file.and_then(|path| Some((path.parent()?, path.file_name()?))) {
        Some((dir, name)) => {
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // A subscriber may already be installed (tests, embedding); keep it.
    let _ = tracing_subscriber::registry()
        .with(stderr)
        .with(file)
        .try_init();

    LogGuard { _file: guard }
}

/// Backend for one rule in the given mode.
pub fn connect_rule(
    config: &AgentConfig,
    rule: &Rule,
    mode: Mode,
    rclone_config: Option<&Path>,
) -> Result<Arc<dyn TransferBackend>, EngineError> {
    let target = &rule.remote_target;
    let connected =
        object_store::connect_with(target, config.credentials_for(target), rclone_config);

    match (mode, connected) {
        (Mode::DryRun, Ok(backend)) => Ok(Arc::new(DryRunBackend::with_reads_from(backend))),
        (Mode::DryRun, Err(e)) => {
            warn!(rule = %rule.id, error = %e, "no backend for reads; dry-run stubs will not hydrate");
            Ok(Arc::new(DryRunBackend::new()))
        }
        (_, Ok(backend)) => Ok(backend),
        (_, Err(ObjectStoreError::InvalidConfig(msg))) => Err(EngineError::InvalidConfig(msg)),
        (_, Err(source)) => Err(EngineError::BackendUnreachable {
            target: format!("{}/{}", target.endpoint, target.bucket),
            source,
        }),
    }
}

/// Runtime for `rule` from the saved config: cache directory, backend,
/// excludes and policy.
pub fn rule_runtime(
    state: &AppState,
    config: &AgentConfig,
    rule: &Rule,
    mode: Mode,
) -> Result<RuleRuntime, EngineError> {
    let backend = connect_rule(config, rule, mode, state.rclone_config())?;
    let policy = config
        .rule(&rule.id)
        .map(|rule_config| rule_config.policy)
        .unwrap_or_default();
    Ok(
        RuleRuntime::new(rule.clone(), state.cache_dir(&rule.id), backend)
            .with_excludes(config.excludes()?)
            .with_policy(policy),
    )
}

/// Run the agent in `mode` until SIGINT or SIGTERM.
pub async fn run(state: &AppState, mode: Mode) -> Result<(), EngineError> {
    let config = state.saved_config()?.ok_or_else(|| {
        EngineError::InvalidConfig("no config imported; run `loft config import <file>`".into())
    })?;
    state.write_rclone_config(&config)?;
    let db = state.open_database().await?;
    let registry = RuleRegistry::load(&db).await?;
    if registry.is_empty() {
        return Err(EngineError::InvalidConfig(
            "no rules imported; run `loft config import <file>`".into(),
        ));
    }

    let mut builder = Engine::builder(db.clone())
        .mode(mode)
        .config(EngineConfig::from(&config.engine));
    for rule in registry.rules() {
        builder = builder.rule(rule_runtime(state, &config, rule, mode)?);
    }
    let engine = builder.build().await?;

    let result = serve(&engine).await;

    engine.shutdown().await;
    db.close().await;
    info!("agent stopped");
    result
}

async fn serve(engine: &Engine) -> Result<(), EngineError> {
    for runtime in engine.runtimes() {
        adopt_existing(runtime).await?;
    }
    resume(engine).await?;

    #[cfg(feature = "fuse")]
    let mounts = {
        let mut mounts = Vec::new();
        for runtime in engine.runtimes() {
            let view = crate::vfs::MountView::new(engine.clone(), runtime.id())?;
            match crate::fuse::mount(view, tokio::runtime::Handle::current()) {
                Ok(mount) => mounts.push(mount),
                Err(e) => {
                    unmount_all(mounts).await;
                    return Err(e);
                }
            }
        }
        mounts
    };
    #[cfg(not(feature = "fuse"))]
    warn!("built without FUSE support; nothing is mounted");

    info!(mode = %engine.mode(), "agent running; press Ctrl-C to stop");
    wait_for_signal().await;

    #[cfg(feature = "fuse")]
    unmount_all(mounts).await;
    Ok(())
}

#[cfg(feature = "fuse")]
async fn unmount_all(mounts: Vec<crate::fuse::Mount>) {
    for mount in mounts {
        let rule = mount.rule_id();
        if let Err(e) = tokio::task::spawn_blocking(move || mount.unmount()).await {
            warn!(rule = %rule, error = %e, "unmount task failed");
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
