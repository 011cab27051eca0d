//! End-to-end analysis run: listen, launch the engine, analyze, tear down.

use std::path::PathBuf;

use anyhow::{Context, anyhow};
use tokio::sync::mpsc;

use crate::acceptor::ReverseAcceptor;
use crate::config::BridgeConfig;
use crate::engine::EngineLauncher;
use crate::session::{AnalysisReport, AnalysisSession, FileReport};

/// Analyze `files` with an engine started by `launcher`.
pub async fn analyze(
    config: &BridgeConfig,
    launcher: &dyn EngineLauncher,
    files: Vec<PathBuf>,
) -> anyhow::Result<AnalysisReport> {
    analyze_with_events(config, launcher, files, None).await
}

/// Like [`analyze`], also sending each file's report to `file_events` as it completes.
///
/// The acceptor and the engine are stopped before returning, whatever the outcome.
pub async fn analyze_with_events(
    config: &BridgeConfig,
    launcher: &dyn EngineLauncher,
    files: Vec<PathBuf>,
    file_events: Option<mpsc::UnboundedSender<FileReport>>,
) -> anyhow::Result<AnalysisReport> {
    if files.is_empty() {
        tracing::info!("No files to analyze");
        return Ok(AnalysisReport::empty());
    }

    let mut acceptor = ReverseAcceptor::bind(&config.host)
        .await
        .context("failed to open engine listener")?
        .with_max_frame_buffer(config.max_frame_buffer);

    let mut engine = match launcher.launch(acceptor.port()) {
        Ok(engine) => engine,
        Err(e) => {
            acceptor.stop().await;
            return Err(e).context("failed to launch engine");
        }
    };

    let result = run_session(config, &mut acceptor, files, file_events).await;

    acceptor.stop().await;
    engine.stop().await;

    if let Err(e) = &result {
        tracing::error!(error = %e, "Analysis failed");
    }
    result
}

async fn run_session(
    config: &BridgeConfig,
    acceptor: &mut ReverseAcceptor,
    files: Vec<PathBuf>,
    file_events: Option<mpsc::UnboundedSender<FileReport>>,
) -> anyhow::Result<AnalysisReport> {
    let client = tokio::time::timeout(config.connect_timeout, acceptor.accept())
        .await
        .map_err(|_| {
            anyhow!(
                "engine did not connect within {:?}",
                config.connect_timeout
            )
        })?
        .context("failed to accept engine connection")?;

    let mut session = AnalysisSession::new(client, files)
        .with_initialization(config.initialization.clone());
    if let Some(tx) = file_events {
        session = session.with_file_events(tx);
    }

    let run = session.run();
    let report = match config.analysis_timeout {
        Some(limit) => tokio::time::timeout(limit, run)
            .await
            .map_err(|_| anyhow!("analysis did not complete within {limit:?}"))??,
        None => run.await?,
    };
    Ok(report)
}
