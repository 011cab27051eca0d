//! Analysis session: one run of handshake, document submission and
//! diagnostic collection over an accepted engine connection.
//!
//! Lifecycle:
//! `Created → Initializing → SubmittingDocuments → AwaitingDiagnostics → Completed`
//!
//! A file leaves the pending set only when every one of its diagnostics has
//! its rule metadata resolved (or immediately, when the engine reports no
//! diagnostics for it). The run finishes the moment the pending set empties.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::FuturesUnordered;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tracing::Instrument;
use uuid::Uuid;

use crate::bridge::protocol::{
    DidOpenTextDocumentParams, Diagnostic, PublishDiagnosticsParams, TextDocumentItem, methods,
};
use crate::config::InitializationOptions;
use crate::language;
use crate::rpc::{RpcClient, RpcError};
use crate::rules::{RuleDetails, RuleError, RuleResolver};
use crate::version::ClientInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Initializing,
    SubmittingDocuments,
    AwaitingDiagnostics,
    Completed,
}

/// Result record for one analyzed file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileReport {
    pub uri: String,
    pub diagnostics: Vec<Diagnostic>,
    /// Metadata for every rule referenced by `diagnostics`, keyed by rule code.
    pub rules: IndexMap<String, RuleDetails>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Files in the order they completed.
    pub files: Vec<FileReport>,
}

impl AnalysisReport {
    /// Report for a run with nothing to analyze.
    pub fn empty() -> Self {
        let now = Utc::now();
        Self {
            session_id: SessionId::new(),
            started_at: now,
            completed_at: now,
            files: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("initialize failed: {0}")]
    Initialize(#[source] RpcError),
    #[error("failed to submit {uri}: {source}")]
    Submit {
        uri: String,
        #[source]
        source: RpcError,
    },
    #[error("engine connection lost with {pending} file(s) still pending")]
    ConnectionLost { pending: usize },
}

enum FileProgress {
    Submitted,
    Resolving {
        diagnostics: Vec<Diagnostic>,
        resolved: usize,
        rules: IndexMap<String, RuleDetails>,
    },
}

struct Resolution {
    uri: String,
    rule: String,
    outcome: Result<RuleDetails, RuleError>,
}

pub struct AnalysisSession {
    id: SessionId,
    rpc: RpcClient,
    resolver: RuleResolver,
    files: Vec<PathBuf>,
    initialization: InitializationOptions,
    client_info: ClientInfo,
    file_events: Option<mpsc::UnboundedSender<FileReport>>,
    state: watch::Sender<SessionState>,
}

impl AnalysisSession {
    pub fn new(rpc: RpcClient, files: Vec<PathBuf>) -> Self {
        let resolver = RuleResolver::new(rpc.clone());
        Self {
            id: SessionId::new(),
            rpc,
            resolver,
            files,
            initialization: InitializationOptions::default(),
            client_info: ClientInfo::default(),
            file_events: None,
            state: watch::Sender::new(SessionState::Created),
        }
    }

    pub fn with_initialization(mut self, options: InitializationOptions) -> Self {
        self.initialization = options;
        self
    }

    pub fn with_client_info(mut self, info: ClientInfo) -> Self {
        self.client_info = info;
        self
    }

    /// Receive each file's report as soon as that file completes.
    pub fn with_file_events(mut self, tx: mpsc::UnboundedSender<FileReport>) -> Self {
        self.file_events = Some(tx);
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Follow state transitions while `run` is in progress.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        tracing::debug!(?previous, ?next, "Session state transition");
    }

    /// Drive the session to completion.
    ///
    /// Returns once every file has completed. If a file never completes the
    /// future never resolves; callers wanting a bound apply their own timeout.
    pub async fn run(self) -> Result<AnalysisReport, SessionError> {
        let span = tracing::info_span!("analysis", session_id = %self.id, files = self.files.len());
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> Result<AnalysisReport, SessionError> {
        let started_at = Utc::now();

        // Subscribe before anything is sent so no early diagnostics are missed.
        let (diagnostics_tx, mut diagnostics_rx) = mpsc::unbounded_channel();
        self.rpc.subscribe(methods::PUBLISH_DIAGNOSTICS, diagnostics_tx);

        self.transition(SessionState::Initializing);
        self.initialize().await?;

        self.transition(SessionState::SubmittingDocuments);
        let mut pending = self.submit_documents().await?;
        tracing::info!(pending = pending.len(), "Documents submitted");

        self.transition(SessionState::AwaitingDiagnostics);
        let mut reports = Vec::with_capacity(pending.len());
        let mut resolutions: FuturesUnordered<BoxFuture<'static, Resolution>> =
            FuturesUnordered::new();

        while !pending.is_empty() {
            tokio::select! {
                biased;

                Some(params) = diagnostics_rx.recv() => {
                    let completed = self.on_diagnostics(params, &mut pending, &mut resolutions);
                    if let Some(report) = completed {
                        self.complete_file(report, &mut reports);
                    }
                }

                Some(resolution) = resolutions.next(), if !resolutions.is_empty() => {
                    if let Some(report) = on_resolution(resolution, &mut pending) {
                        self.complete_file(report, &mut reports);
                    }
                }

                _ = self.rpc.closed() => {
                    tracing::error!(pending = pending.len(), "Engine connection lost before analysis completed");
                    return Err(SessionError::ConnectionLost { pending: pending.len() });
                }
            }
        }

        // Dropping the receiver unsubscribes; later diagnostics are discarded.
        drop(diagnostics_rx);
        self.transition(SessionState::Completed);
        tracing::info!(files = reports.len(), "Analysis completed");

        Ok(AnalysisReport {
            session_id: self.id,
            started_at,
            completed_at: Utc::now(),
            files: reports,
        })
    }

    async fn initialize(&self) -> Result<(), SessionError> {
        let root_uri = language::common_root(&self.files).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not determine workspace root");
            None
        });
        let params = json!({
            "processId": std::process::id(),
            "rootUri": root_uri,
            "capabilities": {},
            "clientInfo": self.client_info,
            "initializationOptions": self.initialization,
        });

        let response = tokio::select! {
            biased;

            response = self.rpc.request(methods::INITIALIZE, params) => response,
            _ = self.rpc.closed() => Err(RpcError::ConnectionClosed),
        };
        response.map_err(SessionError::Initialize)?;
        tracing::debug!("Engine initialized");

        self.rpc
            .notify(methods::INITIALIZED, json!({}))
            .map_err(SessionError::Initialize)
    }

    async fn submit_documents(&self) -> Result<HashMap<String, FileProgress>, SessionError> {
        let mut pending = HashMap::with_capacity(self.files.len());

        for path in &self.files {
            let read_error = |source| SessionError::ReadFile {
                path: path.clone(),
                source,
            };
            let text = tokio::fs::read_to_string(path).await.map_err(read_error)?;
            let uri = language::to_file_uri(path).map_err(read_error)?;

            if pending.contains_key(&uri) {
                tracing::warn!(%uri, "Skipping duplicate input file");
                continue;
            }
            pending.insert(uri.clone(), FileProgress::Submitted);

            let params = DidOpenTextDocumentParams {
                text_document: TextDocumentItem {
                    uri: uri.clone(),
                    language_id: language::language_id(path).to_string(),
                    version: 1,
                    text,
                },
            };
            self.rpc
                .notify(methods::DID_OPEN, params)
                .map_err(|source| SessionError::Submit {
                    uri: uri.clone(),
                    source,
                })?;
            tracing::debug!(%uri, "Submitted document");
        }

        Ok(pending)
    }

    fn on_diagnostics(
        &self,
        params: Value,
        pending: &mut HashMap<String, FileProgress>,
        resolutions: &mut FuturesUnordered<BoxFuture<'static, Resolution>>,
    ) -> Option<FileReport> {
        let params: PublishDiagnosticsParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed diagnostics notification");
                return None;
            }
        };
        let uri = params.uri;

        let progress = match pending.get_mut(&uri) {
            None => {
                tracing::debug!(%uri, "Ignoring diagnostics for a file that is not pending");
                return None;
            }
            Some(FileProgress::Resolving { .. }) => {
                tracing::debug!(%uri, "Ignoring repeated diagnostics for a file already resolving");
                return None;
            }
            Some(progress) => progress,
        };

        tracing::debug!(%uri, diagnostics = params.diagnostics.len(), "Received diagnostics");

        let mut resolved = 0;
        for diagnostic in &params.diagnostics {
            let Some(rule) = diagnostic.rule_key() else {
                resolved += 1;
                continue;
            };
            let resolver = self.resolver.clone();
            let uri = uri.clone();
            let diagnostic = diagnostic.clone();
            resolutions.push(
                async move {
                    let outcome = resolver.resolve(&rule, &uri, &diagnostic).await;
                    Resolution { uri, rule, outcome }
                }
                .boxed(),
            );
        }

        let done = resolved == params.diagnostics.len();
        *progress = FileProgress::Resolving {
            diagnostics: params.diagnostics,
            resolved,
            rules: IndexMap::new(),
        };

        if done { take_report(pending, &uri) } else { None }
    }

    fn complete_file(&self, report: FileReport, reports: &mut Vec<FileReport>) {
        tracing::info!(uri = %report.uri, diagnostics = report.diagnostics.len(), "File analyzed");
        if let Some(events) = &self.file_events
            && events.send(report.clone()).is_err()
        {
            tracing::debug!("File event receiver dropped");
        }
        reports.push(report);
    }
}

fn on_resolution(
    resolution: Resolution,
    pending: &mut HashMap<String, FileProgress>,
) -> Option<FileReport> {
    let Resolution { uri, rule, outcome } = resolution;

    let details = match outcome {
        Ok(details) => details,
        Err(e) => {
            tracing::warn!(%uri, %rule, error = %e, "Rule metadata unavailable, file stays pending");
            return None;
        }
    };

    let Some(FileProgress::Resolving {
        diagnostics,
        resolved,
        rules,
    }) = pending.get_mut(&uri)
    else {
        return None;
    };

    *resolved += 1;
    rules.entry(details.code.clone()).or_insert(details);

    if *resolved == diagnostics.len() {
        take_report(pending, &uri)
    } else {
        None
    }
}

fn take_report(pending: &mut HashMap<String, FileProgress>, uri: &str) -> Option<FileReport> {
    match pending.remove(uri)? {
        FileProgress::Resolving {
            diagnostics, rules, ..
        } => Some(FileReport {
            uri: uri.to_string(),
            diagnostics,
            rules,
        }),
        FileProgress::Submitted => None,
    }
}
