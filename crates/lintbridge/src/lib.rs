//! lintbridge: reverse-connection JSON-RPC bridge to a static-analysis language server.

mod config;
mod language;
mod logging;
mod version;

pub mod acceptor;
pub mod bridge;
pub mod driver;
pub mod engine;
pub mod rpc;
pub mod rules;
pub mod session;

#[cfg(test)]
mod testing;

pub use acceptor::{AcceptorError, ReverseAcceptor};
pub use driver::{analyze, analyze_with_events};
pub use engine::{ChildEngine, EngineLauncher, EngineProcess, JavaLauncher, LaunchError};
pub use rpc::{RpcClient, RpcError};
pub use rules::{RuleDetails, RuleError, RuleResolver, parse_rule_details};
pub use session::{
    AnalysisReport, AnalysisSession, FileReport, SessionError, SessionId, SessionState,
};

pub use config::{BridgeConfig, InitializationOptions};
pub use language::{PLAINTEXT, common_root, from_file_uri, language_id, to_file_uri};
pub use logging::init_tracing;
pub use version::{CLIENT_NAME, CLIENT_VERSION, ClientInfo};
