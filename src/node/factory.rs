//! Session factories
//!
//! A factory knows how to start the backend behind one slot: a test
//! double, or a WebDriver server process. Factories hand back the session
//! descriptor plus a terminator the node runs when the session stops.

use std::net::TcpListener;
use std::process::{Command, Stdio};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::data::{Capabilities, NodeId, Session, SessionId};

/// Everything a factory needs to start one session
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub node_id: NodeId,

    /// Externally reachable address of the owning node
    pub node_uri: String,

    /// Stereotype of the slot being filled
    pub stereotype: Capabilities,

    /// Capabilities the caller asked for
    pub requested: Capabilities,
}

impl CreateSessionRequest {
    /// Negotiated capabilities: the stereotype with the request merged on
    /// top. Matching guarantees the two agree on shared keys.
    pub fn negotiated_capabilities(&self) -> Capabilities {
        self.stereotype
            .merged_with(&self.requested)
            .unwrap_or_else(|_| self.requested.clone())
    }
}

/// Teardown hook for whatever backs a live session
pub struct SessionTerminator(Box<dyn FnMut() + Send>);

impl SessionTerminator {
    pub fn new(terminate: impl FnMut() + Send + 'static) -> Self {
        Self(Box::new(terminate))
    }

    /// No backend to tear down
    pub fn noop() -> Self {
        Self(Box::new(|| {}))
    }

    pub fn terminate(&mut self) {
        (self.0)()
    }
}

impl std::fmt::Debug for SessionTerminator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionTerminator")
    }
}

/// A freshly started session and its teardown hook
#[derive(Debug)]
pub struct CreatedSession {
    pub session: Session,
    pub terminator: SessionTerminator,
}

#[derive(Debug, Error)]
pub enum SessionFactoryError {
    #[error("failed to launch session backend: {0}")]
    Launch(#[from] std::io::Error),

    #[error("session backend failed: {0}")]
    Failed(String),
}

/// Capability interface every slot backend implements
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Can this factory produce sessions for `stereotype`? Checked once at
    /// slot registration.
    fn accepts(&self, stereotype: &Capabilities) -> bool;

    async fn create(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, SessionFactoryError>;
}

/// In-memory factory for tests and local experiments
///
/// Produces sessions pointing at a fixed URI with no backend behind them.
pub struct TestSessionFactory {
    uri: String,
}

impl TestSessionFactory {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl SessionFactory for TestSessionFactory {
    fn accepts(&self, _stereotype: &Capabilities) -> bool {
        true
    }

    async fn create(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, SessionFactoryError> {
        let session = Session {
            id: SessionId::new(),
            node_id: request.node_id,
            stereotype: request.stereotype.clone(),
            capabilities: request.negotiated_capabilities(),
            started_at: Utc::now(),
            uri: self.uri.clone(),
        };
        Ok(CreatedSession {
            session,
            terminator: SessionTerminator::noop(),
        })
    }
}

/// Factory that always fails; exercises the release-on-failure path
pub struct FailingSessionFactory {
    message: String,
}

impl FailingSessionFactory {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl SessionFactory for FailingSessionFactory {
    fn accepts(&self, _stereotype: &Capabilities) -> bool {
        true
    }

    async fn create(
        &self,
        _request: CreateSessionRequest,
    ) -> Result<CreatedSession, SessionFactoryError> {
        Err(SessionFactoryError::Failed(self.message.clone()))
    }
}

/// Process-backed factory: one WebDriver server binary per session
///
/// Spawns `<command> [args..] --port <free port>` and advertises the
/// session at that port. The advertised host comes from `HOSTNAME` when
/// set, so containerized deployments expose a reachable address.
pub struct DriverSessionFactory {
    command: String,
    args: Vec<String>,
}

impl DriverSessionFactory {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn advertised_host() -> String {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
    }

    fn free_port() -> std::io::Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        Ok(listener.local_addr()?.port())
    }
}

#[async_trait]
impl SessionFactory for DriverSessionFactory {
    fn accepts(&self, _stereotype: &Capabilities) -> bool {
        true
    }

    async fn create(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, SessionFactoryError> {
        let port = Self::free_port()?;
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg("--port")
            .arg(port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let session = Session {
            id: SessionId::new(),
            node_id: request.node_id,
            stereotype: request.stereotype.clone(),
            capabilities: request.negotiated_capabilities(),
            started_at: Utc::now(),
            uri: format!("http://{}:{}", Self::advertised_host(), port),
        };
        let terminator = SessionTerminator::new(move || {
            let _ = child.kill();
            let _ = child.wait();
        });
        Ok(CreatedSession {
            session,
            terminator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreateSessionRequest {
        CreateSessionRequest {
            node_id: NodeId::new(),
            node_uri: "http://node.example:5555".to_string(),
            stereotype: Capabilities::new()
                .with("browserName", "chrome")
                .with("platformName", "linux"),
            requested: Capabilities::new().with("browserName", "chrome"),
        }
    }

    #[tokio::test]
    async fn test_test_factory_negotiates_from_stereotype() {
        let factory = TestSessionFactory::new("http://node.example:5555");
        let created = factory.create(request()).await.unwrap();

        assert_eq!(created.session.uri, "http://node.example:5555");
        assert_eq!(
            created.session.capabilities.get("platformName"),
            Some(&serde_json::json!("linux"))
        );
    }

    #[tokio::test]
    async fn test_failing_factory_reports_its_message() {
        let factory = FailingSessionFactory::new("no browsers today");
        let err = factory.create(request()).await.unwrap_err();
        assert!(matches!(err, SessionFactoryError::Failed(m) if m == "no browsers today"));
    }

    #[tokio::test]
    async fn test_driver_factory_spawns_a_process_per_session() {
        let factory = DriverSessionFactory::new("sleep").with_arg("30");
        let mut created = factory.create(request()).await.unwrap();

        assert!(created.session.uri.starts_with("http://"));
        assert!(created.session.uri.rsplit(':').next().is_some());

        // Reap the backing process.
        created.terminator.terminate();
    }

    #[test]
    fn test_terminator_runs_once_per_call() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut terminator = SessionTerminator::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        terminator.terminate();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
