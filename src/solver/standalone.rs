use crate::acme::object::{ChallengeKind, Identifier, InnerChallenge, Token};
use crate::solver::ChallengeSolver;
use anyhow::{Context, Error, bail};
use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// The port CAs conventionally validate http-01 on.
const DEFAULT_VALIDATION_PORT: u16 = 80;

fn default_port() -> u16 {
    DEFAULT_VALIDATION_PORT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfHostedSolverConfiguration {
    /// Port to answer validation requests on. Usually 80, unless NAT remaps it.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for SelfHostedSolverConfiguration {
    fn default() -> Self {
        Self {
            port: DEFAULT_VALIDATION_PORT,
        }
    }
}

/// In-process HTTP listener answering `/.well-known/acme-challenge/{token}`.
///
/// One instance exists per port and is shared by every identifier answered
/// concurrently: solvers register their token in the response map, and the
/// listener shuts down once the last registration is gone.
pub struct HttpChallengeServer {
    port: u16,
    responses: Arc<parking_lot::Mutex<HashMap<String, String>>>,
    state: tokio::sync::Mutex<Option<ListenerState>>,
}

struct ListenerState {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    local_port: u16,
}

impl HttpChallengeServer {
    pub fn new(port: u16) -> Arc<Self> {
        Arc::new(Self {
            port,
            responses: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            state: tokio::sync::Mutex::new(None),
        })
    }

    /// The port the listener is actually bound to. Only differs from the
    /// configured port when that was 0 (tests).
    pub async fn local_port(&self) -> Option<u16> {
        self.state.lock().await.as_ref().map(|state| state.local_port)
    }

    pub async fn register(&self, token: &Token, key_authorization: String) -> anyhow::Result<()> {
        self.responses
            .lock()
            .insert(token.to_string(), key_authorization);
        self.ensure_running().await
    }

    pub async fn deregister(&self, token: &Token) {
        let empty = {
            let mut responses = self.responses.lock();
            responses.remove(token.as_str());
            responses.is_empty()
        };
        if empty {
            self.shutdown().await;
        }
    }

    async fn ensure_running(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], self.port)))
            .await
            .context(format!(
                "Binding challenge listener on port {} failed",
                self.port
            ))?;
        let local_port = listener
            .local_addr()
            .context("Challenge listener has no local address")?
            .port();
        let cancel = CancellationToken::new();
        let responses = self.responses.clone();
        let accept_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (client, _client_addr) = tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                error!("Failed to accept incoming validation connection: {e}");
                                continue;
                            }
                        }
                    }
                    () = accept_cancel.cancelled() => break,
                };
                let io = TokioIo::new(client);
                let responses = responses.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |request| {
                        let responses = responses.clone();
                        async move { http_handler(&responses, &request) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .keep_alive(false)
                        .serve_connection(io, service)
                        .await
                    {
                        debug!("Error serving validation connection: {e}");
                    }
                });
            }
        });
        debug!("Challenge listener bound on port {local_port}");
        *state = Some(ListenerState {
            cancel,
            handle,
            local_port,
        });
        Ok(())
    }

    pub async fn shutdown(&self) {
        let Some(state) = self.state.lock().await.take() else {
            return;
        };
        state.cancel.cancel();
        if let Err(e) = state.handle.await {
            warn!("Challenge listener task failed during shutdown: {e}");
        }
        debug!("Challenge listener on port {} stopped", state.local_port);
    }
}

fn http_handler(
    responses: &parking_lot::Mutex<HashMap<String, String>>,
    request: &Request<hyper::body::Incoming>,
) -> anyhow::Result<Response<Full<Bytes>>> {
    let path = request.uri().path();
    let key_authorization = path
        .strip_prefix("/.well-known/acme-challenge/")
        .filter(|token| !token.contains('/'))
        .and_then(|token| responses.lock().get(token).cloned());
    match key_authorization {
        Some(key_authorization) => Ok(Response::builder()
            .status(200)
            .header(http::header::CONTENT_TYPE, "application/octet-stream")
            .body(Full::new(Bytes::from(key_authorization)))?),
        None => Ok(Response::builder()
            .status(404)
            .header(http::header::CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from("not found")))?),
    }
}

/// Solver that answers the validation request itself instead of relying on an
/// existing webserver. No filesystem interaction.
pub struct SelfHostedSolver {
    server: Arc<HttpChallengeServer>,
    token: Option<Token>,
}

impl SelfHostedSolver {
    pub fn new(server: Arc<HttpChallengeServer>) -> Box<Self> {
        Box::new(Self {
            server,
            token: None,
        })
    }
}

#[async_trait]
impl ChallengeSolver for SelfHostedSolver {
    fn long_name(&self) -> &'static str {
        "self-hosted HTTP listener"
    }

    fn short_name(&self) -> &'static str {
        "self-hosted"
    }

    fn supports_challenge(&self, challenge: &InnerChallenge) -> bool {
        matches!(challenge, InnerChallenge::Http(_))
    }

    fn preferred_kind(&self) -> ChallengeKind {
        ChallengeKind::Http01
    }

    async fn deploy_challenge(
        &mut self,
        _identifier: &Identifier,
        challenge: InnerChallenge,
    ) -> Result<(), Error> {
        let http_challenge = match challenge {
            InnerChallenge::Http(http_challenge) => http_challenge,
            other => bail!("Unsupported challenge type {}", other.get_type()),
        };
        self.server
            .register(&http_challenge.token, http_challenge.key_authorization)
            .await?;
        self.token = Some(http_challenge.token);
        Ok(())
    }

    async fn on_failure(&mut self) -> Result<(), Error> {
        // The listener holds a port; release it even though the proof itself
        // has nothing inspectable on disk.
        if let Some(token) = self.token.take() {
            self.server.deregister(&token).await;
        }
        Ok(())
    }

    async fn cleanup_challenge(mut self: Box<Self>) -> Result<(), Error> {
        let Some(token) = self.token.take() else {
            bail!("No challenge to cleanup");
        };
        self.server.deregister(&token).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn http_challenge(token: &str, authorization: &str) -> InnerChallenge {
        InnerChallenge::Http(crate::acme::object::HttpChallenge {
            token: Token::from_str(token).unwrap(),
            key_authorization: authorization.to_string(),
        })
    }

    #[tokio::test]
    async fn test_listener_answers_exact_challenge_path() {
        let server = HttpChallengeServer::new(0);
        let mut solver = SelfHostedSolver::new(server.clone());
        solver
            .deploy_challenge(
                &Identifier::from_str("example.com").unwrap(),
                http_challenge("token123", "token123.abc"),
            )
            .await
            .unwrap();
        let port = server.local_port().await.unwrap();

        let body = reqwest::get(format!(
            "http://127.0.0.1:{port}/.well-known/acme-challenge/token123"
        ))
        .await
        .unwrap();
        assert_eq!(body.status(), 200);
        assert_eq!(body.text().await.unwrap(), "token123.abc");

        let missing = reqwest::get(format!("http://127.0.0.1:{port}/somewhere/else"))
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);

        solver.cleanup_challenge().await.unwrap();
        assert!(server.local_port().await.is_none());
    }

    #[tokio::test]
    async fn test_listener_is_shared_across_identifiers() {
        let server = HttpChallengeServer::new(0);
        let mut first = SelfHostedSolver::new(server.clone());
        let mut second = SelfHostedSolver::new(server.clone());
        first
            .deploy_challenge(
                &Identifier::from_str("one.example").unwrap(),
                http_challenge("token-one", "one.abc"),
            )
            .await
            .unwrap();
        second
            .deploy_challenge(
                &Identifier::from_str("two.example").unwrap(),
                http_challenge("token-two", "two.abc"),
            )
            .await
            .unwrap();
        let port = server.local_port().await.unwrap();

        for (token, expected) in [("token-one", "one.abc"), ("token-two", "two.abc")] {
            let response = reqwest::get(format!(
                "http://127.0.0.1:{port}/.well-known/acme-challenge/{token}"
            ))
            .await
            .unwrap();
            assert_eq!(response.text().await.unwrap(), expected);
        }

        // The listener survives the first cleanup and stops after the last one
        first.cleanup_challenge().await.unwrap();
        assert!(server.local_port().await.is_some());
        second.cleanup_challenge().await.unwrap();
        assert!(server.local_port().await.is_none());
    }
}
