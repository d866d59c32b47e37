use crate::acme::object::{ChallengeKind, DnsChallenge, Identifier, InnerChallenge};
use crate::cmd_runner::run_shell_command_checked;
use crate::solver::ChallengeSolver;
use anyhow::{Context, Error, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Environment passed to create/delete hook scripts.
const ENV_DOMAIN: &str = "CHALLENGE_DOMAIN";
const ENV_RECORD_NAME: &str = "CHALLENGE_RECORD_NAME";
const ENV_RECORD_VALUE: &str = "CHALLENGE_RECORD_VALUE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsScriptSolverConfiguration {
    /// Shell command creating the TXT record. Receives the record through
    /// `CHALLENGE_DOMAIN`, `CHALLENGE_RECORD_NAME` and `CHALLENGE_RECORD_VALUE`.
    pub create_command: String,
    /// Shell command deleting the TXT record again. Same environment.
    pub delete_command: String,
}

/// Publishes the TXT proof by invoking operator-provided hook scripts.
/// Waiting for propagation is the orchestrator's job, not this solver's.
#[derive(Debug, Clone)]
pub struct DnsScriptSolver {
    config: DnsScriptSolverConfiguration,
    deployed: Option<DeployedRecord>,
}

#[derive(Debug, Clone)]
struct DeployedRecord {
    domain: String,
    record_name: String,
    record_value: String,
}

impl DnsScriptSolver {
    pub fn from_config(config: DnsScriptSolverConfiguration) -> Box<Self> {
        Box::new(Self {
            config,
            deployed: None,
        })
    }

    fn environment(record: &DeployedRecord) -> HashMap<OsString, OsString> {
        HashMap::from([
            (ENV_DOMAIN.into(), record.domain.as_str().into()),
            (ENV_RECORD_NAME.into(), record.record_name.as_str().into()),
            (
                ENV_RECORD_VALUE.into(),
                record.record_value.as_str().into(),
            ),
        ])
    }
}

#[async_trait]
impl ChallengeSolver for DnsScriptSolver {
    fn long_name(&self) -> &'static str {
        "DNS hook script solver"
    }

    fn short_name(&self) -> &'static str {
        "dns-script"
    }

    fn supports_challenge(&self, challenge: &InnerChallenge) -> bool {
        matches!(challenge, InnerChallenge::Dns(_))
    }

    fn preferred_kind(&self) -> ChallengeKind {
        ChallengeKind::Dns01
    }

    async fn deploy_challenge(
        &mut self,
        identifier: &Identifier,
        challenge: InnerChallenge,
    ) -> Result<(), Error> {
        let dns_challenge = match challenge {
            InnerChallenge::Dns(dns_challenge) => dns_challenge,
            other => bail!("Unsupported challenge type {}", other.get_type()),
        };
        let record_name = DnsChallenge::record_name(identifier)?;
        let record = DeployedRecord {
            domain: identifier.to_string(),
            record_name: record_name.as_ascii().to_string(),
            record_value: dns_challenge.record_value,
        };
        run_shell_command_checked(
            self.config.create_command.as_ref(),
            Self::environment(&record),
        )
        .await
        .context(format!(
            "DNS create hook failed for {}",
            record.record_name
        ))?;
        self.deployed = Some(record);
        Ok(())
    }

    async fn cleanup_challenge(self: Box<Self>) -> Result<(), Error> {
        let Some(record) = self.deployed else {
            bail!("No challenge to cleanup");
        };
        run_shell_command_checked(
            self.config.delete_command.as_ref(),
            Self::environment(&record),
        )
        .await
        .context(format!(
            "DNS delete hook failed for {}",
            record.record_name
        ))
    }
}

/// Registration at an acme-dns style service, received out-of-band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsApiRegistration {
    /// The full domain received from the service during registration; the
    /// operator points a permanent CNAME from `_acme-challenge.{domain}` here.
    pub full_domain: String,
    /// The subdomain part from the registration
    pub subdomain: String,
    /// API username received during registration
    pub username: String,
    /// API password (or API key) received during registration
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsApiSolverConfiguration {
    /// API URL of the record-update service
    pub server: Url,
    pub registration: DnsApiRegistration,
}

#[derive(Debug, Clone)]
pub struct DnsApiClient {
    server_url: Url,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct UpdateBody {
    subdomain: String,
    txt: String,
}

impl DnsApiClient {
    pub fn new(server_url: Url, client: reqwest::Client) -> Self {
        Self { server_url, client }
    }

    pub fn new_with_default_transport(server_url: Url) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(crate::CRATE_NAME)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::new(server_url, client))
    }

    pub async fn update_txt(
        &self,
        registration: &DnsApiRegistration,
        value: String,
    ) -> Result<(), Error> {
        let body = UpdateBody {
            subdomain: registration.subdomain.clone(),
            txt: value,
        };
        self.client
            .post(self.server_url.join("update")?)
            .header("X-Api-User", registration.username.as_str())
            .header("X-Api-Key", registration.password.as_str())
            .json(&body)
            .send()
            .await
            .context(format!(
                "Updating TXT record at DNS API server {}",
                self.server_url
            ))?
            .error_for_status()
            .context(format!(
                "Updating TXT record at DNS API server {}",
                self.server_url
            ))?;
        Ok(())
    }
}

/// Publishes the TXT proof through an acme-dns compatible HTTP API, relying on
/// a permanent CNAME delegation from the challenge name to the registration.
pub struct DnsApiSolver {
    client: DnsApiClient,
    registration: DnsApiRegistration,
}

impl DnsApiSolver {
    pub fn new(client: DnsApiClient, registration: DnsApiRegistration) -> Box<Self> {
        Box::new(Self {
            client,
            registration,
        })
    }

    pub fn try_from_config(config: DnsApiSolverConfiguration) -> anyhow::Result<Box<Self>> {
        if config.registration.username.is_empty() || config.registration.password.is_empty() {
            bail!("DNS API solver is missing credentials");
        }
        let client = DnsApiClient::new_with_default_transport(config.server)?;
        Ok(Self::new(client, config.registration))
    }
}

#[async_trait]
impl ChallengeSolver for DnsApiSolver {
    fn long_name(&self) -> &'static str {
        "DNS API challenge solver"
    }

    fn short_name(&self) -> &'static str {
        "dns-api"
    }

    fn supports_challenge(&self, challenge: &InnerChallenge) -> bool {
        matches!(challenge, InnerChallenge::Dns(_))
    }

    fn preferred_kind(&self) -> ChallengeKind {
        ChallengeKind::Dns01
    }

    async fn deploy_challenge(
        &mut self,
        identifier: &Identifier,
        challenge: InnerChallenge,
    ) -> Result<(), Error> {
        let dns_challenge = match challenge {
            InnerChallenge::Dns(dns_challenge) => dns_challenge,
            other => bail!("Unsupported challenge type {}", other.get_type()),
        };
        let challenge_name = DnsChallenge::record_name(identifier)?;
        let expected = &self.registration.full_domain;
        if challenge_name.as_ascii() != expected {
            warn!(
                "This solver updates {expected}, but the challenge name is {challenge_name}. \
                 Validation relies on a CNAME pointing there. Did you remove or modify the CNAME?"
            );
            // Proceed anyway, maybe our view of the world isn't correct
        }
        self.client
            .update_txt(&self.registration, dns_challenge.record_value)
            .await?;
        Ok(())
    }

    async fn cleanup_challenge(self: Box<Self>) -> Result<(), Error> {
        // The service keeps the record (it has no delete API), but its TTL is
        // short. Settle briefly to avoid tight races with an immediately
        // following challenge for the same registration.
        debug!("Leaving TXT record at the DNS API service to expire on its own");
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dns_challenge(value: &str) -> InnerChallenge {
        InnerChallenge::Dns(DnsChallenge {
            token: crate::acme::object::Token::from_str("token123").unwrap(),
            record_value: value.to_string(),
        })
    }

    fn registration() -> DnsApiRegistration {
        DnsApiRegistration {
            full_domain: "abc123.auth.example".to_string(),
            subdomain: "abc123".to_string(),
            username: "user".to_string(),
            password: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_script_solver_passes_record_through_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("record");
        let config = DnsScriptSolverConfiguration {
            create_command: format!(
                r#"printf '%s %s' "$CHALLENGE_RECORD_NAME" "$CHALLENGE_RECORD_VALUE" > {}"#,
                out.display()
            ),
            delete_command: format!("rm {}", out.display()),
        };
        let mut solver = DnsScriptSolver::from_config(config);

        solver
            .deploy_challenge(
                &Identifier::from_str("example.com").unwrap(),
                dns_challenge("record-digest"),
            )
            .await
            .unwrap();
        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written, "_acme-challenge.example.com record-digest");

        solver.cleanup_challenge().await.unwrap();
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_script_solver_surfaces_hook_failure() {
        let config = DnsScriptSolverConfiguration {
            create_command: "exit 1".to_string(),
            delete_command: "true".to_string(),
        };
        let mut solver = DnsScriptSolver::from_config(config);

        let result = solver
            .deploy_challenge(
                &Identifier::from_str("example.com").unwrap(),
                dns_challenge("record-digest"),
            )
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_api_solver_updates_record() {
        let mut server = mockito::Server::new_async().await;
        let update = server
            .mock("POST", "/update")
            .match_header("X-Api-User", "user")
            .match_header("X-Api-Key", "secret")
            .match_body(mockito::Matcher::JsonString(
                r#"{"subdomain":"abc123","txt":"record-digest"}"#.to_string(),
            ))
            .with_status(200)
            .create_async()
            .await;
        let config = DnsApiSolverConfiguration {
            server: Url::parse(&server.url()).unwrap(),
            registration: registration(),
        };
        let mut solver = DnsApiSolver::try_from_config(config).unwrap();

        solver
            .deploy_challenge(
                &Identifier::from_str("abc123.auth.example").unwrap(),
                dns_challenge("record-digest"),
            )
            .await
            .unwrap();

        update.assert_async().await;
    }

    #[test]
    fn test_api_solver_requires_credentials() {
        let mut incomplete = registration();
        incomplete.password = String::new();
        let config = DnsApiSolverConfiguration {
            server: Url::parse("https://auth.example").unwrap(),
            registration: incomplete,
        };
        assert!(DnsApiSolver::try_from_config(config).is_err());
    }
}
