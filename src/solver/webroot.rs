use crate::acme::object::{ACME_CHALLENGE_PATH, ChallengeKind, Identifier, InnerChallenge, Token};
use crate::solver::ChallengeSolver;
use anyhow::{Context, Error, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Server-config fragment that lets a webserver serve the extensionless proof
/// files as static content.
const WEB_CONFIG_CONTENT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<configuration>
  <system.webServer>
    <staticContent>
      <mimeMap fileExtension="." mimeType="text/plain" />
    </staticContent>
  </system.webServer>
</configuration>
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebrootSolverConfiguration {
    /// Document root of the webserver serving the identifier. May contain
    /// environment variables (`$VAR`, `${VAR}` or `%VAR%`).
    pub webroot: String,
    /// Write a config fragment so the webserver serves extensionless files.
    #[serde(default)]
    pub write_web_config: bool,
}

/// Serves the HTTP proof through an existing webserver by dropping a file into
/// its document root.
#[derive(Debug, Default, Clone)]
pub struct WebrootSolver {
    webroot: PathBuf,
    write_web_config: bool,
    challenge_file: Option<PathBuf>,
    web_config_file: Option<PathBuf>,
}

impl WebrootSolver {
    pub fn from_config(config: WebrootSolverConfiguration) -> anyhow::Result<Box<Self>> {
        let expanded = expand_env_vars(&config.webroot);
        if expanded.trim().is_empty() {
            bail!("Webroot path is empty");
        }
        Ok(Box::new(WebrootSolver {
            webroot: normalize_separators(&expanded),
            write_web_config: config.write_web_config,
            challenge_file: None,
            web_config_file: None,
        }))
    }

    pub fn challenge_path(&self, token: &Token) -> PathBuf {
        // The authority-provided parts are relative by construction (Token
        // rejects separators), so plain joins cannot escape the webroot.
        self.webroot
            .join(Path::new(ACME_CHALLENGE_PATH))
            .join(token.as_str())
    }

    fn challenge_directory(&self) -> PathBuf {
        self.webroot.join(Path::new(ACME_CHALLENGE_PATH))
    }
}

#[async_trait]
impl ChallengeSolver for WebrootSolver {
    fn long_name(&self) -> &'static str {
        "webroot"
    }

    fn short_name(&self) -> &'static str {
        "webroot"
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
        let challenge_path = self.challenge_path(&http_challenge.token);
        if let Some(parent) = challenge_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(format!("Failed to create directory {}", parent.display()))?;
        }
        // File::create truncates, so redeploying after a partial failure
        // overwrites rather than errors.
        let mut challenge_file = File::create(&challenge_path).await.context(format!(
            "Failed to create challenge file {}",
            challenge_path.display()
        ))?;
        challenge_file
            .write_all(http_challenge.key_authorization.as_bytes())
            .await
            .context(format!(
                "Writing to challenge file {} failed",
                challenge_path.display()
            ))?;
        self.challenge_file = Some(challenge_path);
        if self.write_web_config {
            let web_config_path = self.challenge_directory().join("web.config");
            tokio::fs::write(&web_config_path, WEB_CONFIG_CONTENT)
                .await
                .context(format!(
                    "Failed to write config fragment {}",
                    web_config_path.display()
                ))?;
            self.web_config_file = Some(web_config_path);
        }
        Ok(())
    }

    async fn cleanup_challenge(self: Box<Self>) -> Result<(), Error> {
        let Some(path) = self.challenge_file else {
            bail!("No challenge to cleanup");
        };
        tokio::fs::remove_file(&path).await.context(format!(
            "Failed to remove challenge file {}",
            path.display()
        ))?;
        if let Some(web_config) = self.web_config_file {
            if let Err(e) = tokio::fs::remove_file(&web_config).await {
                warn!(
                    "Failed to remove config fragment {}: {e}",
                    web_config.display()
                );
            }
        }
        // Walk upward at most two levels (acme-challenge, .well-known),
        // removing directories we left empty. A directory holding anything
        // else is user content and stays.
        let mut current = path.parent().map(Path::to_path_buf);
        for _ in 0..2 {
            let Some(dir) = current else { break };
            if !is_empty_directory(&dir).await {
                debug!("Directory {} is not empty, keeping it", dir.display());
                break;
            }
            tokio::fs::remove_dir(&dir)
                .await
                .context(format!("Failed to remove directory {}", dir.display()))?;
            current = dir.parent().map(Path::to_path_buf);
        }
        Ok(())
    }
}

async fn is_empty_directory(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

/// Expands `$VAR`, `${VAR}` and `%VAR%` references from the process environment.
/// Unset variables expand to the empty string.
pub(crate) fn expand_env_vars(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' => {
                let braced = chars.peek() == Some(&'{');
                if braced {
                    chars.next();
                }
                let mut name = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_alphanumeric() || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if braced && chars.peek() == Some(&'}') {
                    chars.next();
                }
                if name.is_empty() {
                    output.push('$');
                } else {
                    output.push_str(&std::env::var(&name).unwrap_or_default());
                }
            }
            '%' => {
                let name: String = chars
                    .clone()
                    .take_while(|&next| next != '%')
                    .collect();
                let terminated = chars.clone().nth(name.chars().count()) == Some('%');
                if !name.is_empty() && terminated {
                    for _ in 0..=name.chars().count() {
                        chars.next();
                    }
                    output.push_str(&std::env::var(&name).unwrap_or_default());
                } else {
                    output.push('%');
                }
            }
            other => output.push(other),
        }
    }
    output
}

/// Normalizes foreign path separators to the platform's.
fn normalize_separators(input: &str) -> PathBuf {
    let normalized = if cfg!(windows) {
        input.replace('/', "\\")
    } else {
        input.replace('\\', "/")
    };
    // Collapse redundant components introduced by the replacement
    PathBuf::from(normalized).components().collect()
}
