use crate::acme::object::{ACME_CHALLENGE_PATH, ChallengeKind, Identifier, InnerChallenge};
use crate::solver::ChallengeSolver;
use anyhow::{Context, Error, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteWebrootSolverConfiguration {
    /// Where the webroot lives: `ftp://`, `sftp://`, or a WebDAV URL
    /// (`dav://`, `davs://`, `http://`, `https://`). The URL path is the
    /// document root of the server answering validation requests.
    pub url: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// File transfer operations the remote solver needs. Directory creation is a
/// single level at a time; an already existing directory is not an error.
#[async_trait]
trait RemoteHost: Send + Sync {
    async fn ensure_dir(&self, path: &str) -> anyhow::Result<()>;
    async fn upload(&self, path: &str, content: Vec<u8>) -> anyhow::Result<()>;
    async fn delete(&self, path: &str) -> anyhow::Result<()>;
    async fn remove_dir(&self, path: &str) -> anyhow::Result<()>;
}

/// Serves the HTTP proof through a webserver whose document root is only
/// reachable via FTP, SFTP or WebDAV.
pub struct RemoteWebrootSolver {
    host: Box<dyn RemoteHost>,
    deployed: Option<DeployedPaths>,
}

#[derive(Debug, Clone)]
struct DeployedPaths {
    file: String,
    directories: Vec<String>,
}

impl RemoteWebrootSolver {
    pub fn from_config(config: RemoteWebrootSolverConfiguration) -> anyhow::Result<Box<Self>> {
        let host: Box<dyn RemoteHost> = match config.url.scheme() {
            "ftp" => Box::new(FtpHost::try_new(&config)?),
            "sftp" => Box::new(SftpHost::try_new(&config)?),
            "dav" | "davs" | "http" | "https" => Box::new(WebDavHost::try_new(&config)?),
            other => bail!("Unsupported remote webroot scheme {other}"),
        };
        Ok(Box::new(Self {
            host,
            deployed: None,
        }))
    }

    /// The directory levels between webroot and proof file, shallowest first.
    fn challenge_directories() -> Vec<String> {
        let mut levels = Vec::new();
        let mut current = String::new();
        for part in ACME_CHALLENGE_PATH.split('/') {
            if current.is_empty() {
                current = part.to_string();
            } else {
                current = format!("{current}/{part}");
            }
            levels.push(current.clone());
        }
        levels
    }
}

#[async_trait]
impl ChallengeSolver for RemoteWebrootSolver {
    fn long_name(&self) -> &'static str {
        "remote webroot (FTP/SFTP/WebDAV)"
    }

    fn short_name(&self) -> &'static str {
        "remote-webroot"
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
        // No implicit mkdir -p on remote filesystems: create one level at a
        // time, tolerating levels that already exist.
        let directories = Self::challenge_directories();
        for directory in &directories {
            self.host
                .ensure_dir(directory)
                .await
                .context(format!("Failed to create remote directory {directory}"))?;
        }
        let file = http_challenge.resource_path();
        self.host
            .upload(&file, http_challenge.key_authorization.into_bytes())
            .await
            .context(format!("Failed to upload challenge file {file}"))?;
        self.deployed = Some(DeployedPaths { file, directories });
        Ok(())
    }

    async fn cleanup_challenge(self: Box<Self>) -> Result<(), Error> {
        let Some(deployed) = self.deployed else {
            bail!("No challenge to cleanup");
        };
        self.host
            .delete(&deployed.file)
            .await
            .context(format!("Failed to delete challenge file {}", deployed.file))?;
        // Deepest first; servers refuse to remove non-empty directories, which
        // is exactly the protection we want for user content.
        for directory in deployed.directories.iter().rev() {
            if let Err(e) = self.host.remove_dir(directory).await {
                debug!("Leaving remote directory {directory} in place: {e:#}");
                break;
            }
        }
        Ok(())
    }
}

struct FtpHost {
    host: String,
    port: u16,
    root: String,
    username: String,
    password: String,
}

impl FtpHost {
    fn try_new(config: &RemoteWebrootSolverConfiguration) -> anyhow::Result<Self> {
        let (username, password) = require_credentials(config)?;
        Ok(Self {
            host: config
                .url
                .host_str()
                .ok_or_else(|| anyhow!("FTP URL has no host"))?
                .to_string(),
            port: config.url.port().unwrap_or(21),
            root: config.url.path().trim_end_matches('/').to_string(),
            username,
            password,
        })
    }

    fn absolute(&self, path: &str) -> String {
        format!("{}/{}", self.root, path)
    }

    async fn with_connection<T, F>(&self, operation: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut suppaftp::FtpStream) -> anyhow::Result<T> + Send + 'static,
    {
        let host = self.host.clone();
        let port = self.port;
        let username = self.username.clone();
        let password = self.password.clone();
        tokio::task::spawn_blocking(move || {
            let mut ftp = suppaftp::FtpStream::connect((host.as_str(), port))
                .context(format!("Connecting to FTP server {host}:{port}"))?;
            ftp.login(&username, &password)
                .context("FTP login failed")?;
            ftp.transfer_type(suppaftp::types::FileType::Binary)
                .context("Switching FTP transfer type failed")?;
            let result = operation(&mut ftp);
            if let Err(e) = ftp.quit() {
                debug!("FTP connection teardown failed: {e}");
            }
            result
        })
        .await
        .context("FTP worker task failed")?
    }
}

#[async_trait]
impl RemoteHost for FtpHost {
    async fn ensure_dir(&self, path: &str) -> anyhow::Result<()> {
        let path = self.absolute(path);
        self.with_connection(move |ftp| {
            if let Err(e) = ftp.mkdir(&path) {
                // Tolerate directories that already exist
                if ftp.cwd(&path).is_err() {
                    return Err(e).context(format!("Creating FTP directory {path}"));
                }
            }
            Ok(())
        })
        .await
    }

    async fn upload(&self, path: &str, content: Vec<u8>) -> anyhow::Result<()> {
        let path = self.absolute(path);
        self.with_connection(move |ftp| {
            ftp.put_file(&path, &mut Cursor::new(content))
                .context(format!("Uploading {path} via FTP"))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        let path = self.absolute(path);
        self.with_connection(move |ftp| {
            ftp.rm(&path).context(format!("Deleting {path} via FTP"))?;
            Ok(())
        })
        .await
    }

    async fn remove_dir(&self, path: &str) -> anyhow::Result<()> {
        let path = self.absolute(path);
        self.with_connection(move |ftp| {
            ftp.rmdir(&path)
                .context(format!("Removing FTP directory {path}"))?;
            Ok(())
        })
        .await
    }
}

struct SftpHost {
    host: String,
    port: u16,
    root: String,
    username: String,
    password: String,
}

impl SftpHost {
    fn try_new(config: &RemoteWebrootSolverConfiguration) -> anyhow::Result<Self> {
        let (username, password) = require_credentials(config)?;
        Ok(Self {
            host: config
                .url
                .host_str()
                .ok_or_else(|| anyhow!("SFTP URL has no host"))?
                .to_string(),
            port: config.url.port().unwrap_or(22),
            root: config.url.path().trim_end_matches('/').to_string(),
            username,
            password,
        })
    }

    fn absolute(&self, path: &str) -> String {
        format!("{}/{}", self.root, path)
    }

    async fn with_session<T, F>(&self, operation: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ssh2::Sftp) -> anyhow::Result<T> + Send + 'static,
    {
        let host = self.host.clone();
        let port = self.port;
        let username = self.username.clone();
        let password = self.password.clone();
        tokio::task::spawn_blocking(move || {
            let tcp = std::net::TcpStream::connect((host.as_str(), port))
                .context(format!("Connecting to SFTP server {host}:{port}"))?;
            let mut session = ssh2::Session::new().context("Creating SSH session failed")?;
            session.set_tcp_stream(tcp);
            session.handshake().context("SSH handshake failed")?;
            session
                .userauth_password(&username, &password)
                .context("SSH authentication failed")?;
            let sftp = session.sftp().context("Opening SFTP subsystem failed")?;
            operation(&sftp)
        })
        .await
        .context("SFTP worker task failed")?
    }
}

#[async_trait]
impl RemoteHost for SftpHost {
    async fn ensure_dir(&self, path: &str) -> anyhow::Result<()> {
        let path = self.absolute(path);
        self.with_session(move |sftp| {
            let remote = Path::new(&path);
            if sftp.stat(remote).is_ok() {
                // Tolerate directories that already exist
                return Ok(());
            }
            sftp.mkdir(remote, 0o755)
                .context(format!("Creating SFTP directory {path}"))
        })
        .await
    }

    async fn upload(&self, path: &str, content: Vec<u8>) -> anyhow::Result<()> {
        let path = self.absolute(path);
        self.with_session(move |sftp| {
            let mut file = sftp
                .create(Path::new(&path))
                .context(format!("Creating {path} via SFTP"))?;
            file.write_all(&content)
                .context(format!("Writing {path} via SFTP"))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        let path = self.absolute(path);
        self.with_session(move |sftp| {
            sftp.unlink(Path::new(&path))
                .context(format!("Deleting {path} via SFTP"))
        })
        .await
    }

    async fn remove_dir(&self, path: &str) -> anyhow::Result<()> {
        let path = self.absolute(path);
        self.with_session(move |sftp| {
            sftp.rmdir(Path::new(&path))
                .context(format!("Removing SFTP directory {path}"))
        })
        .await
    }
}

struct WebDavHost {
    base: Url,
    client: reqwest::Client,
    username: Option<String>,
    password: Option<String>,
}

impl WebDavHost {
    fn try_new(config: &RemoteWebrootSolverConfiguration) -> anyhow::Result<Self> {
        let mut base = config.url.clone();
        // dav/davs are aliases some configurations use for WebDAV-over-HTTP(S)
        let scheme = match base.scheme() {
            "dav" => "http",
            "davs" => "https",
            other => other,
        };
        if base.scheme() != scheme {
            let rewritten = config.url.as_str().replacen(base.scheme(), scheme, 1);
            base = Url::parse(&rewritten).context("Rewriting WebDAV URL scheme failed")?;
        }
        let client = reqwest::Client::builder()
            .user_agent(crate::CRATE_NAME)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base,
            client,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn resource_url(&self, path: &str) -> anyhow::Result<Url> {
        let base = self.base.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/{path}")).context("Building WebDAV resource URL failed")
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url);
        match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_deref()),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteHost for WebDavHost {
    async fn ensure_dir(&self, path: &str) -> anyhow::Result<()> {
        let url = self.resource_url(path)?;
        let method = reqwest::Method::from_bytes(b"MKCOL").expect("MKCOL is a valid method");
        let response = self
            .request(method, url.clone())
            .send()
            .await
            .context(format!("MKCOL {url} failed"))?;
        let status = response.status();
        // 405 means the collection already exists, which is fine
        if status.is_success() || status == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            Ok(())
        } else {
            bail!("MKCOL {url} returned {status}");
        }
    }

    async fn upload(&self, path: &str, content: Vec<u8>) -> anyhow::Result<()> {
        let url = self.resource_url(path)?;
        self.request(reqwest::Method::PUT, url.clone())
            .body(content)
            .send()
            .await
            .context(format!("PUT {url} failed"))?
            .error_for_status()
            .context(format!("PUT {url} rejected"))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        let url = self.resource_url(path)?;
        self.request(reqwest::Method::DELETE, url.clone())
            .send()
            .await
            .context(format!("DELETE {url} failed"))?
            .error_for_status()
            .context(format!("DELETE {url} rejected"))?;
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> anyhow::Result<()> {
        self.delete(path).await
    }
}

fn require_credentials(
    config: &RemoteWebrootSolverConfiguration,
) -> anyhow::Result<(String, String)> {
    match (&config.username, &config.password) {
        (Some(username), Some(password)) if !username.is_empty() => {
            Ok((username.clone(), password.clone()))
        }
        _ => {
            let scheme = config.url.scheme();
            warn!("Remote webroot over {scheme} requires credentials");
            bail!("Missing credentials for {scheme} remote webroot")
        }
    }
}
