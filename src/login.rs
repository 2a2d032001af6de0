//! Registry credentials from the Docker client configuration.
//!
//! Lookup order matches the docker CLI: a per-registry credential helper,
//! then the global credential store, then plain `auths` entries.

use base64::Engine;
use bollard::auth::DockerCredentials;
use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Key docker uses for Docker Hub in `config.json`.
const DOCKER_HUB: &str = "https://index.docker.io/v1/";

#[derive(serde::Deserialize, Debug)]
struct AuthEntry {
    auth: Option<String>,
}

#[derive(serde::Deserialize, Debug)]
struct DockerConfig {
    auths: Option<HashMap<String, AuthEntry>>,
    #[serde(rename = "credHelpers", alias = "credsHelpers")]
    creds_helpers: Option<HashMap<String, String>>,
    #[serde(rename = "credsStore")]
    creds_store: Option<String>,
}

fn get_docker_config_path() -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
    if let Ok(dir) = env::var("DOCKER_CONFIG") {
        return Ok(PathBuf::from(dir).join("config.json"));
    }
    let home_dir = env::var("HOME")?;
    Ok(PathBuf::from(home_dir).join(".docker").join("config.json"))
}

fn read_docker_config() -> Result<DockerConfig, Box<dyn Error + Send + Sync>> {
    let docker_config_path = get_docker_config_path()?;
    let file = BufReader::new(File::open(docker_config_path)?);
    let config: DockerConfig = serde_json::from_reader(file)?;
    Ok(config)
}

#[derive(serde::Deserialize)]
struct CredStoreOutput {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

/// Run `docker-credential-<helper> get`. The child is killed when the
/// deadline passes.
async fn call_credential_helper(
    program: &str,
    registry: &str,
    limit: Duration,
) -> Result<(String, String), Box<dyn Error + Send + Sync>> {
    let mut process = Command::new(program)
        .arg("get")
        .stderr(Stdio::piped())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdin = process.stdin.take().ok_or("credential helper has no stdin")?;
    let exchange = async move {
        stdin.write_all(registry.as_bytes()).await?;
        drop(stdin);
        process.wait_with_output().await
    };
    let output = match tokio::time::timeout(limit, exchange).await {
        Ok(output) => output?,
        Err(_) => return Err(format!("{program} timed out after {limit:?}").into()),
    };

    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string().into());
    }
    let creds: CredStoreOutput = serde_json::from_slice(&output.stdout)?;
    Ok((creds.username, creds.secret))
}

fn helper_program(helper: &str) -> String {
    format!("docker-credential-{helper}")
}

fn decode_auth(auth: &str) -> Result<(String, String), Box<dyn Error + Send + Sync>> {
    let decoded = base64::prelude::BASE64_STANDARD.decode(auth)?;
    let decoded_str = String::from_utf8(decoded)?;
    let (username, password) = decoded_str
        .split_once(':')
        .ok_or("Invalid auth format")?;
    Ok((username.to_string(), password.to_string()))
}

async fn lookup(
    config: DockerConfig,
    registry: &str,
    helper_timeout: Duration,
) -> Result<(String, String), Box<dyn Error + Send + Sync>> {
    if let Some(helper) = config.creds_helpers.as_ref().and_then(|h| h.get(registry)) {
        return call_credential_helper(&helper_program(helper), registry, helper_timeout).await;
    }

    if let Some(helper) = config.creds_store.as_deref() {
        match call_credential_helper(&helper_program(helper), registry, helper_timeout).await {
            Ok(creds) => return Ok(creds),
            Err(e) => log::debug!("Credential store {helper} has nothing for {registry}: {e}"),
        }
    }

    // Fallback to plain text credentials from "auths"
    if let Some(auth) = config
        .auths
        .as_ref()
        .and_then(|auths| auths.get(registry))
        .and_then(|entry| entry.auth.as_deref())
    {
        return decode_auth(auth);
    }

    Err("No credentials found".into())
}

/// Credentials for pulling from `registry` (Docker Hub when `None`).
/// Anonymous pulls are attempted when nothing is configured or a
/// credential helper does not answer within `helper_timeout`.
pub async fn registry_credentials(
    registry: Option<&str>,
    helper_timeout: Duration,
) -> Option<DockerCredentials> {
    let registry = registry.unwrap_or(DOCKER_HUB);
    let result = match read_docker_config() {
        Ok(config) => lookup(config, registry, helper_timeout).await,
        Err(e) => Err(e),
    };
    match result {
        Ok((username, password)) => Some(DockerCredentials {
            username: Some(username),
            password: Some(password),
            serveraddress: Some(registry.to_string()),
            ..Default::default()
        }),
        Err(e) => {
            log::debug!("No credentials for {registry}, pulling anonymously: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_auth() {
        let encoded = base64::prelude::BASE64_STANDARD.encode("ci-bot:p4ss:word");
        let (user, pass) = decode_auth(&encoded).unwrap();
        assert_eq!(user, "ci-bot");
        assert_eq!(pass, "p4ss:word");
        assert!(decode_auth(&base64::prelude::BASE64_STANDARD.encode("nocolon")).is_err());
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_auths() {
        let config: DockerConfig = serde_json::from_str(&format!(
            r#"{{"auths": {{"ghcr.io": {{"auth": "{}"}}}}}}"#,
            base64::prelude::BASE64_STANDARD.encode("user:token")
        ))
        .unwrap();
        let (user, pass) = lookup(config, "ghcr.io", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!((user.as_str(), pass.as_str()), ("user", "token"));
    }

    #[tokio::test]
    async fn test_lookup_without_entry_fails() {
        let config: DockerConfig = serde_json::from_str(r#"{"auths": {}}"#).unwrap();
        assert!(
            lookup(config, "registry.example.com", Duration::from_secs(1))
                .await
                .is_err()
        );
    }

    fn helper_script(dir: &tempfile::TempDir, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("docker-credential-test");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_credential_helper_output() {
        let dir = tempfile::tempdir().unwrap();
        let program = helper_script(
            &dir,
            r#"read registry; printf '{"Username":"ci","Secret":"%s-token"}' "$registry""#,
        );
        let (user, secret) = call_credential_helper(&program, "ghcr.io", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(user, "ci");
        assert_eq!(secret, "ghcr.io-token");
    }

    #[tokio::test]
    async fn test_hung_credential_helper_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let program = helper_script(&dir, "sleep 30");

        let started = std::time::Instant::now();
        let result = call_credential_helper(&program, "ghcr.io", Duration::from_millis(200)).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
