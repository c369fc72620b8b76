use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use log::debug;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("code: {0}, body: {1}")]
    Deserialize(u16, String),

    #[error("az cli exited with code {0}")]
    AzCli(ExitStatus),

    #[error("az cli returned an empty token")]
    AzCliEmptyToken,

    #[error("run az cli: {0}")]
    IOError(#[from] std::io::Error),
}

/// Where to get tokens from, and for which audience.
#[derive(Debug, Clone)]
pub struct Config {
    /// Microsoft Entra ID authority, e.g. `https://login.microsoftonline.com`
    pub authority_host: String,
    /// Resource manager endpoint the token is for, e.g. `https://management.azure.com`
    pub management_endpoint: String,
}

impl Config {
    fn scope(&self) -> String {
        format!("{}/.default", self.management_endpoint.trim_end_matches('/'))
    }

    fn token_url(&self, tenant_id: &str) -> String {
        format!(
            "{}/{tenant_id}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/')
        )
    }
}

/// Acquire a resource manager access token.
///
/// Tried in order:
/// 1. GitHub Actions OIDC token federated to an app registration
///    (`ACTIONS_ID_TOKEN_REQUEST_URL`, `ACTIONS_ID_TOKEN_REQUEST_TOKEN`, `AZURE_CLIENT_ID`, `AZURE_TENANT_ID`),
/// 2. service principal secret (`AZURE_CLIENT_ID`, `AZURE_CLIENT_SECRET`, `AZURE_TENANT_ID`),
/// 3. the signed-in `az` CLI user.
pub async fn token(cfg: &Config) -> Result<String, Error> {
    let client_id = std::env::var("AZURE_CLIENT_ID").ok();
    let tenant_id = std::env::var("AZURE_TENANT_ID").ok();
    let client_secret = std::env::var("AZURE_CLIENT_SECRET").ok();
    let github_id_token_url = std::env::var("ACTIONS_ID_TOKEN_REQUEST_URL").ok();
    let github_token = std::env::var("ACTIONS_ID_TOKEN_REQUEST_TOKEN").ok();

    match (client_id, tenant_id, client_secret, github_id_token_url, github_token) {
        (Some(client_id), Some(tenant_id), _, Some(github_id_token_url), Some(github_token)) => {
            let id_token = github_id_token(&github_id_token_url, &github_token).await?;
            client_credentials(cfg, &tenant_id, &client_id, Credential::Assertion(&id_token.value))
                .await
                .map(|token| token.access_token)
        }
        (Some(client_id), Some(tenant_id), Some(client_secret), _, _) => {
            client_credentials(cfg, &tenant_id, &client_id, Credential::Secret(&client_secret))
                .await
                .map(|token| token.access_token)
        }
        (_, _, _, _, _) => az_cli_token(cfg),
    }
}

enum Credential<'a> {
    Secret(&'a str),
    Assertion(&'a str),
}

#[derive(Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
}

#[derive(Deserialize)]
pub struct GitHubTokenResponse {
    pub value: String,
}

async fn client_credentials(
    cfg: &Config,
    tenant_id: &str,
    client_id: &str,
    credential: Credential<'_>,
) -> Result<TokenResponse, Error> {
    let scope = cfg.scope();
    let mut form = vec![
        ("grant_type", "client_credentials"),
        ("client_id", client_id),
        ("scope", scope.as_str()),
    ];
    match credential {
        Credential::Secret(secret) => {
            debug!("Exchanging client secret for an access token");
            form.push(("client_secret", secret));
        }
        Credential::Assertion(assertion) => {
            debug!("Exchanging federated GitHub token for an access token");
            form.push(("client_assertion_type", "urn:ietf:params:oauth:client-assertion-type:jwt-bearer"));
            form.push(("client_assertion", assertion));
        }
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let resp = client.post(cfg.token_url(tenant_id))
        .form(&form)
        .send()
        .await?;

    let status = resp.status().as_u16();
    let bytes = resp.bytes().await?;

    match serde_json::from_slice(&bytes) {
        Ok(token) => Ok(token),
        Err(_) => {
            let body = String::from_utf8_lossy(&bytes);
            Err(Error::Deserialize(status, body.to_string()))
        }
    }
}

pub async fn github_id_token(url: &str, bearer_token: &str) -> Result<GitHubTokenResponse, Error> {
    debug!("Getting GitHub actions id_token");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?;

    let resp = client.get(url)
        .bearer_auth(bearer_token)
        .query(&[("audience", "api://AzureADTokenExchange")])
        .send()
        .await?;

    let status = resp.status().as_u16();
    let bytes = resp.bytes().await?;

    match serde_json::from_slice(&bytes) {
        Ok(token) => Ok(token),
        Err(_) => {
            let body = String::from_utf8_lossy(&bytes);
            Err(Error::Deserialize(status, body.to_string()))
        }
    }
}

fn az_cli_token(cfg: &Config) -> Result<String, Error> {
    debug!("Asking az cli for an access token");
    let output = std::process::Command::new("az")
        .arg("account")
        .arg("get-access-token")
        .arg("--resource")
        .arg(&cfg.management_endpoint)
        .arg("--query")
        .arg("accessToken")
        .arg("--output")
        .arg("tsv")
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .output()?;

    if !output.status.success() {
        return Err(Error::AzCli(output.status));
    }
    parse_cli_token(&output.stdout)
}

fn parse_cli_token(stdout: &[u8]) -> Result<String, Error> {
    let token = String::from_utf8_lossy(stdout).trim().to_string();
    if token.is_empty() {
        return Err(Error::AzCliEmptyToken);
    }
    Ok(token.strip_prefix("Bearer ").unwrap_or(&token).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            authority_host: "https://login.microsoftonline.com/".into(),
            management_endpoint: "https://management.azure.com/".into(),
        }
    }

    #[test]
    fn token_url_and_scope() {
        let cfg = config();
        assert_eq!(
            cfg.token_url("tenant-1"),
            "https://login.microsoftonline.com/tenant-1/oauth2/v2.0/token"
        );
        assert_eq!(cfg.scope(), "https://management.azure.com/.default");
    }

    #[test]
    fn cli_token_is_trimmed() {
        assert_eq!(parse_cli_token(b"eyJ0eXAi.abc\n").unwrap(), "eyJ0eXAi.abc");
        assert!(matches!(parse_cli_token(b" \n"), Err(Error::AzCliEmptyToken)));
    }
}
