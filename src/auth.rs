//! Credentials carried by every Pub/Sub call, and an OAuth 2.0 login to
//! obtain them.

use std::{env::VarError, fmt};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;
use url::Url;

const ACCESS_TOKEN_ENV: &str = "PUBSUB_ACCESS_TOKEN";
const INSTANCE_URL_ENV: &str = "PUBSUB_INSTANCE_URL";
const TENANT_ID_ENV: &str = "PUBSUB_TENANT_ID";
const TOKEN_PATH: &str = "services/oauth2/token";

/// Session credentials for the Pub/Sub API.
#[derive(Clone)]
pub struct Credentials {
    /// Session or OAuth access token.
    pub access_token: SecretString,
    /// URL of the org instance, without a trailing slash.
    pub instance_url: String,
    /// Org id.
    pub tenant_id: String,
}

impl Credentials {
    pub fn new(
        access_token: impl Into<String>,
        instance_url: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            access_token: access_token.into().into(),
            instance_url: instance_url.into().trim_end_matches('/').to_string(),
            tenant_id: tenant_id.into(),
        }
    }

    /// Read credentials from `PUBSUB_ACCESS_TOKEN`, `PUBSUB_INSTANCE_URL` and
    /// `PUBSUB_TENANT_ID`.
    pub fn from_env() -> Result<Self, CredentialsError> {
        fn required(name: &'static str) -> Result<String, CredentialsError> {
            match std::env::var(name) {
                Ok(value) if !value.is_empty() => Ok(value),
                Ok(_) | Err(VarError::NotPresent) => Err(CredentialsError::Missing(name)),
                Err(VarError::NotUnicode(_)) => Err(CredentialsError::NotUnicode(name)),
            }
        }

        let instance_url = required(INSTANCE_URL_ENV)?;
        Url::parse(&instance_url)
            .map_err(|e| CredentialsError::InvalidInstanceUrl(e.to_string()))?;

        Ok(Self::new(
            required(ACCESS_TOKEN_ENV)?,
            instance_url,
            required(TENANT_ID_ENV)?,
        ))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"***")
            .field("instance_url", &self.instance_url)
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialsError {
    #[error("{0} env var not set")]
    Missing(&'static str),
    #[error("{0} is not valid unicode")]
    NotUnicode(&'static str),
    #[error("invalid instance url: {0}")]
    InvalidInstanceUrl(String),
}

/// OAuth 2.0 grant used to obtain an access token.
#[derive(Debug, Clone)]
pub enum LoginGrant {
    /// Username-password flow. The password must have the security token
    /// appended when the caller's IP is not trusted by the org.
    Password {
        username: String,
        password: SecretString,
    },
    /// Client credentials flow for a connected app with a run-as user.
    ClientCredentials,
}

#[derive(Debug, Clone)]
pub struct LoginConfig {
    /// Login host, e.g. `https://login.salesforce.com` or a My Domain URL.
    pub login_url: Url,
    pub client_id: String,
    pub client_secret: SecretString,
    pub grant: LoginGrant,
}

impl LoginConfig {
    pub fn new(
        login_url: Url,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        grant: LoginGrant,
    ) -> Self {
        Self {
            login_url,
            client_id: client_id.into(),
            client_secret: client_secret.into().into(),
            grant,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("login rejected: {error}: {description}")]
    Rejected { error: String, description: String },
    #[error("unexpected login response status {0}")]
    Status(http::StatusCode),
    #[error("invalid login response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    instance_url: String,
    /// Identity URL, `https://<host>/id/<org id>/<user id>`.
    id: String,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Exchange OAuth credentials for Pub/Sub credentials.
pub async fn login(config: &LoginConfig) -> Result<Credentials, LoginError> {
    login_with(&reqwest::Client::new(), config).await
}

pub async fn login_with(
    http: &reqwest::Client,
    config: &LoginConfig,
) -> Result<Credentials, LoginError> {
    let url = config.login_url.join(TOKEN_PATH)?;

    let mut form = vec![
        ("client_id", config.client_id.as_str()),
        ("client_secret", config.client_secret.expose_secret()),
    ];
    match &config.grant {
        LoginGrant::Password { username, password } => {
            form.push(("grant_type", "password"));
            form.push(("username", username.as_str()));
            form.push(("password", password.expose_secret()));
        }
        LoginGrant::ClientCredentials => form.push(("grant_type", "client_credentials")),
    }

    debug!(%url, "requesting access token");
    let response = http.post(url).form(&form).send().await?;
    let status = response.status();
    let body = response.bytes().await?;

    if !status.is_success() {
        return Err(match serde_json::from_slice::<TokenErrorResponse>(&body) {
            Ok(err) => LoginError::Rejected {
                error: err.error,
                description: err.error_description,
            },
            Err(_) => LoginError::Status(status),
        });
    }

    let token: TokenResponse = serde_json::from_slice(&body)
        .map_err(|e| LoginError::InvalidResponse(e.to_string()))?;
    let tenant_id = tenant_id_from_identity_url(&token.id)?;
    debug!(instance_url = %token.instance_url, %tenant_id, "logged in");

    Ok(Credentials::new(
        token.access_token,
        token.instance_url,
        tenant_id,
    ))
}

fn tenant_id_from_identity_url(id: &str) -> Result<String, LoginError> {
    let url = Url::parse(id)?;
    let mut segments = url
        .path_segments()
        .ok_or_else(|| LoginError::InvalidResponse(format!("identity url has no path: {id}")))?;
    match (segments.next(), segments.next(), segments.next()) {
        (Some("id"), Some(org_id), Some(_user_id)) if !org_id.is_empty() => Ok(org_id.to_string()),
        _ => Err(LoginError::InvalidResponse(format!(
            "unexpected identity url: {id}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        task::JoinHandle,
    };

    use super::*;

    /// Answers a single HTTP request with `status` and `body`, returning the
    /// raw request it received.
    async fn serve_once(status: &'static str, body: &'static str) -> (Url, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            request
        });
        (Url::parse(&format!("http://{addr}/")).unwrap(), handle)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut request = Vec::new();
        let mut chunk = [0; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&request);
            if let Some(end) = text.find("\r\n\r\n") {
                let content_length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8(request).unwrap()
    }

    fn password_login(login_url: Url) -> LoginConfig {
        LoginConfig::new(
            login_url,
            "client-id",
            "client-secret",
            LoginGrant::Password {
                username: "integration@acme.com".into(),
                password: "hunter2".to_string().into(),
            },
        )
    }

    #[tokio::test]
    async fn login_returns_credentials() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{
                "access_token": "00D!AQ",
                "instance_url": "https://acme.my.salesforce.com/",
                "id": "https://login.salesforce.com/id/00D000000000001/005000000000001"
            }"#,
        )
        .await;

        let credentials = login(&password_login(url)).await.unwrap();
        assert_eq!(credentials.access_token.expose_secret(), "00D!AQ");
        assert_eq!(credentials.instance_url, "https://acme.my.salesforce.com");
        assert_eq!(credentials.tenant_id, "00D000000000001");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /services/oauth2/token "));
        assert!(request.contains("grant_type=password"));
        assert!(request.contains("client_id=client-id"));
        assert!(request.contains("username=integration%40acme.com"));
    }

    #[tokio::test]
    async fn rejected_logins_carry_the_server_error() {
        let (url, _server) = serve_once(
            "400 Bad Request",
            r#"{"error": "invalid_grant", "error_description": "authentication failure"}"#,
        )
        .await;

        let err = login(&password_login(url)).await.unwrap_err();
        assert!(matches!(
            err,
            LoginError::Rejected { error, description }
                if error == "invalid_grant" && description == "authentication failure"
        ));
    }

    #[tokio::test]
    async fn unexpected_responses_report_the_status() {
        let (url, _server) = serve_once("500 Internal Server Error", "oops").await;

        let err = login(&password_login(url)).await.unwrap_err();
        assert!(matches!(
            err,
            LoginError::Status(status) if status == http::StatusCode::INTERNAL_SERVER_ERROR
        ));
    }

    #[test]
    fn tenant_id_is_read_from_identity_url() {
        let tenant_id = tenant_id_from_identity_url(
            "https://login.salesforce.com/id/00D5e000000XXXXEAA/0055e000001YYYYAAA",
        )
        .unwrap();
        assert_eq!(tenant_id, "00D5e000000XXXXEAA");

        assert!(tenant_id_from_identity_url("https://login.salesforce.com/id/").is_err());
        assert!(tenant_id_from_identity_url("https://login.salesforce.com/other/a/b").is_err());
        assert!(tenant_id_from_identity_url("not a url").is_err());
    }

    #[test]
    fn instance_url_trailing_slash_is_trimmed() {
        let credentials = Credentials::new("t", "https://acme.my.salesforce.com/", "00D");
        assert_eq!(credentials.instance_url, "https://acme.my.salesforce.com");
    }

    #[test]
    fn debug_hides_access_token() {
        let credentials = Credentials::new("very-secret", "https://acme.my.salesforce.com", "00D");
        let debug = format!("{credentials:?}");
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("00D"));
    }

    #[test]
    fn token_responses_deserialize() {
        let token: TokenResponse = serde_json::from_str(
            r#"{
                "access_token": "00D!AQ",
                "instance_url": "https://acme.my.salesforce.com",
                "id": "https://login.salesforce.com/id/00D000000000001/005000000000001",
                "token_type": "Bearer",
                "issued_at": "1700000000000"
            }"#,
        )
        .unwrap();
        assert_eq!(token.access_token, "00D!AQ");

        let err: TokenErrorResponse =
            serde_json::from_str(r#"{"error": "invalid_grant"}"#).unwrap();
        assert_eq!(err.error, "invalid_grant");
        assert!(err.error_description.is_empty());
    }
}
