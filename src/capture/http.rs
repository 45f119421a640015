//! Authenticated streaming HTTP GET against the camera
//!
//! The first request is always sent without credentials. Only when the camera
//! answers `401` do we look at its challenge and retry once, preferring Digest
//! over Basic when both are offered.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use tracing::{debug, info, instrument};

use crate::error::{CameraError, ConnectionError};
use crate::utils::redact_url;

/// Raw body bytes of an open upstream connection
pub type ByteStream = BoxStream<'static, Result<Bytes, ConnectionError>>;

/// Live upstream connection. Dropping it aborts the transfer.
pub struct Connection {
    pub content_type: Option<String>,
    pub body: ByteStream,
}

impl Connection {
    pub fn new(content_type: Option<String>, body: ByteStream) -> Self {
        Self { content_type, body }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Opens upstream byte streams
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, ConnectionError>;
}

#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

enum Challenge {
    Digest(String),
    Basic,
}

/// reqwest-backed connector for MJPEG-over-HTTP cameras
pub struct HttpConnector {
    client: Client,
    url: Url,
    credentials: Option<Credentials>,
}

impl HttpConnector {
    pub fn new(
        url: &str,
        credentials: Option<Credentials>,
        connect_timeout: Duration,
    ) -> Result<Self, CameraError> {
        let mut url = Url::parse(url).map_err(|e| CameraError::InvalidUrl {
            url: redact_url(url),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CameraError::InvalidUrl {
                url: redact_url(url.as_str()),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        // reqwest would turn userinfo into a preemptive Basic header
        let embedded = take_userinfo(&mut url)?;
        let credentials = credentials.or(embedded);

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(ConnectionError::from)?;

        Ok(Self {
            client,
            url,
            credentials,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn request(&self) -> RequestBuilder {
        self.client.get(self.url.clone())
    }

    /// Request-URI used in the digest response
    fn digest_uri(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_owned(),
        }
    }

    async fn answer_challenge(
        &self,
        credentials: &Credentials,
        challenge: Challenge,
    ) -> Result<Response, ConnectionError> {
        let request = match challenge {
            Challenge::Digest(header) => {
                let mut prompt = digest_auth::parse(&header)
                    .map_err(|e| ConnectionError::Digest(e.to_string()))?;
                let uri = self.digest_uri();
                let context = digest_auth::AuthContext::new(
                    credentials.user.as_str(),
                    credentials.password.as_str(),
                    uri.as_str(),
                );
                let answer = prompt
                    .respond(&context)
                    .map_err(|e| ConnectionError::Digest(e.to_string()))?;
                debug!("Answering digest challenge");
                self.request()
                    .header(AUTHORIZATION, answer.to_header_string())
            }
            Challenge::Basic => {
                debug!("Answering basic challenge");
                self.request()
                    .basic_auth(&credentials.user, Some(&credentials.password))
            }
        };

        Ok(request.send().await?)
    }
}

#[async_trait]
impl Connector for HttpConnector {
    #[instrument(skip(self), fields(url = %redact_url(self.url.as_str())))]
    async fn connect(&self) -> Result<Connection, ConnectionError> {
        let mut response = self.request().send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let credentials = self
                .credentials
                .as_ref()
                .ok_or(ConnectionError::Unauthorized)?;
            let challenge = pick_challenge(response.headers())?;
            response = self.answer_challenge(credentials, challenge).await?;
        }

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ConnectionError::Unauthorized);
        }
        if !status.is_success() {
            return Err(ConnectionError::Status(status));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        info!(content_type = ?content_type, "Camera stream opened");

        let body = response
            .bytes_stream()
            .map_err(ConnectionError::from)
            .boxed();
        Ok(Connection::new(content_type, body))
    }
}

/// Strip `user:password@` from the URL, returning it as credentials
fn take_userinfo(url: &mut Url) -> Result<Option<Credentials>, CameraError> {
    if url.username().is_empty() && url.password().is_none() {
        return Ok(None);
    }

    let redacted = redact_url(url.as_str());
    let invalid = |reason: &str| CameraError::InvalidUrl {
        url: redacted.clone(),
        reason: reason.to_owned(),
    };
    let user = urlencoding::decode(url.username())
        .map_err(|_| invalid("userinfo is not valid utf-8"))?
        .into_owned();
    let password = match url.password() {
        Some(password) => urlencoding::decode(password)
            .map_err(|_| invalid("userinfo is not valid utf-8"))?
            .into_owned(),
        None => String::new(),
    };

    url.set_username("")
        .map_err(|()| invalid("url cannot carry userinfo"))?;
    url.set_password(None)
        .map_err(|()| invalid("url cannot carry userinfo"))?;
    Ok(Some(Credentials::new(user, password)))
}

/// Choose which `WWW-Authenticate` challenge to answer
fn pick_challenge(headers: &HeaderMap) -> Result<Challenge, ConnectionError> {
    let offered: Vec<&str> = headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();

    if let Some(digest) = offered.iter().find(|c| has_scheme(c, "digest")) {
        return Ok(Challenge::Digest((*digest).to_owned()));
    }
    if offered.iter().any(|c| has_scheme(c, "basic")) {
        return Ok(Challenge::Basic);
    }
    match offered.first() {
        Some(other) => Err(ConnectionError::UnsupportedChallenge((*other).to_owned())),
        // Some cameras omit the header entirely; basic is the only thing we can try
        None => Ok(Challenge::Basic),
    }
}

fn has_scheme(challenge: &str, scheme: &str) -> bool {
    challenge
        .trim_start()
        .get(..scheme.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
}
