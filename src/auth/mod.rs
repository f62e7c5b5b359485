use crate::config::AuthenticationConfig;
use crate::error::GatewayError;
use async_trait::async_trait;
use http::HeaderMap;

/// Claims produced by a successful authentication, as (type, value) pairs.
/// A type may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Claims(Vec<(String, String)>);

impl Claims {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, claim_type: impl Into<String>, value: impl Into<String>) {
        self.0.push((claim_type.into(), value.into()));
    }

    /// First value of `claim_type`.
    pub fn get(&self, claim_type: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(t, _)| t == claim_type)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, claim_type: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(t, _)| t == claim_type)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Claims {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationPolicy {
    pub provider_key: String,
    pub allowed_scopes: Vec<String>,
}

impl From<&AuthenticationConfig> for AuthenticationPolicy {
    fn from(cfg: &AuthenticationConfig) -> Self {
        Self {
            provider_key: cfg.authentication_provider_key.clone(),
            allowed_scopes: cfg.allowed_scopes.clone(),
        }
    }
}

/// Validates a request's credentials and returns its claims. Token formats
/// and identity providers live behind this trait.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        policy: &AuthenticationPolicy,
        headers: &HeaderMap,
    ) -> Result<Claims, GatewayError>;
}

/// Installed when no provider is wired in. Every route that asks for
/// authentication is refused.
#[derive(Debug, Default)]
pub struct NoAuthenticationProvider;

#[async_trait]
impl Authenticator for NoAuthenticationProvider {
    async fn authenticate(
        &self,
        policy: &AuthenticationPolicy,
        _headers: &HeaderMap,
    ) -> Result<Claims, GatewayError> {
        Err(GatewayError::AuthenticationFailed(format!(
            "no authentication provider registered for '{}'",
            policy.provider_key
        )))
    }
}

/// Check `claims` against a route's claim requirements and allowed scopes.
pub fn authorise(
    claims: &Claims,
    requirement: &[(String, String)],
    allowed_scopes: &[String],
) -> Result<(), GatewayError> {
    for (claim_type, required) in requirement {
        if !claims.get_all(claim_type).any(|v| v == required) {
            return Err(GatewayError::Unauthorised(format!(
                "claim '{}' does not have the required value",
                claim_type
            )));
        }
    }

    if allowed_scopes.is_empty() {
        return Ok(());
    }
    // A scope claim may carry several space-separated scopes.
    let granted = claims
        .get_all("scope")
        .flat_map(str::split_whitespace)
        .any(|s| allowed_scopes.iter().any(|a| a == s));
    if granted {
        Ok(())
    } else {
        Err(GatewayError::Unauthorised(
            "no allowed scope in claims".to_string(),
        ))
    }
}

/// A claim lookup of the form `Claims[<type>] > value[<index>] > <delimiter>`.
///
/// `Claims[sub] > value` copies the whole claim; `Claims[loc] > value[1] > |`
/// copies the second `|`-separated piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimsToThing {
    /// Header or query parameter the value is written to.
    pub key: String,
    pub claim: String,
    pub index: Option<usize>,
    pub delimiter: Option<String>,
}

impl ClaimsToThing {
    pub fn parse(key: &str, expr: &str) -> Result<Self, GatewayError> {
        let invalid = || {
            GatewayError::Config(format!(
                "invalid claims expression for '{}': '{}'",
                key, expr
            ))
        };

        let mut parts = expr.splitn(3, '>').map(str::trim);
        let claim = parts
            .next()
            .and_then(|p| p.strip_prefix("Claims["))
            .and_then(|p| p.strip_suffix(']'))
            .filter(|c| !c.is_empty() && !c.contains(['[', ']']))
            .ok_or_else(invalid)?;

        let value = parts.next().ok_or_else(invalid)?;
        let index = if value == "value" {
            None
        } else {
            let i = value
                .strip_prefix("value[")
                .and_then(|p| p.strip_suffix(']'))
                .and_then(|p| p.trim().parse::<usize>().ok())
                .ok_or_else(invalid)?;
            Some(i)
        };

        let delimiter = parts.next().filter(|d| !d.is_empty()).map(str::to_string);
        // An index only makes sense against a delimiter.
        if index.is_some() != delimiter.is_some() {
            return Err(invalid());
        }

        Ok(Self {
            key: key.to_string(),
            claim: claim.to_string(),
            index,
            delimiter,
        })
    }

    pub fn extract(&self, claims: &Claims) -> Result<String, GatewayError> {
        let value = claims.get(&self.claim).ok_or_else(|| {
            GatewayError::Internal(format!("claim '{}' not found for '{}'", self.claim, self.key))
        })?;
        match (self.index, self.delimiter.as_deref()) {
            (Some(i), Some(delim)) => value
                .split(delim)
                .nth(i)
                .map(|s| s.trim().to_string())
                .ok_or_else(|| {
                    GatewayError::Internal(format!(
                        "claim '{}' has no piece {} split by '{}'",
                        self.claim, i, delim
                    ))
                }),
            _ => Ok(value.to_string()),
        }
    }
}
