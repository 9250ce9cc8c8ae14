//! Ambient Azure AD credential resolution
//!
//! Mirrors the default credential chain the storage SDKs use: explicit
//! service principal credentials from the conventional `AZURE_*`
//! environment variables first, then the IMDS managed identity endpoint.

use serde::Deserialize;
use tracing::debug;

use crate::error::SasError;

const AAD_AUTHORITY: &str = "https://login.microsoftonline.com";
const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";
const STORAGE_RESOURCE: &str = "https://storage.azure.com/";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Service principal credentials
///
/// Resolved from `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and
/// `AZURE_CLIENT_SECRET`; all three must be present for the principal to
/// be usable.
#[derive(Debug, Clone)]
pub struct ServicePrincipal {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

impl ServicePrincipal {
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Some(Self {
            tenant_id: lookup("AZURE_TENANT_ID")?,
            client_id: lookup("AZURE_CLIENT_ID")?,
            client_secret: lookup("AZURE_CLIENT_SECRET")?,
        })
    }
}

/// Credential chain producing bearer tokens for the storage resource.
pub struct AzureAdCredential {
    client: reqwest::Client,
    service_principal: Option<ServicePrincipal>,
}

impl AzureAdCredential {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            service_principal: ServicePrincipal::from_env(),
            client,
        }
    }

    /// Acquire a bearer token scoped to the storage service.
    ///
    /// Called once at startup; any failure here is fatal to the process.
    pub async fn bearer_token(&self) -> Result<String, SasError> {
        if let Some(principal) = &self.service_principal {
            debug!(
                "Acquiring storage token via service principal {}",
                principal.client_id
            );
            return self.client_credentials_token(principal).await;
        }

        debug!("No service principal in environment, trying managed identity");
        self.managed_identity_token().await
    }

    async fn client_credentials_token(
        &self,
        principal: &ServicePrincipal,
    ) -> Result<String, SasError> {
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            AAD_AUTHORITY, principal.tenant_id
        );
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", principal.client_id.as_str()),
            ("client_secret", principal.client_secret.as_str()),
            ("scope", STORAGE_SCOPE),
        ];

        let response = self.client.post(&url).form(&params).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SasError::Credential(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    async fn managed_identity_token(&self) -> Result<String, SasError> {
        let response = self
            .client
            .get(IMDS_TOKEN_ENDPOINT)
            .query(&[
                ("api-version", IMDS_API_VERSION),
                ("resource", STORAGE_RESOURCE),
            ])
            .header("Metadata", "true")
            .send()
            .await
            .map_err(|e| {
                SasError::Credential(format!("managed identity endpoint unreachable: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(SasError::Credential(format!(
                "managed identity endpoint returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_service_principal_requires_all_three_variables() {
        let full: HashMap<&str, &str> = [
            ("AZURE_TENANT_ID", "tenant"),
            ("AZURE_CLIENT_ID", "client"),
            ("AZURE_CLIENT_SECRET", "secret"),
        ]
        .into_iter()
        .collect();

        let principal =
            ServicePrincipal::from_lookup(|name| full.get(name).map(|v| v.to_string()))
                .expect("all three variables present");
        assert_eq!(principal.tenant_id, "tenant");
        assert_eq!(principal.client_id, "client");

        for dropped in ["AZURE_TENANT_ID", "AZURE_CLIENT_ID", "AZURE_CLIENT_SECRET"] {
            let mut partial = full.clone();
            partial.remove(dropped);
            assert!(
                ServicePrincipal::from_lookup(|name| partial.get(name).map(|v| v.to_string()))
                    .is_none(),
                "principal must be unusable without {}",
                dropped
            );
        }
    }
}
