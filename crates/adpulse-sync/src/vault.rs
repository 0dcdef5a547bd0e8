use adpulse_core::Integration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("integration {0} has no stored credentials")]
    Missing(Uuid),
}

/// Reveals the access token stored for an integration.
pub trait CredentialVault: Send + Sync {
    fn reveal(&self, integration: &Integration) -> Result<String, CredentialError>;
}

/// Stored value is the token itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextVault;

impl CredentialVault for PlaintextVault {
    fn reveal(&self, integration: &Integration) -> Result<String, CredentialError> {
        integration
            .credentials
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .ok_or(CredentialError::Missing(integration.id))
    }
}
