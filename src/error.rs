use crate::models::Provider;
use thiserror::Error;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0} is not configured")]
    ConfigMissing(&'static str),

    #[error("{provider} provider requires {setting}")]
    ProviderConfigMissing {
        provider: Provider,
        setting: &'static str,
    },

    #[error("invalid vault key: {0}")]
    InvalidVaultKey(String),

    #[error("credential rejected by provider: {0}")]
    CredentialInvalid(String),

    #[error("provider request failed: {0}")]
    ProviderTransient(String),

    #[error("sealed secret is tampered or corrupt")]
    TamperedOrCorrupt,

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("no recipient available for reply")]
    ReplyTargetMissing,

    #[error("account not found")]
    AccountNotFound,

    #[error("thread not found")]
    ThreadNotFound,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid job payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

impl SyncError {
    /// Systemic errors abort the whole job and go back to the queue for
    /// redelivery. Everything else stays inside the per-account boundary.
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::InvalidPayload(_))
    }

    /// Short, stable label used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigMissing(_) => "config_missing",
            Self::ProviderConfigMissing { .. } => "provider_config_missing",
            Self::InvalidVaultKey(_) => "invalid_vault_key",
            Self::CredentialInvalid(_) => "credential_invalid",
            Self::ProviderTransient(_) => "provider_transient",
            Self::TamperedOrCorrupt => "tampered_or_corrupt",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::ReplyTargetMissing => "reply_target_missing",
            Self::AccountNotFound => "account_not_found",
            Self::ThreadNotFound => "thread_not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::InvalidPayload(_) => "invalid_payload",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_and_payload_errors_are_systemic() {
        assert!(SyncError::StoreUnavailable(sqlx::Error::PoolClosed).is_systemic());
        assert!(!SyncError::ProviderTransient("rate limited".into()).is_systemic());
        assert!(!SyncError::CredentialInvalid("expired".into()).is_systemic());
        assert!(!SyncError::TamperedOrCorrupt.is_systemic());
        assert!(
            !SyncError::ProviderConfigMissing {
                provider: Provider::Gmail,
                setting: "GMAIL_CLIENT_ID",
            }
            .is_systemic()
        );
    }

    #[test]
    fn provider_config_message_names_the_setting() {
        let err = SyncError::ProviderConfigMissing {
            provider: Provider::Gmail,
            setting: "GMAIL_CLIENT_SECRET",
        };
        assert_eq!(err.to_string(), "gmail provider requires GMAIL_CLIENT_SECRET");
    }
}
