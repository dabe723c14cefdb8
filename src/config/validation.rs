use std::collections::HashSet;

use crate::config::models::{ConfigSnapshot, ProviderConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Duplicate provider name '{name}'")]
    DuplicateProvider { name: String },

    #[error("Port conflict: API and status listeners both use port {port}")]
    PortConflict { port: u16 },
}

/// Snapshot validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate a whole snapshot, collecting every violation.
    pub fn validate(snapshot: &ConfigSnapshot) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if snapshot.api_port == snapshot.status_port && snapshot.api_port != 0 {
            errors.push(ValidationError::PortConflict {
                port: snapshot.api_port,
            });
        }

        let mut seen = HashSet::new();
        for (index, provider) in snapshot.providers.iter().enumerate() {
            if provider.name.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("providers[{index}].name"),
                });
            } else if !seen.insert(provider.name.as_str()) {
                errors.push(ValidationError::DuplicateProvider {
                    name: provider.name.clone(),
                });
            }

            if provider.enabled {
                if let Err(e) = Self::validate_provider_url(index, provider) {
                    errors.push(e);
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_provider_url(index: usize, provider: &ProviderConfig) -> ValidationResult<()> {
        let context = format!("providers[{index}].env.ANTHROPIC_BASE_URL");
        let Some(base_url) = provider.base_url.as_deref() else {
            return Err(ValidationError::MissingField { field: context });
        };
        Self::validate_url(base_url, &context)
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }
}
