use serde_json::Value;

use crate::{
    config::models::{ProxyConfig, StageSpec},
    core::{StageRegistry, StageSlot},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Unknown {slot} kind '{kind}' (available: {available})")]
    UnknownKind {
        slot: StageSlot,
        kind: String,
        available: String,
    },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Proxy configuration validator
pub struct ProxyConfigValidator;

impl ProxyConfigValidator {
    /// Validate the whole proxy configuration, reporting every problem found.
    ///
    /// With a registry, every stage kind must be registered for its slot.
    /// Parameters of the built-in kinds are checked here as well so that a
    /// bad file is rejected before any stage is built.
    pub fn validate(
        config: &ProxyConfig,
        registry: Option<&StageRegistry>,
    ) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if config.server.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "server".to_string(),
            });
        }

        for (slot, spec) in config.stages() {
            if let Err(mut stage_errors) = Self::validate_stage(slot, spec, registry) {
                errors.append(&mut stage_errors);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_stage(
        slot: StageSlot,
        spec: &StageSpec,
        registry: Option<&StageRegistry>,
    ) -> Result<(), Vec<ValidationError>> {
        if spec.kind.trim().is_empty() {
            return Err(vec![ValidationError::MissingField {
                field: format!("{slot}.kind"),
            }]);
        }

        if let Some(registry) = registry {
            if !registry.contains(slot, &spec.kind) {
                let available = registry.kinds(slot);
                return Err(vec![ValidationError::UnknownKind {
                    slot,
                    kind: spec.kind.clone(),
                    available: if available.is_empty() {
                        "none".to_string()
                    } else {
                        available.join(", ")
                    },
                }]);
            }
        }

        let mut errors = Vec::new();
        match (slot, spec.kind.as_str()) {
            (StageSlot::Backend | StageSlot::CandidateBackend | StageSlot::MirrorBackend, "http") => {
                Self::validate_servers(slot, spec, &mut errors);
                Self::validate_duration(slot, spec, "timeout", false, &mut errors);
            }
            (StageSlot::RateLimiter, "governor") => {
                match spec.params.get("requests").and_then(Value::as_u64) {
                    Some(0) | None => errors.push(ValidationError::InvalidField {
                        field: format!("{slot}.requests"),
                        message: "Rate limit requests must be an integer greater than 0"
                            .to_string(),
                    }),
                    Some(_) => {}
                }
                Self::validate_duration(slot, spec, "period", true, &mut errors);
                Self::validate_duration(slot, spec, "timeout", false, &mut errors);
            }
            (StageSlot::Fallback, "mock") => {
                if let Some(code) = spec.params.get("mock_code") {
                    let valid = code
                        .as_u64()
                        .and_then(|code| u16::try_from(code).ok())
                        .is_some_and(|code| http::StatusCode::from_u16(code).is_ok());
                    if !valid {
                        errors.push(ValidationError::InvalidField {
                            field: format!("{slot}.mock_code"),
                            message: format!("'{code}' is not a valid HTTP status code"),
                        });
                    }
                }
            }
            _ => {}
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_servers(slot: StageSlot, spec: &StageSpec, errors: &mut Vec<ValidationError>) {
        let servers = match spec.params.get("servers").and_then(Value::as_array) {
            Some(servers) if !servers.is_empty() => servers,
            _ => {
                errors.push(ValidationError::InvalidField {
                    field: format!("{slot}.servers"),
                    message: "At least one server must be configured".to_string(),
                });
                return;
            }
        };

        for (i, server) in servers.iter().enumerate() {
            let context = format!("{slot}.servers[{i}]");
            match server.as_str() {
                Some(url) => {
                    if let Err(e) = Self::validate_url(url, &context) {
                        errors.push(e);
                    }
                }
                None => errors.push(ValidationError::InvalidField {
                    field: context,
                    message: "Server must be a string URL".to_string(),
                }),
            }
        }
    }

    fn validate_duration(
        slot: StageSlot,
        spec: &StageSpec,
        key: &str,
        required: bool,
        errors: &mut Vec<ValidationError>,
    ) {
        let field = format!("{slot}.{key}");
        match spec.params.get(key) {
            None if required => errors.push(ValidationError::MissingField { field }),
            None => {}
            Some(Value::String(value)) => {
                if let Err(e) = humantime::parse_duration(value) {
                    errors.push(ValidationError::InvalidField {
                        field,
                        message: format!("Invalid duration '{value}': {e}"),
                    });
                }
            }
            Some(other) => errors.push(ValidationError::InvalidField {
                field,
                message: format!("Duration must be a string like '1s' or '500ms', got {other}"),
            }),
        }
    }

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

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
