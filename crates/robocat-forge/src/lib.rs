pub mod gitlab;
pub mod jira;

pub use gitlab::GitlabClient;
pub use jira::JiraClient;

use robocat_core::api::ApiError;

/// Map a transport-level reqwest failure onto the engine's error taxonomy.
pub(crate) fn transport_error(service: &'static str, err: reqwest::Error) -> ApiError {
    ApiError::Transient { service, message: err.to_string() }
}

/// Map a non-success HTTP status onto the engine's error taxonomy.
pub(crate) fn status_error(service: &'static str, status: u16, body: String) -> ApiError {
    match status {
        404 => ApiError::NotFound { service, message: body },
        429 | 500..=599 => {
            ApiError::Transient { service, message: format!("HTTP {status}: {body}") }
        }
        _ => ApiError::Permanent { service, status, message: body },
    }
}
