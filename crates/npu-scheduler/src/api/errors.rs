use core::error::Error;

use error_stack::Report;
use poem::http::StatusCode;

use crate::error::ScheduleError;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
    #[display("Route table error: {message}")]
    Routes { message: String },
}

impl Error for ApiError {}

/// HTTP status for an engine error returned from a handler.
pub fn status_of(error: &ScheduleError) -> StatusCode {
    match error {
        ScheduleError::UnknownNode { .. } | ScheduleError::UnknownJob { .. } => {
            StatusCode::NOT_FOUND
        }
        ScheduleError::ValidationFailed { .. }
        | ScheduleError::UnsupportedFamily { .. }
        | ScheduleError::MalformedTopology { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ScheduleError::InfeasibleNode { .. }
        | ScheduleError::InsufficientTopology { .. }
        | ScheduleError::OverCommitted { .. }
        | ScheduleError::InvalidTransition { .. } => StatusCode::CONFLICT,
        ScheduleError::RouteConflict { .. } | ScheduleError::Config { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Turn an engine report into a poem error carrying its message.
pub fn to_poem_error(report: &Report<ScheduleError>) -> poem::Error {
    let context = report.current_context();
    poem::Error::from_string(context.to_string(), status_of(context))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_display_formatting() {
        let server_error = ApiError::ServerError {
            message: "Internal server error".to_string(),
        };
        assert_eq!(
            server_error.to_string(),
            "Server error: Internal server error"
        );
    }

    #[test]
    fn engine_errors_map_to_statuses() {
        assert_eq!(
            status_of(&ScheduleError::UnknownJob {
                job: "j".to_string()
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(&ScheduleError::InsufficientTopology {
                node: "n".to_string(),
                task: "j/t".to_string(),
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(&ScheduleError::malformed("n", "bad")),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
