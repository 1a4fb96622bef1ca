use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use snafu::{Location, Snafu};

use crate::model::ParseVideoId;
use crate::predict::PredictionError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ApiError {
    #[snafu(display("{source}"))]
    InvalidVideoId {
        source: ParseVideoId,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("{source}"))]
    Prediction {
        source: PredictionError,
        #[snafu(implicit)]
        location: Location,
    },
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidVideoId { .. } => StatusCode::BAD_REQUEST,
            ApiError::Prediction { source, .. } => match source {
                PredictionError::UnknownVideo { .. } => StatusCode::NOT_FOUND,
                PredictionError::Superseded { .. } => StatusCode::CONFLICT,
                PredictionError::InsufficientFeatures { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                PredictionError::ModelUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                PredictionError::InvalidTransition { .. } | PredictionError::Database { .. } => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ApiError::InvalidVideoId { .. } => "invalid_video_id",
            ApiError::Prediction { source, .. } => source.reason(),
        }
    }
}

/// Body of every error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub reason: &'static str,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = ?self, "request failed: {self}");
        }

        let body = ErrorBody {
            reason: self.reason(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}
