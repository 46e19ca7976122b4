use crate::services::phonepe::GatewayError;
use crate::services::repository::StoreError;
use axum::http::StatusCode;
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Already enrolled in this item")]
    AlreadyEnrolled,

    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("{0}")]
    Forbidden(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Validation(message) => AppError::Rejected {
                status: StatusCode::BAD_REQUEST,
                code: "validation_error",
                message,
            },
            PaymentError::NotFound(message) => AppError::NotFound(anyhow::anyhow!(message)),
            PaymentError::AlreadyEnrolled => AppError::Rejected {
                status: StatusCode::CONFLICT,
                code: "already_enrolled",
                message: "Already enrolled in this item".to_string(),
            },
            PaymentError::Gateway(e) => {
                // The provider's reply stays in the logs; the payer gets a
                // generic message.
                tracing::error!(error = %e, "Payment gateway failure");
                AppError::Rejected {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "payment_failed",
                    message: "Payment initiation failed".to_string(),
                }
            }
            PaymentError::Forbidden(message) => AppError::Forbidden(anyhow::anyhow!(message)),
            PaymentError::Store(e) => AppError::DatabaseError(anyhow::Error::new(e)),
        }
    }
}
