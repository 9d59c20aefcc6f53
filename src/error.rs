use rocket::http::Status;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use rocket::Request;
use serde::Serialize;

/// Uniform error surface for the HTTP send/status endpoints.
/// Socket and stream sessions render the same `code` into their own wire
/// frames instead of going through this `Responder`.
#[derive(Debug, Clone)]
pub enum GatewayError {
    InvalidInput(String),
    AuthFailure(String),
    BridgeUnavailable,
    UpstreamSendFailed(String),
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidInput(_) => "INVALID_INPUT",
            GatewayError::AuthFailure(_) => "AUTH_FAILURE",
            GatewayError::BridgeUnavailable => "BRIDGE_UNAVAILABLE",
            GatewayError::UpstreamSendFailed(_) => "SEND_FAILED",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> Status {
        match self {
            GatewayError::InvalidInput(_) => Status::BadRequest,
            GatewayError::AuthFailure(_) => Status::Unauthorized,
            GatewayError::BridgeUnavailable => Status::ServiceUnavailable,
            GatewayError::UpstreamSendFailed(_) => Status::BadGateway,
            GatewayError::Internal(_) => Status::InternalServerError,
        }
    }

    fn message(&self) -> String {
        match self {
            GatewayError::InvalidInput(m)
            | GatewayError::AuthFailure(m)
            | GatewayError::UpstreamSendFailed(m)
            | GatewayError::Internal(m) => m.clone(),
            GatewayError::BridgeUnavailable => "upstream bridge is not connected".to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
    code: &'static str,
}

impl<'r, 'o: 'r> Responder<'r, 'o> for GatewayError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let body = ErrorBody {
            error: self.message(),
            message: self.message(),
            code: self.code(),
        };
        Response::build_from(Json(body).respond_to(req)?)
            .status(self.status())
            .ok()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
