use axum::response::IntoResponse;
use hyper::StatusCode;

pub type ServerResult<T> = Result<T, ServerError>;

pub struct ServerError {
    status_code: StatusCode,
    message: String,
}

impl ServerError {
    pub fn bad_request(message: impl Into<String>) -> ServerError {
        ServerError {
            status_code: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
    pub fn not_found(message: impl Into<String>) -> ServerError {
        ServerError {
            status_code: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> axum::response::Response {
        (self.status_code, self.message).into_response()
    }
}

impl<T> From<T> for ServerError
    where anyhow::Error: From<T>
{
    fn from(value: T) -> Self {
        let error = anyhow::Error::from(value);
        Self {
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{}\n{}", error, error.backtrace())
        }
    }
}
