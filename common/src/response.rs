//! JSON error responses shared by the HTTP surfaces.

use std::fmt::{Debug, Display};

use anyhow::Error;
use axum::{Json, http::StatusCode, response::IntoResponse, response::Response};
use owo_colors::OwoColorize;

pub fn print_error<T>(e: T)
where
    T: Into<Error> + Display + Debug,
{
    eprintln!(
        "❌ {}",
        format!("{:?}", e.into())
            .split("\n")
            .map(|s| s.red().to_string())
            .collect::<Vec<_>>()
            .join("\n"),
    );
}

pub fn err_resp<T>(e: T, code: StatusCode) -> Response
where
    T: Into<Error> + Display + Debug,
{
    let reason = format!("{}", e);
    print_error(e);
    (code, Json(serde_json::json!({"reason": reason}))).into_response()
}

pub fn bad_request<T>(e: T) -> Response
where
    T: Into<Error> + Display + Debug,
{
    err_resp(e, StatusCode::BAD_REQUEST)
}

pub fn unauthorized<T>(e: T) -> Response
where
    T: Into<Error> + Display + Debug,
{
    err_resp(e, StatusCode::UNAUTHORIZED)
}

pub fn not_found<T>(e: T) -> Response
where
    T: Into<Error> + Display + Debug,
{
    err_resp(e, StatusCode::NOT_FOUND)
}

pub fn conflict<T>(e: T) -> Response
where
    T: Into<Error> + Display + Debug,
{
    err_resp(e, StatusCode::CONFLICT)
}

pub fn too_many_requests<T>(e: T) -> Response
where
    T: Into<Error> + Display + Debug,
{
    err_resp(e, StatusCode::TOO_MANY_REQUESTS)
}

pub fn internal_server_error<T>(e: T) -> Response
where
    T: Into<Error> + Display + Debug,
{
    err_resp(e, StatusCode::INTERNAL_SERVER_ERROR)
}

pub fn service_unavailable<T>(e: T) -> Response
where
    T: Into<Error> + Display + Debug,
{
    err_resp(e, StatusCode::SERVICE_UNAVAILABLE)
}
