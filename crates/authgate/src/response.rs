//! Redirect responses shared by the flow endpoints

use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use url::Url;

use crate::error::BrokerError;

/// `302 Found`
pub(crate) fn found(location: &str) -> Response {
    redirect(StatusCode::FOUND, location)
}

/// `307 Temporary Redirect`; the client replays method and body
pub(crate) fn temporary_redirect(location: &str) -> Response {
    redirect(StatusCode::TEMPORARY_REDIRECT, location)
}

fn redirect(status: StatusCode, location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (status, [(header::LOCATION, value)]).into_response(),
        Err(_) => BrokerError::server(format!("unencodable redirect location for {status}"))
            .into_response(),
    }
}

/// Append query parameters to a client redirect URI
pub(crate) fn with_params<'a>(
    redirect_uri: &str,
    params: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<Url, BrokerError> {
    let mut url =
        Url::parse(redirect_uri).map_err(|e| BrokerError::InvalidRedirect(e.to_string()))?;
    url.query_pairs_mut().extend_pairs(params);
    Ok(url)
}

/// An OAuth error delivered to the client's redirect URI
///
/// Only built once the redirect URI itself has passed validation.
#[derive(Debug, Clone)]
pub(crate) struct ErrorRedirect {
    pub redirect_uri: String,
    pub error: &'static str,
    pub description: String,
    pub state: Option<String>,
}

impl ErrorRedirect {
    pub(crate) fn new(
        redirect_uri: impl Into<String>,
        error: &'static str,
        description: impl Into<String>,
        state: Option<String>,
    ) -> Self {
        Self {
            redirect_uri: redirect_uri.into(),
            error,
            description: description.into(),
            state,
        }
    }
}

impl IntoResponse for ErrorRedirect {
    fn into_response(self) -> Response {
        let mut params = vec![
            ("error", self.error),
            ("error_description", self.description.as_str()),
        ];
        if let Some(state) = self.state.as_deref() {
            params.push(("state", state));
        }
        match with_params(&self.redirect_uri, params) {
            Ok(url) => found(url.as_str()),
            Err(err) => err.into_response(),
        }
    }
}
