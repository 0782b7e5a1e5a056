//! Pre-signed request authorization.
//!
//! The HTTP session endpoints do not check credentials themselves. The caller
//! signs a request for the command backend ahead of time and hands over the
//! signature in `X-SN-PreSignedAuthorization` (or `Authorization`) together
//! with the date it was signed for in `X-SN-Date` (or `Date`). Both are
//! replayed to the backend, which decides.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};

use crate::backend::Authorization;
use crate::error::TunnelError;

pub const PRESIGNED_AUTHORIZATION_HEADER: &str = "x-sn-presignedauthorization";
pub const SIGNED_DATE_HEADER: &str = "x-sn-date";

/// Extractor for the caller's pre-signed authorization.
///
/// Rejects with `403` when either header is missing.
#[derive(Debug, Clone)]
pub struct PresignedAuth(pub Authorization);

impl<S: Send + Sync> FromRequestParts<S> for PresignedAuth {
    type Rejection = TunnelError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        presigned_from_headers(&parts.headers).map(Self)
    }
}

fn header<'a>(headers: &'a HeaderMap, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .find(|v| !v.is_empty())
}

pub fn presigned_from_headers(headers: &HeaderMap) -> Result<Authorization, TunnelError> {
    let authorization = header(headers, &[PRESIGNED_AUTHORIZATION_HEADER, "authorization"])
        .ok_or_else(|| TunnelError::auth("missing pre-signed authorization"))?;
    let date = header(headers, &[SIGNED_DATE_HEADER, "date"])
        .ok_or_else(|| TunnelError::auth("missing authorization date"))?;
    Ok(Authorization::Presigned {
        authorization: authorization.to_string(),
        date: date.to_string(),
    })
}
