//! `POST /.well-known/mercure`: the publication endpoint.

use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use log::*;

use domain::{PublishForm, Update};

use crate::error::{Error, ResponseFormat, Result, WebErrorKind};
use crate::{request_base_url, AppState};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Publishes an update.
///
/// The publisher's `mercure.publish` selectors must cover at least one of
/// the publication's topics, and the update id when the client supplies
/// one. Responds with the update id as plain text.
pub async fn publish(
    State(app_state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let format = ResponseFormat::negotiate(&headers);
    let fail = |error: Error| error.with_format(format);

    let base = request_base_url(&headers);
    let query_token = query
        .as_deref()
        .and_then(|query| query_param(query, "authorization"));
    let publisher = app_state
        .authorizer
        .authorize_publisher(&headers, query_token.as_deref(), base.as_ref())
        .await
        .map_err(fail)?;

    let form_content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or("").trim() == FORM_CONTENT_TYPE)
        .unwrap_or(false);
    if !form_content_type {
        return Err(fail(Error::new(WebErrorKind::UnsupportedMediaType)));
    }

    let form = PublishForm::from_pairs(url::form_urlencoded::parse(&body));
    if form.topics.is_empty() {
        return Err(fail(Error::new(WebErrorKind::MalformedRequest(
            "at least one topic is required".to_owned(),
        ))));
    }
    let client_supplied_id = form.id.is_some();

    let update = Update::from_form(form).map_err(|e| fail(Error::from(e)))?;

    // A client-chosen id must itself be covered by the publish selectors.
    if client_supplied_id
        && !publisher
            .selectors
            .iter()
            .any(|selector| selector.matches(update.id()))
    {
        return Err(fail(Error::new(WebErrorKind::Forbidden(
            "the token's mercure.publish selectors do not cover the update id".to_owned(),
        ))));
    }

    if !update.topics().any(|topic| {
        publisher
            .selectors
            .iter()
            .any(|selector| selector.matches(topic))
    }) {
        return Err(fail(Error::new(WebErrorKind::Forbidden(
            "the token's mercure.publish selectors cover none of the topics".to_owned(),
        ))));
    }

    let stored = app_state
        .hub()
        .publish(update)
        .await
        .map_err(|e| fail(Error::from(e)))?;
    debug!("Published update {} on {}", stored.id(), stored.canonical_topic());

    Ok((StatusCode::OK, stored.id().to_owned()))
}

/// First value of a query parameter in a raw query string.
pub(crate) fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}
