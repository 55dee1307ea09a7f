//! SSE frame construction.

use std::time::Duration;

use axum::response::sse::Event;

use domain::Update;

/// Renders an update as a Server-Sent Events frame:
///
/// ```text
/// id: <update.id>
/// event: <update.type>      (when set)
/// retry: <update.retry>     (when set)
/// data: <data>              (embedded newlines split into more data lines)
/// ```
///
/// The field writers append in call order, and an update is rendered into a
/// single frame, so its bytes never interleave with another update on the
/// same stream.
pub fn update_frame(update: &Update) -> Event {
    let mut event = Event::default().id(update.id());
    if let Some(event_type) = update.event_type() {
        event = event.event(event_type);
    }
    if let Some(retry) = update.retry() {
        event = event.retry(Duration::from_millis(retry));
    }
    event.data(update.data().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::PublishForm;

    #[test]
    fn renders_full_and_minimal_updates() {
        let full = Update::from_form(PublishForm {
            topics: vec!["https://example.com/a".to_owned()],
            data: Some("line one\nline two".to_owned()),
            event_type: Some("message".to_owned()),
            retry: Some("3000".to_owned()),
            ..Default::default()
        })
        .unwrap();
        // The builder panics on invalid field values; constructing both
        // shapes is the contract under test.
        update_frame(&full);

        let minimal = Update::from_form(PublishForm {
            topics: vec!["https://example.com/a".to_owned()],
            ..Default::default()
        })
        .unwrap();
        update_frame(&minimal);
    }
}
