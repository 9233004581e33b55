//! Form rules for event drafts and account forms, checked before anything is sent.

use chrono::{DateTime, Utc};
use shared::protocol::{EventDraft, EventNotificationRequest, RegisterRequest};
use url::Url;

use crate::error::{CoordinatorError, CoordinatorResult};

const MIN_TITLE_LEN: usize = 3;
const MIN_DESCRIPTION_LEN: usize = 10;
const MIN_LOCATION_LEN: usize = 3;
const MIN_NAME_LEN: usize = 3;
const MIN_CITY_LEN: usize = 2;
const MIN_PASSWORD_LEN: usize = 6;

/// Validates a create or edit form. `now` is only passed on creation: an edited
/// event may already have started.
pub fn validate_event_draft(
    draft: &EventDraft,
    now: Option<DateTime<Utc>>,
) -> CoordinatorResult<()> {
    min_chars("title", &draft.title, MIN_TITLE_LEN)?;
    min_chars("description", &draft.description, MIN_DESCRIPTION_LEN)?;
    min_chars("location", &draft.location, MIN_LOCATION_LEN)?;

    if draft.capacity == 0 {
        return Err(invalid("capacity must be greater than zero"));
    }

    if let Some(banner) = draft.banner.as_deref().map(str::trim) {
        if !banner.is_empty() && !is_web_url(banner) {
            return Err(invalid("banner must be an http(s) URL"));
        }
    }

    if let Some(now) = now {
        if draft.date < now {
            return Err(invalid("event date cannot be in the past"));
        }
    }

    if let Some(end_date) = draft.end_date {
        if end_date < draft.date {
            return Err(invalid("end date cannot be before the start date"));
        }
    }

    Ok(())
}

pub fn validate_notification(request: &EventNotificationRequest) -> CoordinatorResult<()> {
    if request.title.trim().is_empty() {
        return Err(invalid("notification title is required"));
    }
    if request.message.trim().is_empty() {
        return Err(invalid("notification message is required"));
    }
    Ok(())
}

pub fn validate_removal_reason(reason: &str) -> CoordinatorResult<()> {
    if reason.trim().is_empty() {
        return Err(invalid("a reason is required to remove a participant"));
    }
    Ok(())
}

pub fn validate_login(email: &str, password: &str) -> CoordinatorResult<()> {
    if !is_email(email) {
        return Err(invalid("email is not valid"));
    }
    password_rule("password", password)
}

pub fn validate_registration(request: &RegisterRequest) -> CoordinatorResult<()> {
    min_chars("name", &request.name, MIN_NAME_LEN)?;
    if !is_email(&request.email) {
        return Err(invalid("email is not valid"));
    }
    password_rule("password", &request.password)?;
    min_chars("city", request.city.as_deref().unwrap_or_default(), MIN_CITY_LEN)
}

/// A new password must be confirmed and meet the length rule; the current one
/// only has to be present.
pub fn validate_password_change(
    current: &str,
    new_password: &str,
    confirmation: &str,
) -> CoordinatorResult<()> {
    if current.is_empty() || new_password.is_empty() {
        return Err(invalid("current and new password are required"));
    }
    if new_password != confirmation {
        return Err(invalid("passwords do not match"));
    }
    password_rule("new password", new_password)
}

fn password_rule(field: &str, password: &str) -> CoordinatorResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(invalid(format!(
            "{field} must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn min_chars(field: &str, value: &str, min: usize) -> CoordinatorResult<()> {
    if value.trim().chars().count() < min {
        return Err(invalid(format!(
            "{field} must be at least {min} characters"
        )));
    }
    Ok(())
}

fn is_web_url(value: &str) -> bool {
    Url::parse(value).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
}

fn is_email(value: &str) -> bool {
    let value = value.trim();
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && !value.contains(char::is_whitespace)
                && domain
                    .split_once('.')
                    .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
        }
        None => false,
    }
}

fn invalid(message: impl Into<String>) -> CoordinatorError {
    CoordinatorError::Validation(message.into())
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use shared::domain::{EventCategory, Role};

    use super::*;

    fn draft() -> EventDraft {
        EventDraft {
            title: "Rust week".into(),
            description: "Five days of talks and workshops".into(),
            category: EventCategory::Conferencia,
            banner: Some("https://cdn.example.org/banner.png".into()),
            date: Utc::now() + Duration::days(7),
            end_date: None,
            location: "Auditorium".into(),
            workload: 20,
            capacity: 150,
        }
    }

    fn message(result: CoordinatorResult<()>) -> String {
        match result {
            Err(CoordinatorError::Validation(message)) => message,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn well_formed_draft_passes() {
        validate_event_draft(&draft(), Some(Utc::now())).expect("valid");
    }

    #[test]
    fn short_fields_are_rejected() {
        let mut short = draft();
        short.title = "  ab ".into();
        assert!(message(validate_event_draft(&short, None)).starts_with("title"));

        let mut short = draft();
        short.description = "too short".into();
        assert!(message(validate_event_draft(&short, None)).starts_with("description"));

        let mut short = draft();
        short.location = "X".into();
        assert!(message(validate_event_draft(&short, None)).starts_with("location"));
    }

    #[test]
    fn capacity_and_banner_rules() {
        let mut bad = draft();
        bad.capacity = 0;
        assert!(message(validate_event_draft(&bad, None)).contains("capacity"));

        let mut bad = draft();
        bad.banner = Some("ftp://example.org/banner.png".into());
        assert!(message(validate_event_draft(&bad, None)).contains("banner"));

        let mut blank_banner = draft();
        blank_banner.banner = Some("   ".into());
        validate_event_draft(&blank_banner, None).expect("blank banner is ignored");
    }

    #[test]
    fn past_dates_only_matter_on_creation() {
        let mut started = draft();
        started.date = Utc::now() - Duration::hours(2);

        assert!(message(validate_event_draft(&started, Some(Utc::now()))).contains("past"));
        validate_event_draft(&started, None).expect("edits may keep a past start");
    }

    #[test]
    fn end_date_must_follow_start() {
        let mut bad = draft();
        bad.end_date = Some(bad.date - Duration::minutes(1));
        assert!(message(validate_event_draft(&bad, None)).contains("end date"));

        let mut same_day = draft();
        same_day.end_date = Some(same_day.date);
        validate_event_draft(&same_day, None).expect("equal dates allowed");
    }

    #[test]
    fn notifications_and_removals_need_text() {
        let blank_title = EventNotificationRequest {
            title: " ".into(),
            message: "Room changed".into(),
        };
        assert!(validate_notification(&blank_title).is_err());
        let blank_message = EventNotificationRequest {
            title: "Heads up".into(),
            message: "\n".into(),
        };
        assert!(validate_notification(&blank_message).is_err());

        assert!(validate_removal_reason("").is_err());
        assert!(validate_removal_reason("   ").is_err());
        validate_removal_reason("disruptive behaviour").expect("reason");
    }

    fn registration() -> RegisterRequest {
        RegisterRequest {
            name: "Ana Souza".into(),
            email: "ana@example.org".into(),
            password: "hunter22".into(),
            city: Some("Recife".into()),
            role: Role::Participant,
        }
    }

    #[test]
    fn registration_rules() {
        validate_registration(&registration()).expect("valid");

        let mut bad = registration();
        bad.name = "Al".into();
        assert!(message(validate_registration(&bad)).starts_with("name"));

        for email in ["ana", "ana@", "@example.org", "ana@example", "ana @example.org"] {
            let mut bad = registration();
            bad.email = email.into();
            assert!(message(validate_registration(&bad)).contains("email"), "{email}");
        }

        let mut bad = registration();
        bad.password = "12345".into();
        assert!(message(validate_registration(&bad)).starts_with("password"));

        let mut bad = registration();
        bad.city = None;
        assert!(message(validate_registration(&bad)).starts_with("city"));
    }

    #[test]
    fn login_needs_an_email_and_a_long_enough_password() {
        validate_login("ana@example.org", "hunter22").expect("valid");
        assert!(message(validate_login("ana.example.org", "hunter22")).contains("email"));
        assert!(message(validate_login("ana@example.org", "short")).starts_with("password"));
    }

    #[test]
    fn password_change_rules() {
        validate_password_change("old-secret", "new-secret", "new-secret").expect("valid");
        assert!(message(validate_password_change("", "new-secret", "new-secret"))
            .contains("required"));
        assert!(message(validate_password_change("old-secret", "new-secret", "new-secreT"))
            .contains("match"));
        assert!(message(validate_password_change("old-secret", "abc", "abc"))
            .starts_with("new password"));
    }
}
