//! Contacts and the payload delivered to each channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::directory::geo::Position;
use crate::error::{HavenError, Result};
use crate::ipc::events::Channel;

/// A person notified during an emergency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub relationship: String,
}

impl Contact {
    /// # Errors
    /// `InvalidContact` when name or phone is blank, or the email has no `@`.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(HavenError::InvalidContact(format!(
                "contact {} has no name",
                self.id
            )));
        }
        if self.phone.trim().is_empty() {
            return Err(HavenError::InvalidContact(format!(
                "contact {} has no phone number",
                self.name
            )));
        }
        if let Some(email) = self.email.as_deref() {
            if !email.trim().is_empty() && !email.contains('@') {
                return Err(HavenError::InvalidContact(format!(
                    "contact {} has a malformed email: {email}",
                    self.name
                )));
            }
        }
        Ok(())
    }

    fn email_address(&self) -> Option<&str> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }
}

/// Immutable snapshot the state machine hands to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub session_id: Uuid,
    pub sender_name: String,
    pub position: Option<Position>,
    pub contacts: Vec<Contact>,
    pub created_at: DateTime<Utc>,
}

/// What the gateway receives for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    /// `None` for test alerts sent outside a session.
    pub session_id: Option<Uuid>,
    pub channel: Channel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub position: Option<Position>,
    pub recipients: Vec<String>,
}

impl AlertPayload {
    pub fn for_request(request: &DispatchRequest, channel: Channel) -> Self {
        Self {
            session_id: Some(request.session_id),
            channel,
            message: alert_message(
                &request.sender_name,
                request.position.as_ref(),
                request.created_at,
            ),
            timestamp: request.created_at,
            position: request.position,
            recipients: recipients_for(channel, &request.contacts),
        }
    }

    /// Single SMS used to verify a contact's number.
    pub fn test_message(sender_name: &str, phone: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: None,
            channel: Channel::Sms,
            message: format!(
                "TEST: {sender_name} added you as an emergency contact - {}",
                format_time(now)
            ),
            timestamp: now,
            position: None,
            recipients: vec![phone.trim().to_string()],
        }
    }
}

/// `EMERGENCY: <name> needs help at <location> - <time>`
pub fn alert_message(sender_name: &str, position: Option<&Position>, at: DateTime<Utc>) -> String {
    let location = position
        .map(Position::display_coords)
        .unwrap_or_else(|| "unknown location".to_string());
    format!(
        "EMERGENCY: {sender_name} needs help at {location} - {}",
        format_time(at)
    )
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Addresses for `channel`: phones for SMS, emails for email, names for location share.
pub fn recipients_for(channel: Channel, contacts: &[Contact]) -> Vec<String> {
    match channel {
        Channel::Sms => contacts.iter().map(|c| c.phone.trim().to_string()).collect(),
        Channel::Email => contacts
            .iter()
            .filter_map(|c| c.email_address().map(str::to_string))
            .collect(),
        Channel::LocationShare => contacts.iter().map(|c| c.name.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn contact(name: &str, phone: &str, email: Option<&str>) -> Contact {
        Contact {
            id: name.to_lowercase(),
            name: name.into(),
            phone: phone.into(),
            email: email.map(Into::into),
            relationship: "Friend".into(),
        }
    }

    #[test]
    fn message_includes_coordinates_and_utc_time() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 18, 4, 5).unwrap();
        let pos = Position::new(-1.2647, 36.7156);
        assert_eq!(
            alert_message("Amina", Some(&pos), at),
            "EMERGENCY: Amina needs help at -1.26470, 36.71560 - 2024-03-09 18:04:05 UTC"
        );
    }

    #[test]
    fn message_without_position_says_unknown_location() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 18, 4, 5).unwrap();
        assert!(alert_message("Amina", None, at).contains("at unknown location -"));
    }

    #[test]
    fn email_recipients_skip_contacts_without_address() {
        let contacts = vec![
            contact("Wanjiru", "+254711111111", Some("wanjiru@example.com")),
            contact("Otieno", "+254722222222", None),
            contact("Baraka", "+254733333333", Some("  ")),
        ];
        assert_eq!(
            recipients_for(Channel::Email, &contacts),
            vec!["wanjiru@example.com".to_string()]
        );
        assert_eq!(recipients_for(Channel::Sms, &contacts).len(), 3);
        assert_eq!(
            recipients_for(Channel::LocationShare, &contacts),
            vec!["Wanjiru", "Otieno", "Baraka"]
        );
    }

    #[test]
    fn payload_carries_session_and_position() {
        let request = DispatchRequest {
            session_id: Uuid::new_v4(),
            sender_name: "Amina".into(),
            position: Some(Position::new(1.0, 2.0)),
            contacts: vec![contact("Wanjiru", "+254711111111", None)],
            created_at: Utc::now(),
        };
        let payload = AlertPayload::for_request(&request, Channel::Sms);
        assert_eq!(payload.session_id, Some(request.session_id));
        assert_eq!(payload.position, request.position);
        assert_eq!(payload.recipients, vec!["+254711111111".to_string()]);
    }

    #[test]
    fn validate_rejects_blank_phone_and_bad_email() {
        assert!(contact("Wanjiru", "", None).validate().is_err());
        assert!(contact("Wanjiru", "+2547", Some("nope")).validate().is_err());
        assert!(contact("", "+2547", None).validate().is_err());
        assert!(contact("Wanjiru", "+2547", Some("w@example.com"))
            .validate()
            .is_ok());
    }
}
