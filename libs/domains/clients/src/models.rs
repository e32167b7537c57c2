use amqp_messaging::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Custom validator rejecting whitespace-only names
fn validate_not_blank(name: &str) -> Result<(), validator::ValidationError> {
    if name.trim().is_empty() {
        return Err(validator::ValidationError::new("blank_name"));
    }
    Ok(())
}

/// Client record as carried on the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Client {
    /// Storage key; never sent over the wire
    #[serde(skip)]
    pub id: i64,
    pub uuid: Uuid,
    #[validate(length(min = 1, max = 100), custom(function = "validate_not_blank"))]
    pub name: String,
    #[validate(range(min = 1, max = 200))]
    pub age: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(email)]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Client {
    /// New client with a fresh v4 UUID, stamped now
    pub fn new(name: impl Into<String>, age: u8) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            uuid: Uuid::new_v4(),
            name: name.into(),
            age,
            email: None,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }
}

impl Message for Client {}
