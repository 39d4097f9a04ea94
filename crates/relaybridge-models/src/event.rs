//! Minimal view of an inbound remote event, enough to fingerprint it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    /// Native remote id. Only unique per event in channel-style chats.
    pub id: i64,
    pub date: DateTime<Utc>,
    pub sender_id: Option<i64>,
    pub body: RemoteEventBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteEventBody {
    Message {
        text: String,
        #[serde(default)]
        forwarded_from: Option<i64>,
        #[serde(default)]
        media: Option<MediaRef>,
    },
    /// Service notification such as a join or leave.
    Service { action: String },
}

/// The salient part of an attachment for content fingerprinting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaRef {
    Document { id: i64 },
    Photo { id: Option<i64> },
    Geo { lat: f64, long: f64 },
    Contact { user_id: i64 },
    /// Media types that do not contribute to the fingerprint.
    Other,
}

impl RemoteEvent {
    pub fn message(id: i64, date: DateTime<Utc>, text: impl Into<String>) -> Self {
        Self {
            id,
            date,
            sender_id: None,
            body: RemoteEventBody::Message {
                text: text.into(),
                forwarded_from: None,
                media: None,
            },
        }
    }

    pub fn service(id: i64, date: DateTime<Utc>, sender_id: i64, action: impl Into<String>) -> Self {
        Self {
            id,
            date,
            sender_id: Some(sender_id),
            body: RemoteEventBody::Service {
                action: action.into(),
            },
        }
    }

    pub fn with_media(mut self, media: MediaRef) -> Self {
        if let RemoteEventBody::Message { media: slot, .. } = &mut self.body {
            *slot = Some(media);
        }
        self
    }

    pub fn with_sender(mut self, sender_id: i64) -> Self {
        self.sender_id = Some(sender_id);
        self
    }
}
