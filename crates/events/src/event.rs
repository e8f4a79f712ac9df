//! User lifecycle events published to the broker.
//!
//! Each variant maps to one routing key. The payload is a flat JSON object
//! with no variant tag, and timestamps serialize as RFC 3339 strings.

use serde::Serialize;
use users_core::types::{DbId, Timestamp};

pub const USER_CREATED: &str = "user.created";
pub const USER_UPDATED: &str = "user.updated";
pub const USER_DELETED: &str = "user.deleted";

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum UserEvent {
    Created {
        user_id: DbId,
        name: String,
        email: String,
        created_at: Timestamp,
    },
    Updated {
        user_id: DbId,
        name: String,
        email: String,
        updated_at: Timestamp,
    },
    Deleted {
        user_id: DbId,
        name: String,
        deleted_at: Timestamp,
    },
}

impl UserEvent {
    /// Routing key under which the event is published.
    pub fn routing_key(&self) -> &'static str {
        match self {
            UserEvent::Created { .. } => USER_CREATED,
            UserEvent::Updated { .. } => USER_UPDATED,
            UserEvent::Deleted { .. } => USER_DELETED,
        }
    }

    pub fn user_id(&self) -> DbId {
        match self {
            UserEvent::Created { user_id, .. }
            | UserEvent::Updated { user_id, .. }
            | UserEvent::Deleted { user_id, .. } => *user_id,
        }
    }
}
