use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use headcount_core::{PrincipalId, Snapshot, StoreError};

use crate::util::record_id;

pub type PartyId = String;
pub type AttendeeId = String;

/// A typed top-level document in the session store.
pub trait Record: Sized {
    const COLLECTION: &'static str;

    /// Decode a snapshot, adopting the document id.
    fn from_snapshot(snapshot: &Snapshot) -> Result<Self, StoreError>;

    /// The stored document shape. The id is the document's address in the
    /// store, never one of its fields.
    fn to_value(&self) -> Value
    where
        Self: Serialize,
    {
        serde_json::to_value(self).expect("record serializes")
    }
}

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// A registered account's profile and party index.
///
/// Every field except the address is tolerated missing, since records written
/// by old app versions may predate a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    #[serde(skip)]
    pub id: PrincipalId,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub is_admin: bool,
    /// Ids of parties the account joined or created.
    #[serde(default)]
    pub active_parties: Vec<PartyId>,
    /// Wire tags of the sign-in methods linked to the account.
    #[serde(default)]
    pub auth_providers: Vec<String>,
}

impl UserRecord {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    #[cfg(test)]
    pub fn mock(id: &str) -> Self {
        Self {
            id: id.to_string(),
            email: format!("{}@example.com", id),
            first_name: id.to_string(),
            last_name: "Mock".to_string(),
            is_admin: false,
            active_parties: Vec::new(),
            auth_providers: vec!["password".to_string()],
        }
    }
}

impl Record for UserRecord {
    const COLLECTION: &'static str = "users";

    fn from_snapshot(snapshot: &Snapshot) -> Result<Self, StoreError> {
        let mut record: Self = snapshot.decode()?;
        record.id = snapshot.id.clone();

        Ok(record)
    }
}

/// One shared party: its metadata, editor set, and attendance roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyRecord {
    #[serde(skip)]
    pub id: PartyId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub passcode: String,
    #[serde(default)]
    pub creator_id: PrincipalId,
    /// Always contains the creator.
    #[serde(default)]
    pub editors: Vec<PrincipalId>,
    #[serde(default = "epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "epoch")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub people: Vec<AttendeeRecord>,
}

impl PartyRecord {
    pub fn is_editor(&self, principal: &str) -> bool {
        self.editors.iter().any(|editor| editor == principal)
    }

    /// Resolves what the user may do to this party.
    pub fn role_of(&self, user: &UserRecord) -> Role {
        if user.is_admin {
            Role::Admin
        } else if self.creator_id == user.id {
            Role::Creator
        } else if self.is_editor(&user.id) {
            Role::Editor
        } else {
            Role::Guest
        }
    }

    pub fn attendee(&self, attendee_id: &str) -> Option<&AttendeeRecord> {
        self.people.iter().find(|person| person.id == attendee_id)
    }

    pub fn attendee_mut(&mut self, attendee_id: &str) -> Option<&mut AttendeeRecord> {
        self.people.iter_mut().find(|person| person.id == attendee_id)
    }

    /// Case-insensitive substring search over the roster, matching first,
    /// last, and full names. Results are sorted by last name; ties keep
    /// roster order. An empty query returns the whole roster.
    pub fn search(&self, query: &str) -> Vec<AttendeeRecord> {
        let needle = query.trim().to_lowercase();

        let mut results: Vec<AttendeeRecord> = self
            .people
            .iter()
            .filter(|person| {
                if needle.is_empty() {
                    return true;
                }

                let first = person.first_name.to_lowercase();
                let last = person.last_name.to_lowercase();
                let full = format!("{} {}", first, last);

                first.contains(&needle) || last.contains(&needle) || full.contains(&needle)
            })
            .cloned()
            .collect();

        results.sort_by_key(|person| person.last_name.to_lowercase());
        results
    }

    pub fn was_active_within(&self, days: i64, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.updated_at) <= Duration::days(days)
    }

    #[cfg(test)]
    pub fn mock(id: &str, creator: &UserRecord) -> Self {
        let now = Utc::now();

        Self {
            id: id.to_string(),
            name: format!("{}'s party", creator.first_name),
            passcode: "048213".to_string(),
            creator_id: creator.id.clone(),
            editors: vec![creator.id.clone()],
            created_at: now,
            updated_at: now,
            people: Vec::new(),
        }
    }
}

impl Record for PartyRecord {
    const COLLECTION: &'static str = "party";

    fn from_snapshot(snapshot: &Snapshot) -> Result<Self, StoreError> {
        let mut record: Self = snapshot.decode()?;
        record.id = snapshot.id.clone();

        Ok(record)
    }
}

/// A person on a party's roster. Stored embedded in the party document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendeeRecord {
    #[serde(default)]
    pub id: AttendeeId,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub is_present: bool,
    #[serde(default = "epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "epoch")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub add_method: AddMethod,
    /// The principal that last mutated this entry, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<PrincipalId>,
}

impl AttendeeRecord {
    pub fn new(first_name: &str, last_name: &str, add_method: AddMethod) -> Self {
        let now = Utc::now();

        Self {
            id: record_id(),
            first_name: first_name.trim().to_string(),
            last_name: last_name.trim().to_string(),
            is_present: false,
            created_at: now,
            updated_at: now,
            add_method,
            updated_by: None,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// How an attendee ended up on the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddMethod {
    #[default]
    Manual,
    Imported,
}

/// What a principal is allowed to do to a party.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Creator,
    Editor,
    Guest,
}

impl Role {
    /// Whether roster entries, editors, and the party name may be changed.
    pub fn can_edit(&self) -> bool {
        !matches!(self, Role::Guest)
    }

    /// Whether the party itself may be deleted and other editors removed.
    pub fn can_manage(&self) -> bool {
        matches!(self, Role::Admin | Role::Creator)
    }
}
