use std::sync::Arc;

use chrono::Utc;
use crossbeam::atomic::AtomicCell;
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;

use headcount_core::{
    AuthProvider, DocumentEvent, FieldUpdate, Filter, Revision, SessionState, SessionStore,
    StoreError,
};

use crate::events::{CollabEvent, ReconcileAction};
use crate::identity::{IdentityError, IdentityManager};
use crate::records::{
    AddMethod, AttendeeId, AttendeeRecord, PartyRecord, Record, UserRecord,
};
use crate::util::record_id;
use crate::validation::{self, ValidationError};
use crate::CollabContext;

mod state;

pub use state::PartyState;
use state::{OpenParty, OpenState};

/// How many times a roster commit retries after losing a write race.
/// Transport failures are never retried.
const MAX_COMMIT_ATTEMPTS: usize = 5;

/// Owns the single open party: its live subscription, the last authoritative
/// snapshot, and every mutation of the party document.
pub struct PartyManager<S, A> {
    context: CollabContext<S, A>,
    identity: Arc<IdentityManager<S, A>>,
    open: Mutex<OpenState>,
    generation: AtomicCell<u64>,
}

/// Details for [`PartyManager::create`]. The creator is always the signed-in
/// principal.
#[derive(Debug, Clone)]
pub struct NewParty {
    pub name: String,
    pub passcode: String,
}

/// One person for [`PartyManager::import_attendees`].
#[derive(Debug, Clone)]
pub struct NewAttendee {
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Error)]
pub enum PartyError {
    #[error("No party is open")]
    NotOpen,
    #[error("No principal is signed in")]
    NotSignedIn,
    #[error("No party matches {identifier}")]
    NotFound { identifier: String },
    #[error("A party with this passcode already exists")]
    PasscodeTaken,
    #[error("attendee:{0} is not on the roster")]
    AttendeeNotFound(AttendeeId),
    #[error("Not allowed to {action}")]
    Permission { action: &'static str },
    #[error("The creator cannot be removed from the editors")]
    CreatorImmutable,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Identity(Box<IdentityError>),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<IdentityError> for PartyError {
    fn from(error: IdentityError) -> Self {
        match error {
            IdentityError::NotSignedIn => Self::NotSignedIn,
            IdentityError::Validation(error) => Self::Validation(error),
            IdentityError::Store(error) => Self::Store(error),
            error => Self::Identity(Box::new(error)),
        }
    }
}

impl<S, A> PartyManager<S, A>
where
    S: SessionStore,
    A: AuthProvider,
{
    pub fn new(context: &CollabContext<S, A>, identity: &Arc<IdentityManager<S, A>>) -> Self {
        Self {
            context: context.clone(),
            identity: identity.clone(),
            open: Mutex::new(OpenState::Unopened),
            generation: AtomicCell::new(0),
        }
    }

    /// The open-party handle's lifecycle state.
    pub fn state(&self) -> PartyState {
        self.open.lock().as_public()
    }

    /// The last authoritative snapshot of the open party.
    pub fn current_party(&self) -> Option<PartyRecord> {
        match &*self.open.lock() {
            OpenState::Open(open) => Some(open.record.clone()),
            _ => None,
        }
    }

    /// Create a party owned by the signed-in principal and open it.
    pub async fn create(&self, new_party: NewParty) -> Result<PartyRecord, PartyError> {
        validation::name("party name", &new_party.name)?;
        validation::passcode(&new_party.passcode)?;

        let user = self.signed_in_user()?;

        // Passcodes are how people join, so a live duplicate would route
        // joiners into the wrong party.
        let taken = self
            .context
            .store
            .query(
                PartyRecord::COLLECTION,
                Filter::field_equals("passcode", new_party.passcode.clone()),
            )
            .await?;

        if !taken.is_empty() {
            return Err(PartyError::PasscodeTaken);
        }

        let now = Utc::now();

        let record = PartyRecord {
            id: record_id(),
            name: new_party.name.trim().to_string(),
            passcode: new_party.passcode.clone(),
            creator_id: user.id.clone(),
            editors: vec![user.id.clone()],
            created_at: now,
            updated_at: now,
            people: Vec::new(),
        };

        let snapshot = self
            .context
            .store
            .create(PartyRecord::COLLECTION, &record.id, record.to_value())
            .await?;

        info!("{} created party {}", user.full_name(), record.name);

        self.identity.add_party_to_visible(&record.id).await?;
        self.open_snapshot(record.clone(), snapshot.revision).await?;

        Ok(record)
    }

    /// Join the live party with this passcode and open it. The first match
    /// wins if duplicates slipped in.
    pub async fn join_by_passcode(&self, passcode: &str) -> Result<PartyRecord, PartyError> {
        validation::passcode(passcode)?;
        self.signed_in_user()?;

        let matches = self
            .context
            .store
            .query(
                PartyRecord::COLLECTION,
                Filter::field_equals("passcode", passcode),
            )
            .await?;

        let snapshot = matches.into_iter().next().ok_or_else(|| PartyError::NotFound {
            identifier: passcode.to_string(),
        })?;

        let record = PartyRecord::from_snapshot(&snapshot)?;

        self.identity.add_party_to_visible(&record.id).await?;
        self.open_snapshot(record.clone(), snapshot.revision).await?;

        info!("Joined party {}", record.name);
        Ok(record)
    }

    /// Open a party by id, replacing any previously open one.
    pub async fn open(&self, party_id: &str) -> Result<PartyRecord, PartyError> {
        validation::identifier("party id", party_id)?;
        self.signed_in_user()?;

        let snapshot = self
            .context
            .store
            .get(PartyRecord::COLLECTION, party_id)
            .await
            .map_err(|error| match error {
                StoreError::NotFound { .. } => PartyError::NotFound {
                    identifier: party_id.to_string(),
                },
                error => PartyError::from(error),
            })?;

        let record = PartyRecord::from_snapshot(&snapshot)?;
        self.open_snapshot(record.clone(), snapshot.revision).await?;

        Ok(record)
    }

    /// Close the open party, if any. Safe to repeat.
    pub async fn close(&self) {
        let previous = {
            let mut open = self.open.lock();

            if matches!(&*open, OpenState::Unopened | OpenState::Closed) {
                return;
            }

            std::mem::replace(&mut *open, OpenState::Closed)
        };

        if let OpenState::Open(open) = previous {
            self.context.store.unsubscribe(&open.subscription).await;
            info!("Closed party {}", open.record.name);
            self.context.emit(CollabEvent::PartyClosed {
                party_id: open.record.id,
            });
        }
    }

    /// Add a person to the roster. Any signed-in principal with the party
    /// open may do this, including guests checking themselves in.
    pub async fn add_attendee(
        &self,
        first_name: &str,
        last_name: &str,
    ) -> Result<AttendeeRecord, PartyError> {
        validation::name("first name", first_name)?;
        validation::name("last name", last_name)?;

        self.signed_in_user()?;
        let party = self.open_record()?;

        let attendee = AttendeeRecord::new(first_name, last_name, AddMethod::Manual);

        self.context
            .store
            .update_fields(
                PartyRecord::COLLECTION,
                &party.id,
                vec![
                    FieldUpdate::union("people", vec![json!(attendee)]),
                    FieldUpdate::set("updatedAt", json!(Utc::now())),
                ],
            )
            .await?;

        info!("Added {} to party {}", attendee.full_name(), party.name);
        Ok(attendee)
    }

    /// Add many people in a single write, marked as imported.
    pub async fn import_attendees(
        &self,
        entries: Vec<NewAttendee>,
    ) -> Result<Vec<AttendeeRecord>, PartyError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        for entry in &entries {
            validation::name("first name", &entry.first_name)?;
            validation::name("last name", &entry.last_name)?;
        }

        let user = self.signed_in_user()?;
        let party = self.open_record()?;

        require_editor(&user, &party, "import attendees")?;

        let attendees: Vec<AttendeeRecord> = entries
            .iter()
            .map(|entry| AttendeeRecord::new(&entry.first_name, &entry.last_name, AddMethod::Imported))
            .collect();

        let values = attendees.iter().map(|attendee| json!(attendee)).collect();

        self.context
            .store
            .update_fields(
                PartyRecord::COLLECTION,
                &party.id,
                vec![
                    FieldUpdate::union("people", values),
                    FieldUpdate::set("updatedAt", json!(Utc::now())),
                ],
            )
            .await?;

        info!("Imported {} people into party {}", attendees.len(), party.name);
        Ok(attendees)
    }

    /// Flip an attendee's presence. Self-service, any role may toggle.
    pub async fn set_presence(
        &self,
        attendee_id: &str,
        present: bool,
    ) -> Result<PartyRecord, PartyError> {
        let user = self.signed_in_user()?;
        let party = self.open_record()?;

        let attendee_id = attendee_id.to_string();
        let principal = user.id;

        self.commit_roster(&party.id, move |record| {
            let attendee = record
                .attendee_mut(&attendee_id)
                .ok_or_else(|| PartyError::AttendeeNotFound(attendee_id.clone()))?;

            attendee.is_present = present;
            attendee.updated_at = Utc::now();
            attendee.updated_by = Some(principal.clone());
            Ok(())
        })
        .await
    }

    /// Correct an attendee's name.
    pub async fn rename_attendee(
        &self,
        attendee_id: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<PartyRecord, PartyError> {
        validation::name("first name", first_name)?;
        validation::name("last name", last_name)?;

        let user = self.signed_in_user()?;
        let party = self.open_record()?;
        require_editor(&user, &party, "rename attendees")?;

        let attendee_id = attendee_id.to_string();
        let principal = user.id;
        let first_name = first_name.trim().to_string();
        let last_name = last_name.trim().to_string();

        self.commit_roster(&party.id, move |record| {
            let attendee = record
                .attendee_mut(&attendee_id)
                .ok_or_else(|| PartyError::AttendeeNotFound(attendee_id.clone()))?;

            attendee.first_name = first_name.clone();
            attendee.last_name = last_name.clone();
            attendee.updated_at = Utc::now();
            attendee.updated_by = Some(principal.clone());
            Ok(())
        })
        .await
    }

    /// Take a person off the roster.
    pub async fn remove_attendee(&self, attendee_id: &str) -> Result<PartyRecord, PartyError> {
        let user = self.signed_in_user()?;
        let party = self.open_record()?;
        require_editor(&user, &party, "remove attendees")?;

        let attendee_id = attendee_id.to_string();

        let updated = self
            .commit_roster(&party.id, move |record| {
                if record.attendee(&attendee_id).is_none() {
                    return Err(PartyError::AttendeeNotFound(attendee_id.clone()));
                }

                record.people.retain(|person| person.id != attendee_id);
                Ok(())
            })
            .await?;

        info!("Removed an attendee from party {}", updated.name);
        Ok(updated)
    }

    /// Promote another principal to editor and surface the party to them.
    pub async fn add_editor(&self, principal: &str) -> Result<(), PartyError> {
        validation::identifier("user id", principal)?;

        let user = self.signed_in_user()?;
        let party = self.open_record()?;
        require_editor(&user, &party, "manage editors")?;

        // The target must have an account record to receive the party.
        self.context
            .store
            .get(UserRecord::COLLECTION, principal)
            .await?;

        self.context
            .store
            .update_fields(
                PartyRecord::COLLECTION,
                &party.id,
                vec![
                    FieldUpdate::union("editors", vec![json!(principal)]),
                    FieldUpdate::set("updatedAt", json!(Utc::now())),
                ],
            )
            .await?;

        self.identity.grant_visibility(principal, &party.id).await?;

        info!("Added an editor to party {}", party.name);
        Ok(())
    }

    /// Demote an editor. Stepping down oneself is always allowed; removing
    /// someone else needs the creator or an admin, and the creator can never
    /// be removed at all.
    pub async fn remove_editor(&self, principal: &str) -> Result<(), PartyError> {
        validation::identifier("user id", principal)?;

        let user = self.signed_in_user()?;
        let party = self.open_record()?;

        if principal == party.creator_id {
            return Err(PartyError::CreatorImmutable);
        }

        if principal != user.id {
            require_manager(&user, &party, "remove other editors")?;
        }

        self.context
            .store
            .update_fields(
                PartyRecord::COLLECTION,
                &party.id,
                vec![
                    FieldUpdate::remove("editors", vec![json!(principal)]),
                    FieldUpdate::set("updatedAt", json!(Utc::now())),
                ],
            )
            .await?;

        Ok(())
    }

    /// Rename the open party.
    pub async fn set_name(&self, name: &str) -> Result<(), PartyError> {
        validation::name("party name", name)?;

        let user = self.signed_in_user()?;
        let party = self.open_record()?;
        require_editor(&user, &party, "rename the party")?;

        self.context
            .store
            .update_fields(
                PartyRecord::COLLECTION,
                &party.id,
                vec![
                    FieldUpdate::set("name", name.trim()),
                    FieldUpdate::set("updatedAt", json!(Utc::now())),
                ],
            )
            .await?;

        Ok(())
    }

    /// Step away from the open party: give up editor status when possible,
    /// stop tracking it, and close the handle.
    pub async fn leave(&self) -> Result<(), PartyError> {
        let user = self.signed_in_user()?;
        let party = self.open_record()?;

        if party.is_editor(&user.id) && party.creator_id != user.id {
            self.context
                .store
                .update_fields(
                    PartyRecord::COLLECTION,
                    &party.id,
                    vec![
                        FieldUpdate::remove("editors", vec![json!(user.id)]),
                        FieldUpdate::set("updatedAt", json!(Utc::now())),
                    ],
                )
                .await?;
        }

        self.identity.remove_party_from_visible(&party.id).await?;
        self.close().await;

        Ok(())
    }

    /// Delete a party outright. Only the creator or an admin may.
    pub async fn delete(&self, party_id: &str) -> Result<(), PartyError> {
        validation::identifier("party id", party_id)?;

        let user = self.signed_in_user()?;

        let snapshot = self
            .context
            .store
            .get(PartyRecord::COLLECTION, party_id)
            .await
            .map_err(|error| match error {
                StoreError::NotFound { .. } => PartyError::NotFound {
                    identifier: party_id.to_string(),
                },
                error => PartyError::from(error),
            })?;

        let record = PartyRecord::from_snapshot(&snapshot)?;
        require_manager(&user, &record, "delete the party")?;

        self.context
            .store
            .delete(PartyRecord::COLLECTION, party_id)
            .await?;

        info!("{} deleted party {}", user.full_name(), record.name);

        // Close locally; other subscribers find out through the feed.
        let was_open =
            matches!(&*self.open.lock(), OpenState::Open(open) if open.record.id == party_id);

        if was_open {
            self.close().await;
        }

        Ok(())
    }

    /// Search the open party's roster. Purely local, over the last received
    /// snapshot.
    pub fn search(&self, query: &str) -> Result<Vec<AttendeeRecord>, PartyError> {
        let party = self.open_record()?;
        Ok(party.search(query))
    }

    fn signed_in_user(&self) -> Result<UserRecord, PartyError> {
        self.identity.current_user().ok_or(PartyError::NotSignedIn)
    }

    fn open_record(&self) -> Result<PartyRecord, PartyError> {
        match &*self.open.lock() {
            OpenState::Open(open) => Ok(open.record.clone()),
            _ => Err(PartyError::NotOpen),
        }
    }

    /// Swap the open handle over to this party: close the previous
    /// subscription, subscribe to the new document, and publish the record.
    /// A generation counter makes the newest of concurrent opens win.
    async fn open_snapshot(&self, record: PartyRecord, revision: Revision) -> Result<(), PartyError> {
        let generation = self.generation.fetch_add(1) + 1;
        let party_id = record.id.clone();

        let previous = {
            let mut open = self.open.lock();

            std::mem::replace(
                &mut *open,
                OpenState::Opening {
                    party_id: party_id.clone(),
                    generation,
                },
            )
        };

        if let OpenState::Open(open) = previous {
            self.context.store.unsubscribe(&open.subscription).await;
            info!("Closed party {}", open.record.name);
        }

        let sender = self.context.actions();

        let subscription = match self
            .context
            .store
            .subscribe(
                PartyRecord::COLLECTION,
                &party_id,
                Arc::new(move |event| {
                    sender.send(ReconcileAction::OpenParty(event)).ok();
                }),
            )
            .await
        {
            Ok(subscription) => subscription,
            Err(error) => {
                let mut open = self.open.lock();

                if matches!(&*open, OpenState::Opening { generation: current, .. } if *current == generation)
                {
                    *open = OpenState::Closed;
                }

                return Err(error.into());
            }
        };

        let superseded = {
            let mut open = self.open.lock();

            let still_current = matches!(
                &*open,
                OpenState::Opening { generation: current, .. } if *current == generation
            );

            if still_current {
                *open = OpenState::Open(OpenParty {
                    record: record.clone(),
                    revision,
                    subscription: subscription.clone(),
                });
            }

            !still_current
        };

        if superseded {
            // Another open overtook this one while it was subscribing.
            self.context.store.unsubscribe(&subscription).await;
            return Ok(());
        }

        info!("Opened party {}", record.name);
        self.context.emit(CollabEvent::PartyUpdated { party: record });
        Ok(())
    }

    /// Commit a read-modify-write of the party document. The closure edits a
    /// fresh copy of the record; the write only lands if nobody else wrote in
    /// between, and a lost race is retried against fresh state.
    async fn commit_roster<F>(&self, party_id: &str, mutate: F) -> Result<PartyRecord, PartyError>
    where
        F: Fn(&mut PartyRecord) -> Result<(), PartyError>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let snapshot = self
                .context
                .store
                .get(PartyRecord::COLLECTION, party_id)
                .await?;

            let mut record = PartyRecord::from_snapshot(&snapshot)?;

            mutate(&mut record)?;
            record.updated_at = Utc::now();

            match self
                .context
                .store
                .replace(
                    PartyRecord::COLLECTION,
                    party_id,
                    snapshot.revision,
                    record.to_value(),
                )
                .await
            {
                Ok(committed) => {
                    self.apply_committed(party_id, committed.revision, &record);
                    return Ok(record);
                }
                Err(StoreError::StaleRevision { .. }) if attempt < MAX_COMMIT_ATTEMPTS => {
                    continue;
                }
                Err(error) => {
                    if error.is_stale() {
                        warn!(
                            "Gave up committing to party {} after {} attempts",
                            party_id, MAX_COMMIT_ATTEMPTS
                        );
                    }

                    return Err(error.into());
                }
            }
        }
    }

    /// Fold a commit of our own into the open handle so reads right after a
    /// write see it, without waiting for the subscription to echo it back.
    fn apply_committed(&self, party_id: &str, revision: Revision, record: &PartyRecord) {
        let mut open = self.open.lock();

        if let OpenState::Open(open_party) = &mut *open {
            if open_party.record.id == party_id && revision >= open_party.revision {
                open_party.revision = revision;
                open_party.record = record.clone();
            }
        }
    }

    pub(crate) async fn apply_auth_state(&self, state: &SessionState) {
        // A session that ended takes the open party with it, wherever the
        // sign-out came from. Skipped when a newer sign-in superseded the
        // queued event.
        if *state == SessionState::SignedOut && self.context.auth.current_principal().is_none() {
            self.close().await;
        }
    }

    pub(crate) async fn apply_open_party(&self, event: DocumentEvent) {
        match event {
            DocumentEvent::Updated(snapshot) => {
                let record = match PartyRecord::from_snapshot(&snapshot) {
                    Ok(record) => record,
                    Err(error) => {
                        warn!("Ignoring an undecodable party snapshot: {}", error);
                        return;
                    }
                };

                let updated = {
                    let mut open = self.open.lock();

                    match &mut *open {
                        OpenState::Open(open_party)
                            if open_party.record.id == record.id
                                && snapshot.revision >= open_party.revision =>
                        {
                            open_party.revision = snapshot.revision;
                            open_party.record = record.clone();
                            true
                        }
                        _ => false,
                    }
                };

                if updated {
                    self.context.emit(CollabEvent::PartyUpdated { party: record });
                }
            }
            DocumentEvent::Deleted { id, .. } => {
                let previous = {
                    let mut open = self.open.lock();

                    let is_open =
                        matches!(&*open, OpenState::Open(open_party) if open_party.record.id == id);

                    if !is_open {
                        return;
                    }

                    std::mem::replace(&mut *open, OpenState::Closed)
                };

                if let OpenState::Open(open_party) = previous {
                    self.context.store.unsubscribe(&open_party.subscription).await;
                    info!("Party {} was deleted while open", open_party.record.name);
                    self.context.emit(CollabEvent::PartyClosed {
                        party_id: open_party.record.id,
                    });
                }
            }
        }
    }
}

fn require_editor(
    user: &UserRecord,
    party: &PartyRecord,
    action: &'static str,
) -> Result<(), PartyError> {
    if party.role_of(user).can_edit() {
        Ok(())
    } else {
        Err(PartyError::Permission { action })
    }
}

fn require_manager(
    user: &UserRecord,
    party: &PartyRecord,
    action: &'static str,
) -> Result<(), PartyError> {
    if party.role_of(user).can_manage() {
        Ok(())
    } else {
        Err(PartyError::Permission { action })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use headcount_impls::{LocalAuthProvider, MemoryStore};

    use crate::identity::NewAccount;
    use crate::Collab;

    use super::*;

    type TestCollab = Collab<MemoryStore, LocalAuthProvider>;

    async fn signed_up(
        store: &MemoryStore,
        auth: &LocalAuthProvider,
        email: &str,
        first_name: &str,
    ) -> (TestCollab, UserRecord) {
        let collab = TestCollab::new(store.clone(), auth.new_device());

        let user = collab
            .identity
            .sign_up(NewAccount {
                email: email.to_string(),
                password: "hunter2".to_string(),
                first_name: first_name.to_string(),
                last_name: "Tester".to_string(),
            })
            .await
            .unwrap();

        (collab, user)
    }

    fn picnic() -> NewParty {
        NewParty {
            name: "Picnic".to_string(),
            passcode: "048213".to_string(),
        }
    }

    #[tokio::test]
    async fn create_then_join_from_another_principal() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (creator, creator_user) = signed_up(&store, &auth, "sam@example.com", "Sam").await;
        let (joiner, joiner_user) = signed_up(&store, &auth, "ada@example.com", "Ada").await;

        let party = creator.parties.create(picnic()).await.unwrap();

        assert_eq!(party.creator_id, creator_user.id);
        assert_eq!(party.editors, vec![creator_user.id.clone()]);
        assert!(party.people.is_empty());
        assert_eq!(
            creator.parties.state(),
            PartyState::Open {
                party_id: party.id.clone()
            }
        );

        let joined = joiner.parties.join_by_passcode("048213").await.unwrap();

        assert_eq!(joined.id, party.id);
        assert_eq!(joined.editors, vec![creator_user.id.clone()]);
        assert!(joined.people.is_empty());

        let snapshot = store.get("users", &joiner_user.id).await.unwrap();
        assert_eq!(snapshot.data["activeParties"], serde_json::json!([party.id]));

        let error = joiner.parties.join_by_passcode("999999").await.unwrap_err();
        assert!(matches!(error, PartyError::NotFound { .. }));
    }

    #[tokio::test]
    async fn create_rejects_a_passcode_already_in_use() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (creator, _) = signed_up(&store, &auth, "sam@example.com", "Sam").await;
        let (rival, _) = signed_up(&store, &auth, "ada@example.com", "Ada").await;

        creator.parties.create(picnic()).await.unwrap();

        let error = rival
            .parties
            .create(NewParty {
                name: "Other".to_string(),
                passcode: "048213".to_string(),
            })
            .await
            .unwrap_err();

        assert!(matches!(error, PartyError::PasscodeTaken));
    }

    #[tokio::test]
    async fn create_screens_its_input() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (collab, _) = signed_up(&store, &auth, "sam@example.com", "Sam").await;

        let error = collab
            .parties
            .create(NewParty {
                name: "Picnic".to_string(),
                passcode: "12".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            PartyError::Validation(ValidationError::MalformedPasscode)
        ));

        let error = collab
            .parties
            .create(NewParty {
                name: "  ".to_string(),
                passcode: "048213".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(error, PartyError::Validation(_)));
    }

    #[tokio::test]
    async fn guests_check_people_in_but_cannot_edit() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (creator, _) = signed_up(&store, &auth, "sam@example.com", "Sam").await;
        let (guest, guest_user) = signed_up(&store, &auth, "ada@example.com", "Ada").await;

        creator.parties.create(picnic()).await.unwrap();
        guest.parties.join_by_passcode("048213").await.unwrap();

        let attendee = guest.parties.add_attendee("Grace", "Hopper").await.unwrap();

        let updated = guest.parties.set_presence(&attendee.id, true).await.unwrap();
        let entry = updated.attendee(&attendee.id).unwrap();

        assert!(entry.is_present);
        assert_eq!(entry.updated_by, Some(guest_user.id.clone()));
        assert_eq!(entry.add_method, AddMethod::Manual);

        let error = guest
            .parties
            .rename_attendee(&attendee.id, "Grace", "Murray")
            .await
            .unwrap_err();
        assert!(matches!(error, PartyError::Permission { .. }));

        let error = guest.parties.remove_attendee(&attendee.id).await.unwrap_err();
        assert!(matches!(error, PartyError::Permission { .. }));

        let error = guest.parties.set_name("Mine now").await.unwrap_err();
        assert!(matches!(error, PartyError::Permission { .. }));

        let error = guest.parties.add_editor(&guest_user.id).await.unwrap_err();
        assert!(matches!(error, PartyError::Permission { .. }));

        let error = guest
            .parties
            .import_attendees(vec![NewAttendee {
                first_name: "Rosa".to_string(),
                last_name: "Diaz".to_string(),
            }])
            .await
            .unwrap_err();
        assert!(matches!(error, PartyError::Permission { .. }));

        let party_id = creator.parties.current_party().unwrap().id;
        let error = guest.parties.delete(&party_id).await.unwrap_err();
        assert!(matches!(error, PartyError::Permission { .. }));
    }

    #[tokio::test]
    async fn editors_manage_the_roster_but_not_the_party() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (creator, creator_user) = signed_up(&store, &auth, "sam@example.com", "Sam").await;
        let (editor, editor_user) = signed_up(&store, &auth, "ada@example.com", "Ada").await;

        let party = creator.parties.create(picnic()).await.unwrap();
        let attendee = creator.parties.add_attendee("Grace", "Hopper").await.unwrap();

        creator.parties.add_editor(&editor_user.id).await.unwrap();

        // Promotion surfaces the party on the editor's record.
        let snapshot = store.get("users", &editor_user.id).await.unwrap();
        assert_eq!(
            snapshot.data["activeParties"],
            serde_json::json!([party.id])
        );

        editor.parties.open(&party.id).await.unwrap();

        editor
            .parties
            .rename_attendee(&attendee.id, "Grace", "Murray")
            .await
            .unwrap();
        editor.parties.set_name("Summer Picnic").await.unwrap();

        let snapshot = store.get("party", &party.id).await.unwrap();
        assert_eq!(snapshot.data["name"], "Summer Picnic");
        assert_eq!(snapshot.data["people"][0]["lastName"], "Murray");

        let error = editor.parties.delete(&party.id).await.unwrap_err();
        assert!(matches!(error, PartyError::Permission { .. }));

        let error = editor
            .parties
            .remove_editor(&creator_user.id)
            .await
            .unwrap_err();
        assert!(matches!(error, PartyError::CreatorImmutable));

        // Stepping down oneself is fine.
        editor.parties.remove_editor(&editor_user.id).await.unwrap();

        let snapshot = store.get("party", &party.id).await.unwrap();
        assert_eq!(
            snapshot.data["editors"],
            serde_json::json!([creator_user.id])
        );
    }

    #[tokio::test]
    async fn the_creator_cannot_be_removed_by_anyone() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (creator, creator_user) = signed_up(&store, &auth, "sam@example.com", "Sam").await;
        let (admin, admin_user) = signed_up(&store, &auth, "root@example.com", "Root").await;

        let party = creator.parties.create(picnic()).await.unwrap();

        let error = creator
            .parties
            .remove_editor(&creator_user.id)
            .await
            .unwrap_err();
        assert!(matches!(error, PartyError::CreatorImmutable));

        // Even an admin cannot.
        store
            .update_fields(
                "users",
                &admin_user.id,
                vec![FieldUpdate::set("isAdmin", true)],
            )
            .await
            .unwrap();

        // The profile subscription picks the flag up.
        for _ in 0..50 {
            if admin
                .identity
                .current_user()
                .is_some_and(|user| user.is_admin)
            {
                break;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(admin.identity.current_user().unwrap().is_admin);
        admin.parties.open(&party.id).await.unwrap();

        let error = admin
            .parties
            .remove_editor(&creator_user.id)
            .await
            .unwrap_err();
        assert!(matches!(error, PartyError::CreatorImmutable));

        // But an admin may delete the party outright.
        admin.parties.delete(&party.id).await.unwrap();
        assert!(matches!(
            store.get("party", &party.id).await.unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_presence_commits_both_survive() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (host, _) = signed_up(&store, &auth, "sam@example.com", "Sam").await;
        let (helper, _) = signed_up(&store, &auth, "ada@example.com", "Ada").await;

        let party = host.parties.create(picnic()).await.unwrap();
        let first = host.parties.add_attendee("Grace", "Hopper").await.unwrap();
        let second = host.parties.add_attendee("Sam", "Lee").await.unwrap();

        helper.parties.join_by_passcode("048213").await.unwrap();

        let left = {
            let parties = host.parties.clone();
            let attendee_id = first.id.clone();

            tokio::spawn(async move { parties.set_presence(&attendee_id, true).await })
        };
        let right = {
            let parties = helper.parties.clone();
            let attendee_id = second.id.clone();

            tokio::spawn(async move { parties.set_presence(&attendee_id, true).await })
        };

        left.await.unwrap().unwrap();
        right.await.unwrap().unwrap();

        let snapshot = store.get("party", &party.id).await.unwrap();
        let people = snapshot.data["people"].as_array().unwrap();

        assert_eq!(people.len(), 2);
        assert!(people.iter().all(|person| person["isPresent"] == true));
    }

    #[tokio::test]
    async fn imports_land_in_one_write() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (collab, _) = signed_up(&store, &auth, "sam@example.com", "Sam").await;
        let party = collab.parties.create(picnic()).await.unwrap();

        let before = store.get("party", &party.id).await.unwrap().revision;

        let imported = collab
            .parties
            .import_attendees(vec![
                NewAttendee {
                    first_name: "Grace".to_string(),
                    last_name: "Hopper".to_string(),
                },
                NewAttendee {
                    first_name: "Ada".to_string(),
                    last_name: "Byron".to_string(),
                },
            ])
            .await
            .unwrap();

        assert_eq!(imported.len(), 2);
        assert!(imported
            .iter()
            .all(|attendee| attendee.add_method == AddMethod::Imported));

        let snapshot = store.get("party", &party.id).await.unwrap();
        assert_eq!(snapshot.revision, before + 1);
        assert_eq!(snapshot.data["people"].as_array().unwrap().len(), 2);
        assert_eq!(snapshot.data["people"][0]["addMethod"], "imported");

        assert!(collab
            .parties
            .import_attendees(Vec::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn roster_mutations_bump_the_party_timestamp() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (collab, _) = signed_up(&store, &auth, "sam@example.com", "Sam").await;
        let party = collab.parties.create(picnic()).await.unwrap();

        collab.parties.add_attendee("Grace", "Hopper").await.unwrap();

        let updated = collab.parties.current_party().unwrap();
        let snapshot = store.get("party", &party.id).await.unwrap();
        let record = PartyRecord::from_snapshot(&snapshot).unwrap();

        assert!(record.updated_at > record.created_at);
        assert_eq!(updated.created_at, party.created_at);
    }

    #[tokio::test]
    async fn the_open_handle_walks_its_lifecycle() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (collab, _) = signed_up(&store, &auth, "sam@example.com", "Sam").await;

        assert_eq!(collab.parties.state(), PartyState::Unopened);
        assert!(matches!(
            collab.parties.search("x").unwrap_err(),
            PartyError::NotOpen
        ));

        let party = collab.parties.create(picnic()).await.unwrap();
        assert_eq!(
            collab.parties.state(),
            PartyState::Open {
                party_id: party.id.clone()
            }
        );

        // Opening another party supplants the first.
        let second = collab
            .parties
            .create(NewParty {
                name: "Brunch".to_string(),
                passcode: "111111".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            collab.parties.state(),
            PartyState::Open {
                party_id: second.id.clone()
            }
        );

        collab.parties.close().await;
        assert_eq!(collab.parties.state(), PartyState::Closed);
        assert!(collab.parties.current_party().is_none());

        collab.parties.close().await;
        assert_eq!(collab.parties.state(), PartyState::Closed);

        collab.parties.open(&party.id).await.unwrap();
        assert_eq!(collab.parties.state(), PartyState::Open { party_id: party.id });
    }

    #[tokio::test]
    async fn deleting_the_open_party_closes_and_untracks_it() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (collab, user) = signed_up(&store, &auth, "sam@example.com", "Sam").await;
        let party = collab.parties.create(picnic()).await.unwrap();

        collab.parties.delete(&party.id).await.unwrap();

        assert_eq!(collab.parties.state(), PartyState::Closed);
        assert!(matches!(
            store.get("party", &party.id).await.unwrap_err(),
            StoreError::NotFound { .. }
        ));

        // The reconciler notices the deletion and drops the reference.
        let mut cleared = false;

        for _ in 0..50 {
            let snapshot = store.get("users", &user.id).await.unwrap();

            if snapshot.data["activeParties"] == serde_json::json!([]) {
                cleared = true;
                break;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(cleared);
    }

    #[tokio::test]
    async fn leaving_steps_down_and_stops_tracking() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (creator, _) = signed_up(&store, &auth, "sam@example.com", "Sam").await;
        let (editor, editor_user) = signed_up(&store, &auth, "ada@example.com", "Ada").await;

        let party = creator.parties.create(picnic()).await.unwrap();
        creator.parties.add_editor(&editor_user.id).await.unwrap();

        editor.parties.open(&party.id).await.unwrap();
        editor.parties.leave().await.unwrap();

        assert_eq!(editor.parties.state(), PartyState::Closed);

        let snapshot = store.get("party", &party.id).await.unwrap();
        assert!(!snapshot.data["editors"]
            .as_array()
            .unwrap()
            .contains(&serde_json::json!(editor_user.id)));

        let snapshot = store.get("users", &editor_user.id).await.unwrap();
        assert_eq!(snapshot.data["activeParties"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn search_finds_an_attendee_added_elsewhere() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (host, _) = signed_up(&store, &auth, "sam@example.com", "Sam").await;
        let (helper, _) = signed_up(&store, &auth, "ada@example.com", "Ada").await;

        let party = host.parties.create(picnic()).await.unwrap();
        helper.parties.open(&party.id).await.unwrap();

        let added = helper.parties.add_attendee("Grace", "Hopper").await.unwrap();

        // The roster reaches the host through the party subscription.
        let mut synced = false;

        for _ in 0..50 {
            let arrived = host
                .parties
                .current_party()
                .map(|party| !party.people.is_empty())
                .unwrap_or(false);

            if arrived {
                synced = true;
                break;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(synced);

        let hits = host.parties.search("gRaCe").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, added.id);
        assert_eq!(hits[0].full_name(), "Grace Hopper");

        assert!(host.parties.search("zzz").unwrap().is_empty());
    }
}
