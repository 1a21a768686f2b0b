use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use headcount_core::{
    AuthMethod, AuthProvider, Credential, DocumentEvent, FieldUpdate, Filter, ProviderError,
    Revision, SessionState, SessionStore, StoreError, SubscriptionHandle,
};

use crate::events::{CollabEvent, ReconcileAction};
use crate::records::{PartyId, PartyRecord, Record, UserRecord};
use crate::validation::{self, ValidationError};
use crate::CollabContext;

/// How long a joined party stays visible after its last update. Parties the
/// principal edits never age out.
const VISIBILITY_WINDOW_IN_DAYS: i64 = 3;

/// Owns the authenticated principal: their user record, their linked sign-in
/// methods, and the index of visible parties with its subscriptions.
pub struct IdentityManager<S, A> {
    context: CollabContext<S, A>,
    session: Mutex<Option<UserRecord>>,
    visible: Mutex<HashMap<PartyId, VisibleParty>>,
    party_subscriptions: DashMap<PartyId, SubscriptionHandle>,
    user_subscription: Mutex<Option<SubscriptionHandle>>,
    /// Serializes session starts and ends, so a provider event the
    /// reconciler replays cannot interleave with one in progress.
    transitions: AsyncMutex<()>,
}

struct VisibleParty {
    revision: Revision,
    record: PartyRecord,
}

/// New account details for [`IdentityManager::sign_up`].
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

/// Profile changes. Only the fields that are present are touched.
#[derive(Debug, Clone, Default)]
pub struct UpdatedProfile {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

struct ProfileSeed {
    email: String,
    first_name: String,
    last_name: String,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("No principal is signed in")]
    NotSignedIn,
    #[error("An account must keep at least one sign-in method")]
    LastMethod,
    #[error("A freshly verified credential is required")]
    ReauthRequired,
    #[error("The session could not be restored: {0}")]
    SessionRestore(StoreError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Provider(ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ProviderError> for IdentityError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::InvalidCredentials => Self::InvalidCredentials,
            ProviderError::NotSignedIn => Self::NotSignedIn,
            error => Self::Provider(error),
        }
    }
}

impl<S, A> IdentityManager<S, A>
where
    S: SessionStore,
    A: AuthProvider,
{
    pub fn new(context: &CollabContext<S, A>) -> Self {
        Self {
            context: context.clone(),
            session: Mutex::new(None),
            visible: Mutex::new(HashMap::new()),
            party_subscriptions: DashMap::new(),
            user_subscription: Mutex::new(None),
            transitions: AsyncMutex::new(()),
        }
    }

    /// Forward provider session changes into the reconciliation queue.
    pub(crate) fn watch_provider(&self) {
        let sender = self.context.actions();

        self.context.auth.on_session_change(Arc::new(move |state| {
            sender.send(ReconcileAction::AuthStateChanged(state)).ok();
        }));
    }

    pub fn is_signed_in(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn current_user(&self) -> Option<UserRecord> {
        self.session.lock().clone()
    }

    /// The visible parties, most recently active first.
    pub fn visible_parties(&self) -> Vec<PartyRecord> {
        let mut parties: Vec<PartyRecord> = self
            .visible
            .lock()
            .values()
            .map(|visible| visible.record.clone())
            .collect();

        parties.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        parties
    }

    /// Restore the session for the provider's current principal, if any.
    pub async fn resume_session(&self) -> Result<UserRecord, IdentityError> {
        let _transition = self.transitions.lock().await;

        let principal = self
            .context
            .auth
            .current_principal()
            .ok_or(IdentityError::NotSignedIn)?;

        self.establish_session(&principal, None, true).await
    }

    pub async fn sign_up(&self, new_account: NewAccount) -> Result<UserRecord, IdentityError> {
        validation::email(&new_account.email)?;
        validation::required("password", &new_account.password)?;
        validation::name("first name", &new_account.first_name)?;
        validation::name("last name", &new_account.last_name)?;

        let email = new_account.email.trim().to_string();

        // Held across the provider call, so the session event it fires
        // cannot be adopted ahead of the seeded establishment below.
        let _transition = self.transitions.lock().await;

        let principal = self
            .context
            .auth
            .register(Credential::Password {
                email: email.clone(),
                password: new_account.password.clone(),
            })
            .await?;

        let seed = ProfileSeed {
            email,
            first_name: new_account.first_name.trim().to_string(),
            last_name: new_account.last_name.trim().to_string(),
        };

        self.establish_session(&principal, Some(seed), false).await
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<UserRecord, IdentityError> {
        validation::email(email)?;
        validation::required("password", password)?;

        let _transition = self.transitions.lock().await;

        let principal = self
            .context
            .auth
            .verify(Credential::Password {
                email: email.trim().to_string(),
                password: password.to_string(),
            })
            .await?;

        let seed = ProfileSeed {
            email: email.trim().to_string(),
            first_name: String::new(),
            last_name: String::new(),
        };

        self.establish_session(&principal, Some(seed), false).await
    }

    /// Sign in with an assertion from a federated identity provider.
    pub async fn sign_in_with_provider(
        &self,
        method: AuthMethod,
        assertion: &str,
    ) -> Result<UserRecord, IdentityError> {
        validation::required("assertion", assertion)?;

        let _transition = self.transitions.lock().await;

        let principal = self
            .context
            .auth
            .verify(Credential::Federated {
                method,
                assertion: assertion.to_string(),
            })
            .await?;

        self.establish_session(&principal, None, false).await
    }

    /// Attach a federated sign-in method to the current account.
    pub async fn link_provider(
        &self,
        method: AuthMethod,
        assertion: &str,
    ) -> Result<UserRecord, IdentityError> {
        validation::required("assertion", assertion)?;

        let mut user = self.current_user().ok_or(IdentityError::NotSignedIn)?;

        self.context
            .auth
            .link(
                &user.id,
                Credential::Federated {
                    method,
                    assertion: assertion.to_string(),
                },
            )
            .await?;

        self.sync_auth_methods(&mut user).await?;
        self.store_session_record(user.clone());

        info!("Linked {} to {}", method, user.email);
        Ok(user)
    }

    /// Detach a sign-in method. At least one method must remain, and removing
    /// the password method requires re-proving the credential.
    pub async fn unlink_method(
        &self,
        method: AuthMethod,
        reauth: Option<Credential>,
    ) -> Result<UserRecord, IdentityError> {
        let mut user = self.current_user().ok_or(IdentityError::NotSignedIn)?;

        let linked = self.context.auth.linked_methods(&user.id).await?;

        if !linked.contains(&method) {
            return Err(ProviderError::MethodNotLinked(method).into());
        }

        if linked.len() <= 1 {
            return Err(IdentityError::LastMethod);
        }

        if method == AuthMethod::Password {
            self.reverify(&user.id, reauth).await?;
        }

        self.context.auth.unlink(&user.id, method).await?;
        self.sync_auth_methods(&mut user).await?;
        self.store_session_record(user.clone());

        info!("Unlinked {} from {}", method, user.email);
        Ok(user)
    }

    pub async fn update_profile(
        &self,
        profile: UpdatedProfile,
    ) -> Result<UserRecord, IdentityError> {
        let mut user = self.current_user().ok_or(IdentityError::NotSignedIn)?;
        let mut updates = Vec::new();

        if let Some(first_name) = profile.first_name {
            validation::name("first name", &first_name)?;

            let first_name = first_name.trim().to_string();
            updates.push(FieldUpdate::set("firstName", first_name.clone()));
            user.first_name = first_name;
        }

        if let Some(last_name) = profile.last_name {
            validation::name("last name", &last_name)?;

            let last_name = last_name.trim().to_string();
            updates.push(FieldUpdate::set("lastName", last_name.clone()));
            user.last_name = last_name;
        }

        if updates.is_empty() {
            return Ok(user);
        }

        self.context
            .store
            .update_fields(UserRecord::COLLECTION, &user.id, updates)
            .await?;

        self.store_session_record(user.clone());
        Ok(user)
    }

    /// Track a party in the principal's visible set. Safe to repeat.
    pub async fn add_party_to_visible(&self, party_id: &str) -> Result<(), IdentityError> {
        validation::identifier("party id", party_id)?;

        let user = self.current_user().ok_or(IdentityError::NotSignedIn)?;

        let snapshot = self
            .context
            .store
            .get(PartyRecord::COLLECTION, party_id)
            .await?;
        let record = PartyRecord::from_snapshot(&snapshot)?;

        self.context
            .store
            .update_fields(
                UserRecord::COLLECTION,
                &user.id,
                vec![FieldUpdate::union(
                    "activeParties",
                    vec![Value::from(party_id)],
                )],
            )
            .await?;

        self.subscribe_to_party(party_id).await?;

        self.visible.lock().insert(
            record.id.clone(),
            VisibleParty {
                revision: snapshot.revision,
                record,
            },
        );

        self.emit_visible_parties();
        Ok(())
    }

    /// Stop tracking a party: drop it from the principal's record and tear
    /// down its subscription. Safe to repeat.
    pub async fn remove_party_from_visible(&self, party_id: &str) -> Result<(), IdentityError> {
        validation::identifier("party id", party_id)?;

        let user = self.current_user().ok_or(IdentityError::NotSignedIn)?;

        self.context
            .store
            .update_fields(
                UserRecord::COLLECTION,
                &user.id,
                vec![FieldUpdate::remove(
                    "activeParties",
                    vec![Value::from(party_id)],
                )],
            )
            .await?;

        if let Some((_, handle)) = self.party_subscriptions.remove(party_id) {
            self.context.store.unsubscribe(&handle).await;
        }

        if self.visible.lock().remove(party_id).is_some() {
            self.emit_visible_parties();
        }

        Ok(())
    }

    /// Put a party in another principal's visible set, as when making them
    /// an editor.
    pub async fn grant_visibility(
        &self,
        principal: &str,
        party_id: &str,
    ) -> Result<(), IdentityError> {
        validation::identifier("user id", principal)?;
        validation::identifier("party id", party_id)?;

        self.context
            .store
            .update_fields(
                UserRecord::COLLECTION,
                principal,
                vec![FieldUpdate::union(
                    "activeParties",
                    vec![Value::from(party_id)],
                )],
            )
            .await?;

        Ok(())
    }

    /// Delete the account and everything it owns. Parties the principal
    /// created are removed, their editor entries elsewhere are revoked, and
    /// only then do the user record and the provider account go away.
    pub async fn delete_account(&self, reauth: Option<Credential>) -> Result<(), IdentityError> {
        let _transition = self.transitions.lock().await;

        let user = self.current_user().ok_or(IdentityError::NotSignedIn)?;

        let linked = self.context.auth.linked_methods(&user.id).await?;

        if linked.contains(&AuthMethod::Password) {
            self.reverify(&user.id, reauth).await?;
        }

        let store = &self.context.store;

        let created = store
            .query(
                PartyRecord::COLLECTION,
                Filter::field_equals("creatorId", user.id.clone()),
            )
            .await?;

        for snapshot in created {
            store.delete(PartyRecord::COLLECTION, &snapshot.id).await?;
        }

        let editing = store
            .query(
                PartyRecord::COLLECTION,
                Filter::array_contains("editors", user.id.clone()),
            )
            .await?;

        for snapshot in editing {
            store
                .update_fields(
                    PartyRecord::COLLECTION,
                    &snapshot.id,
                    vec![FieldUpdate::remove(
                        "editors",
                        vec![Value::from(user.id.clone())],
                    )],
                )
                .await?;
        }

        store.delete(UserRecord::COLLECTION, &user.id).await?;
        self.context.auth.remove_account(&user.id).await?;

        info!("Deleted the account of {}", user.email);
        self.teardown(true).await;
        Ok(())
    }

    /// End the session. Safe to call when already signed out.
    pub async fn sign_out(&self) {
        let _transition = self.transitions.lock().await;

        self.context.auth.sign_out().await;
        self.teardown(true).await;
    }

    async fn establish_session(
        &self,
        principal: &str,
        seed: Option<ProfileSeed>,
        resuming: bool,
    ) -> Result<UserRecord, IdentityError> {
        let result = self.establish_session_inner(principal, seed, resuming).await;

        match result {
            // Resume promises a distinct error when the backing record
            // cannot be read, so the UI can offer a retry.
            Err(IdentityError::Store(source)) if resuming => {
                Err(IdentityError::SessionRestore(source))
            }
            other => other,
        }
    }

    async fn establish_session_inner(
        &self,
        principal: &str,
        seed: Option<ProfileSeed>,
        resuming: bool,
    ) -> Result<UserRecord, IdentityError> {
        let switching = self
            .session
            .lock()
            .as_ref()
            .map(|user| user.id != principal)
            .unwrap_or(false);

        // A session for another principal is replaced, never merged.
        if switching {
            self.teardown(true).await;
        }

        let mut user = self.load_or_create_user(principal, seed).await?;

        // Linked methods drift when another device changes them while this
        // one is away.
        if let Err(error) = self.sync_auth_methods(&mut user).await {
            if resuming {
                return Err(error);
            }

            warn!("Failed to refresh linked sign-in methods: {}", error);
        }

        *self.session.lock() = Some(user.clone());
        self.context
            .emit(CollabEvent::SessionStarted { user: user.clone() });

        let wired = async {
            self.subscribe_to_user(&user.id).await?;
            self.reconcile_visibility(&user).await?;
            Ok::<(), IdentityError>(())
        }
        .await;

        if let Err(error) = wired {
            self.teardown(true).await;
            return Err(error);
        }

        info!("Session established for {}", user.email);
        Ok(user)
    }

    async fn load_or_create_user(
        &self,
        principal: &str,
        seed: Option<ProfileSeed>,
    ) -> Result<UserRecord, IdentityError> {
        match self.context.store.get(UserRecord::COLLECTION, principal).await {
            Ok(snapshot) => Ok(UserRecord::from_snapshot(&snapshot)?),
            Err(StoreError::NotFound { .. }) => self.create_user_record(principal, seed).await,
            Err(error) => Err(error.into()),
        }
    }

    async fn create_user_record(
        &self,
        principal: &str,
        seed: Option<ProfileSeed>,
    ) -> Result<UserRecord, IdentityError> {
        let seed = match seed {
            Some(seed) => seed,
            None => {
                let email = self
                    .context
                    .auth
                    .account_email(principal)
                    .await?
                    .unwrap_or_default();

                ProfileSeed {
                    email,
                    first_name: String::new(),
                    last_name: String::new(),
                }
            }
        };

        let record = UserRecord {
            id: principal.to_string(),
            email: seed.email,
            first_name: seed.first_name,
            last_name: seed.last_name,
            is_admin: false,
            active_parties: Vec::new(),
            auth_providers: Vec::new(),
        };

        match self
            .context
            .store
            .create(UserRecord::COLLECTION, principal, record.to_value())
            .await
        {
            Ok(_) => {
                info!("Created a user record for {}", record.email);
                Ok(record)
            }
            // Another device created it in the meantime.
            Err(StoreError::Conflict { .. }) => {
                let snapshot = self
                    .context
                    .store
                    .get(UserRecord::COLLECTION, principal)
                    .await?;

                Ok(UserRecord::from_snapshot(&snapshot)?)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Persist the provider's linked methods onto the user record when the
    /// two disagree. The provider is the ground truth.
    async fn sync_auth_methods(&self, user: &mut UserRecord) -> Result<(), IdentityError> {
        let methods = self.context.auth.linked_methods(&user.id).await?;

        let mut tags: Vec<String> = methods
            .iter()
            .map(|method| method.tag().to_string())
            .collect();
        tags.sort();
        tags.dedup();

        let mut current = user.auth_providers.clone();
        current.sort();

        if current == tags {
            return Ok(());
        }

        self.context
            .store
            .update_fields(
                UserRecord::COLLECTION,
                &user.id,
                vec![FieldUpdate::set("authProviders", tags.clone())],
            )
            .await?;

        user.auth_providers = tags;
        Ok(())
    }

    /// Confirm the caller holds the account's password credential right now.
    async fn reverify(
        &self,
        principal: &str,
        reauth: Option<Credential>,
    ) -> Result<(), IdentityError> {
        let credential = reauth.ok_or(IdentityError::ReauthRequired)?;

        self.context
            .auth
            .reauthenticate(principal, credential)
            .await?;

        Ok(())
    }

    async fn subscribe_to_user(&self, principal: &str) -> Result<(), IdentityError> {
        let subscribed = self
            .user_subscription
            .lock()
            .as_ref()
            .map(|handle| handle.document_id.clone());

        // Already following this principal's record. A subscription left
        // over from another account gets replaced below.
        if subscribed.as_deref() == Some(principal) {
            return Ok(());
        }

        let sender = self.context.actions();

        let handle = self
            .context
            .store
            .subscribe(
                UserRecord::COLLECTION,
                principal,
                Arc::new(move |event| {
                    sender.send(ReconcileAction::UserDocument(event)).ok();
                }),
            )
            .await?;

        let previous = self.user_subscription.lock().replace(handle);

        if let Some(stale) = previous {
            self.context.store.unsubscribe(&stale).await;
        }

        Ok(())
    }

    async fn subscribe_to_party(&self, party_id: &str) -> Result<(), IdentityError> {
        if self.party_subscriptions.contains_key(party_id) {
            return Ok(());
        }

        let sender = self.context.actions();

        let handle = self
            .context
            .store
            .subscribe(
                PartyRecord::COLLECTION,
                party_id,
                Arc::new(move |event| {
                    sender.send(ReconcileAction::VisibleParty(event)).ok();
                }),
            )
            .await?;

        if let Some(previous) = self.party_subscriptions.insert(party_id.to_string(), handle) {
            self.context.store.unsubscribe(&previous).await;
        }

        Ok(())
    }

    /// Recompute the visible set from the store and align the subscriptions
    /// with it.
    async fn reconcile_visibility(&self, user: &UserRecord) -> Result<(), IdentityError> {
        let parties = self.fetch_visible_parties(user).await?;
        let wanted: HashSet<PartyId> = parties.keys().cloned().collect();

        for party_id in &wanted {
            self.subscribe_to_party(party_id).await?;
        }

        let stale: Vec<(PartyId, SubscriptionHandle)> = self
            .party_subscriptions
            .iter()
            .filter(|entry| !wanted.contains(entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (party_id, handle) in stale {
            self.party_subscriptions.remove(&party_id);
            self.context.store.unsubscribe(&handle).await;
        }

        *self.visible.lock() = parties;
        self.emit_visible_parties();
        Ok(())
    }

    async fn fetch_visible_parties(
        &self,
        user: &UserRecord,
    ) -> Result<HashMap<PartyId, VisibleParty>, IdentityError> {
        let store = &self.context.store;
        let mut parties = HashMap::new();

        // Admins see everything there is.
        if user.is_admin {
            for snapshot in store.list(PartyRecord::COLLECTION).await? {
                match PartyRecord::from_snapshot(&snapshot) {
                    Ok(record) => {
                        parties.insert(
                            record.id.clone(),
                            VisibleParty {
                                revision: snapshot.revision,
                                record,
                            },
                        );
                    }
                    Err(error) => warn!("Skipping an undecodable party document: {}", error),
                }
            }

            return Ok(parties);
        }

        // Parties the principal edits are always visible.
        let editing = store
            .query(
                PartyRecord::COLLECTION,
                Filter::array_contains("editors", user.id.clone()),
            )
            .await?;

        for snapshot in editing {
            match PartyRecord::from_snapshot(&snapshot) {
                Ok(record) => {
                    parties.insert(
                        record.id.clone(),
                        VisibleParty {
                            revision: snapshot.revision,
                            record,
                        },
                    );
                }
                Err(error) => warn!("Skipping an undecodable party document: {}", error),
            }
        }

        // Joined parties stay visible while they are recently active.
        let now = Utc::now();

        for party_id in &user.active_parties {
            if parties.contains_key(party_id) {
                continue;
            }

            let snapshot = match store.get(PartyRecord::COLLECTION, party_id).await {
                Ok(snapshot) => snapshot,
                Err(StoreError::NotFound { .. }) => {
                    self.remove_active_party_reference(&user.id, party_id).await;
                    continue;
                }
                Err(error) => return Err(error.into()),
            };

            let record = match PartyRecord::from_snapshot(&snapshot) {
                Ok(record) => record,
                Err(error) => {
                    warn!("Skipping an undecodable party document: {}", error);
                    continue;
                }
            };

            if record.was_active_within(VISIBILITY_WINDOW_IN_DAYS, now) {
                parties.insert(
                    record.id.clone(),
                    VisibleParty {
                        revision: snapshot.revision,
                        record,
                    },
                );
            }
        }

        Ok(parties)
    }

    /// Best effort; a failure here is retried at the next recompute.
    async fn remove_active_party_reference(&self, principal: &str, party_id: &str) {
        let update = FieldUpdate::remove("activeParties", vec![Value::from(party_id)]);

        let result = self
            .context
            .store
            .update_fields(UserRecord::COLLECTION, principal, vec![update])
            .await;

        if let Err(error) = result {
            warn!("Failed to drop a stale party reference: {}", error);
        }
    }

    fn store_session_record(&self, user: UserRecord) {
        let mut session = self.session.lock();

        let same_principal = session
            .as_ref()
            .map(|current| current.id == user.id)
            .unwrap_or(false);

        if same_principal {
            *session = Some(user);
        }
    }

    fn emit_visible_parties(&self) {
        self.context.emit(CollabEvent::VisiblePartiesUpdated {
            parties: self.visible_parties(),
        });
    }

    async fn teardown(&self, announce: bool) {
        let was_signed_in = self.session.lock().take().is_some();

        let user_subscription = self.user_subscription.lock().take();

        if let Some(handle) = user_subscription {
            self.context.store.unsubscribe(&handle).await;
        }

        let handles: Vec<SubscriptionHandle> = self
            .party_subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        self.party_subscriptions.clear();

        for handle in &handles {
            self.context.store.unsubscribe(handle).await;
        }

        self.visible.lock().clear();

        if announce && was_signed_in {
            info!("Session ended");
            self.context.emit(CollabEvent::SessionEnded);
        }
    }

    pub(crate) async fn apply_auth_state(&self, state: SessionState) {
        let _transition = self.transitions.lock().await;

        match state {
            SessionState::SignedOut => {
                // Skip when a newer sign-in superseded the queued event.
                if self.context.auth.current_principal().is_some() {
                    return;
                }

                self.teardown(true).await;
            }
            SessionState::SignedIn(principal) => {
                let current = self
                    .session
                    .lock()
                    .as_ref()
                    .map(|user| user.id.clone());

                if current.as_deref() == Some(principal.as_str()) {
                    return;
                }

                // The provider moved on while this event sat in the queue.
                if self.context.auth.current_principal().as_deref() != Some(principal.as_str()) {
                    return;
                }

                // A sign-in happened outside the managers, e.g. directly
                // against the provider. Adopt it.
                if let Err(error) = self.establish_session_inner(&principal, None, true).await {
                    warn!("Failed to adopt a provider sign-in: {}", error);
                }
            }
        }
    }

    pub(crate) async fn apply_user_document(&self, event: DocumentEvent) {
        let _transition = self.transitions.lock().await;

        match event {
            DocumentEvent::Updated(snapshot) => {
                let record = match UserRecord::from_snapshot(&snapshot) {
                    Ok(record) => record,
                    Err(error) => {
                        warn!("Ignoring an undecodable user snapshot: {}", error);
                        return;
                    }
                };

                let relevant = self
                    .session
                    .lock()
                    .as_ref()
                    .map(|user| user.id == record.id)
                    .unwrap_or(false);

                if !relevant {
                    return;
                }

                *self.session.lock() = Some(record.clone());
                self.context
                    .emit(CollabEvent::ProfileUpdated { user: record.clone() });

                if let Err(error) = self.reconcile_visibility(&record).await {
                    warn!("Failed to refresh the visible parties: {}", error);
                }
            }
            DocumentEvent::Deleted { id, .. } => {
                let relevant = self
                    .session
                    .lock()
                    .as_ref()
                    .map(|user| user.id == id)
                    .unwrap_or(false);

                // The account's record is gone; the session cannot continue.
                if relevant {
                    self.teardown(true).await;
                }
            }
        }
    }

    pub(crate) async fn apply_visible_party(&self, event: DocumentEvent) {
        match event {
            DocumentEvent::Updated(snapshot) => {
                let record = match PartyRecord::from_snapshot(&snapshot) {
                    Ok(record) => record,
                    Err(error) => {
                        warn!("Ignoring an undecodable party snapshot: {}", error);
                        return;
                    }
                };

                {
                    let mut visible = self.visible.lock();

                    let Some(entry) = visible.get_mut(&record.id) else {
                        return;
                    };

                    // Drop deliveries that arrive out of order.
                    if snapshot.revision < entry.revision {
                        return;
                    }

                    entry.revision = snapshot.revision;
                    entry.record = record;
                }

                self.emit_visible_parties();
            }
            DocumentEvent::Deleted { id, .. } => {
                if let Some((_, handle)) = self.party_subscriptions.remove(&id) {
                    self.context.store.unsubscribe(&handle).await;
                }

                let removed = self.visible.lock().remove(&id).is_some();

                // Drop the dangling reference from the principal's record.
                let tracking = self
                    .session
                    .lock()
                    .as_ref()
                    .filter(|user| user.active_parties.iter().any(|party| *party == id))
                    .map(|user| user.id.clone());

                if let Some(principal) = tracking {
                    self.remove_active_party_reference(&principal, &id).await;
                }

                if removed {
                    self.emit_visible_parties();
                }
            }
        }
    }
}
