use crossbeam::channel::unbounded;
use std::sync::Arc;

use headcount_core::{AuthProvider, SessionStore};

mod events;
mod identity;
mod party;
mod reconcile;
mod records;
mod util;
mod validation;

pub use events::*;
pub use identity::*;
pub use party::*;
pub use records::*;
pub use validation::*;

use reconcile::spawn_reconciler_thread;

/// The headcount collab system, facilitating identity, party management, and
/// live state sync.
pub struct Collab<S, A> {
    pub identity: Arc<IdentityManager<S, A>>,
    pub parties: Arc<PartyManager<S, A>>,

    event_receiver: EventReceiver,
}

/// A type passed to the managers of the collab system, to access the backing
/// services, emit events, and dispatch actions.
pub struct CollabContext<S, A> {
    pub store: Arc<S>,
    pub auth: Arc<A>,

    action_sender: ActionSender,
    event_sender: EventSender,
}

impl<S, A> Collab<S, A>
where
    S: SessionStore,
    A: AuthProvider,
{
    pub fn new(store: S, auth: A) -> Self {
        let (action_sender, action_receiver) = unbounded();
        let (event_sender, event_receiver) = unbounded();

        let context = CollabContext {
            store: Arc::new(store),
            auth: Arc::new(auth),

            action_sender,
            event_sender,
        };

        let identity = Arc::new(IdentityManager::new(&context));
        let parties = Arc::new(PartyManager::new(&context, &identity));

        identity.watch_provider();
        spawn_reconciler_thread(
            Arc::downgrade(&identity),
            Arc::downgrade(&parties),
            action_receiver,
        );

        Self {
            identity,
            parties,
            event_receiver,
        }
    }

    /// Receive events from the collab system.
    pub fn wait_for_event(&self) -> CollabEvent {
        self.event_receiver
            .recv()
            .expect("event is received without error")
    }

    /// End the session on this device, closing whatever party is open.
    pub async fn sign_out(&self) {
        self.parties.close().await;
        self.identity.sign_out().await;
    }
}

impl<S, A> CollabContext<S, A>
where
    S: SessionStore,
    A: AuthProvider,
{
    pub(crate) fn emit(&self, event: CollabEvent) {
        // A late event after the facade is gone has nobody listening.
        self.event_sender.send(event).ok();
    }

    pub(crate) fn actions(&self) -> ActionSender {
        self.action_sender.clone()
    }
}

impl<S, A> Clone for CollabContext<S, A>
where
    S: SessionStore,
    A: AuthProvider,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            auth: self.auth.clone(),
            action_sender: self.action_sender.clone(),
            event_sender: self.event_sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use headcount_core::{Credential, StoreError};
    use headcount_impls::{LocalAuthProvider, MemoryStore};

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

    fn next_event(collab: &TestCollab) -> CollabEvent {
        collab
            .event_receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("an event arrives in time")
    }

    #[tokio::test]
    async fn a_party_syncs_across_devices() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (host, _) = signed_up(&store, &auth, "sam@example.com", "Sam").await;
        let (guest, _) = signed_up(&store, &auth, "ada@example.com", "Ada").await;

        let party = host
            .parties
            .create(NewParty {
                name: "Picnic".to_string(),
                passcode: "048213".to_string(),
            })
            .await
            .unwrap();

        let joined = guest.parties.join_by_passcode("048213").await.unwrap();
        assert_eq!(joined.id, party.id);

        guest.parties.add_attendee("Grace", "Hopper").await.unwrap();

        // The host hears about the new attendee through its own subscription.
        let updated = loop {
            match next_event(&host) {
                CollabEvent::PartyUpdated { party: updated } if !updated.people.is_empty() => {
                    break updated
                }
                _ => {}
            }
        };

        assert_eq!(updated.people.len(), 1);
        assert_eq!(updated.people[0].full_name(), "Grace Hopper");
        assert!(!updated.people[0].is_present);
        assert!(updated.updated_at > updated.created_at);

        assert!(guest
            .identity
            .visible_parties()
            .iter()
            .any(|visible| visible.id == party.id));
    }

    #[tokio::test]
    async fn deleting_a_party_reaches_every_device() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (host, _) = signed_up(&store, &auth, "sam@example.com", "Sam").await;
        let (guest, guest_user) = signed_up(&store, &auth, "ada@example.com", "Ada").await;

        let party = host
            .parties
            .create(NewParty {
                name: "Picnic".to_string(),
                passcode: "048213".to_string(),
            })
            .await
            .unwrap();

        guest.parties.join_by_passcode("048213").await.unwrap();
        host.parties.delete(&party.id).await.unwrap();

        assert_eq!(host.parties.state(), PartyState::Closed);

        // The guest's device closes its handle and drops the party from its
        // visible set, in whichever order the deliveries land.
        let mut closed = false;
        let mut visible_cleared = false;

        while !(closed && visible_cleared) {
            match next_event(&guest) {
                CollabEvent::PartyClosed { party_id } if party_id == party.id => closed = true,
                CollabEvent::VisiblePartiesUpdated { parties } if parties.is_empty() => {
                    visible_cleared = true
                }
                _ => {}
            }
        }

        assert_eq!(guest.parties.state(), PartyState::Closed);
        assert!(guest.identity.visible_parties().is_empty());

        let snapshot = store.get("users", &guest_user.id).await.unwrap();
        assert_eq!(snapshot.data["activeParties"], serde_json::json!([]));

        assert!(matches!(
            store.get("party", &party.id).await.unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn signing_out_closes_the_session() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (collab, _) = signed_up(&store, &auth, "sam@example.com", "Sam").await;

        collab
            .parties
            .create(NewParty {
                name: "Picnic".to_string(),
                passcode: "048213".to_string(),
            })
            .await
            .unwrap();

        collab.sign_out().await;

        assert!(!collab.identity.is_signed_in());
        assert!(collab.identity.visible_parties().is_empty());
        assert_eq!(collab.parties.state(), PartyState::Closed);
        assert!(collab.identity.current_user().is_none());

        // The provider session ended too, so a restore has nothing to do.
        let error = collab.identity.resume_session().await.unwrap_err();
        assert!(matches!(error, IdentityError::NotSignedIn));
    }

    #[tokio::test]
    async fn deleting_the_account_closes_the_open_party() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (host, _) = signed_up(&store, &auth, "sam@example.com", "Sam").await;
        let (guest, _) = signed_up(&store, &auth, "ada@example.com", "Ada").await;

        host.parties
            .create(NewParty {
                name: "Picnic".to_string(),
                passcode: "048213".to_string(),
            })
            .await
            .unwrap();

        guest.parties.join_by_passcode("048213").await.unwrap();
        assert!(matches!(guest.parties.state(), PartyState::Open { .. }));

        guest
            .identity
            .delete_account(Some(Credential::Password {
                email: "ada@example.com".to_string(),
                password: "hunter2".to_string(),
            }))
            .await
            .unwrap();

        assert!(!guest.identity.is_signed_in());

        // The sign-out that removing the account triggers reaches the open
        // party through the reconciler.
        let mut closed = false;

        for _ in 0..50 {
            if guest.parties.state() == PartyState::Closed {
                closed = true;
                break;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(closed);
        assert!(matches!(host.parties.state(), PartyState::Open { .. }));
    }

    #[tokio::test]
    async fn dropping_the_facade_releases_the_managers() {
        let store = MemoryStore::new();
        let auth = LocalAuthProvider::new();

        let (collab, _) = signed_up(&store, &auth, "sam@example.com", "Sam").await;

        let identity = Arc::downgrade(&collab.identity);
        let parties = Arc::downgrade(&collab.parties);

        drop(collab);

        // The reconciler holds the managers only while applying an action,
        // so the weak handles expire once the facade is gone.
        let mut released = false;

        for _ in 0..50 {
            if identity.upgrade().is_none() && parties.upgrade().is_none() {
                released = true;
                break;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(released);
    }
}
