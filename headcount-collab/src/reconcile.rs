use std::sync::Weak;
use std::thread;

use headcount_core::{get_or_create_handle, AuthProvider, SessionStore};

use crate::events::{ActionReceiver, ReconcileAction};
use crate::identity::IdentityManager;
use crate::party::PartyManager;

/// Applies auth transitions and document deliveries in arrival order, so the
/// managers never observe them interleaved.
///
/// The thread holds the managers weakly. It keeps them alive only for the
/// action in hand and ends as soon as the facade that owns them is gone.
pub(crate) fn spawn_reconciler_thread<S, A>(
    identity: Weak<IdentityManager<S, A>>,
    parties: Weak<PartyManager<S, A>>,
    receiver: ActionReceiver,
) where
    S: SessionStore,
    A: AuthProvider,
{
    let handle = get_or_create_handle();

    let run = move || loop {
        let action = match receiver.recv() {
            Ok(action) => action,
            // Every sender is gone, so nothing can arrive anymore.
            Err(_) => break,
        };

        let (identity, parties) = match (identity.upgrade(), parties.upgrade()) {
            (Some(identity), Some(parties)) => (identity, parties),
            _ => break,
        };

        match action {
            ReconcileAction::AuthStateChanged(state) => {
                handle.block_on(parties.apply_auth_state(&state));
                handle.block_on(identity.apply_auth_state(state));
            }
            ReconcileAction::UserDocument(event) => {
                handle.block_on(identity.apply_user_document(event))
            }
            ReconcileAction::VisibleParty(event) => {
                handle.block_on(identity.apply_visible_party(event))
            }
            ReconcileAction::OpenParty(event) => handle.block_on(parties.apply_open_party(event)),
        }
    };

    thread::Builder::new()
        .name("collab-reconciler".to_string())
        .spawn(run)
        .expect("collab-reconciler thread is spawned");
}
