use crossbeam::channel::{Receiver, Sender};

use headcount_core::{DocumentEvent, SessionState};

use crate::records::{PartyId, PartyRecord, UserRecord};

pub type EventSender = Sender<CollabEvent>;
pub type EventReceiver = Receiver<CollabEvent>;

pub type ActionSender = Sender<ReconcileAction>;
pub type ActionReceiver = Receiver<ReconcileAction>;

/// An event emitted by the collab system for the embedding layer to react to.
#[derive(Debug, Clone)]
pub enum CollabEvent {
    /// A session became active, after a sign-in, sign-up, or resume.
    SessionStarted { user: UserRecord },
    /// The active session ended.
    SessionEnded,
    /// The signed-in principal's own record changed.
    ProfileUpdated { user: UserRecord },
    /// The set of parties the principal can see changed, or one of them was
    /// updated. Carries the full set, most recently active first.
    VisiblePartiesUpdated { parties: Vec<PartyRecord> },
    /// The open party received a new authoritative snapshot.
    PartyUpdated { party: PartyRecord },
    /// The open party stopped being available, either closed on this device
    /// or deleted remotely.
    PartyClosed { party_id: PartyId },
}

/// Work dispatched to the reconciliation task by store and provider callbacks.
#[derive(Debug, Clone)]
pub enum ReconcileAction {
    /// The provider's device session changed.
    AuthStateChanged(SessionState),
    /// The principal's own user document changed or was deleted.
    UserDocument(DocumentEvent),
    /// A visible party's document changed or was deleted.
    VisibleParty(DocumentEvent),
    /// The open party's document changed or was deleted.
    OpenParty(DocumentEvent),
}
