use headcount_core::{Revision, SubscriptionHandle};

use crate::records::{PartyId, PartyRecord};

/// The lifecycle of the device's open-party handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartyState {
    /// No party has been opened since launch.
    Unopened,
    /// A party is being fetched and subscribed.
    Opening { party_id: PartyId },
    /// A party is open and receiving live snapshots.
    Open { party_id: PartyId },
    /// The last open party was closed, or deleted out from under us.
    Closed,
}

pub(super) enum OpenState {
    Unopened,
    Opening { party_id: PartyId, generation: u64 },
    Open(OpenParty),
    Closed,
}

/// The live handle: the last authoritative snapshot plus its subscription.
pub(super) struct OpenParty {
    pub record: PartyRecord,
    pub revision: Revision,
    pub subscription: SubscriptionHandle,
}

impl OpenState {
    pub fn as_public(&self) -> PartyState {
        match self {
            OpenState::Unopened => PartyState::Unopened,
            OpenState::Opening { party_id, .. } => PartyState::Opening {
                party_id: party_id.clone(),
            },
            OpenState::Open(open) => PartyState::Open {
                party_id: open.record.id.clone(),
            },
            OpenState::Closed => PartyState::Closed,
        }
    }
}
