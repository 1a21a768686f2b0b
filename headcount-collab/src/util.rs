use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

const RECORD_ID_LENGTH: usize = 20;

pub fn random_string(length: usize) -> String {
    thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// A fresh document id for a party or attendee.
pub fn record_id() -> String {
    random_string(RECORD_ID_LENGTH)
}
