use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::OnceLock;

use crossbeam::atomic::AtomicCell;
use tokio::runtime::{Handle, Runtime};

static ID_COUNTER: AtomicCell<u64> = AtomicCell::new(1);

/// A process-unique numeric identifier, typed by what it identifies.
pub struct Id<T> {
    value: u64,
    kind: PhantomData<T>,
}

impl<T> Id<T> {
    pub fn new() -> Self {
        Self {
            value: ID_COUNTER.fetch_add(1),
            kind: PhantomData,
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }
}

impl<T> Default for Id<T> {
    fn default() -> Self {
        Self::new()
    }
}

// The trait implementations are manual so they don't put bounds on T.
impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T> Eq for Id<T> {}

impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state)
    }
}

impl<T> Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.value)
    }
}

impl<T> Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.value, f)
    }
}

/// Returns the current tokio runtime handle, creating a process-wide fallback
/// runtime if none is running.
pub fn get_or_create_handle() -> Handle {
    static FALLBACK: OnceLock<Runtime> = OnceLock::new();

    Handle::try_current().unwrap_or_else(|_| {
        FALLBACK
            .get_or_init(|| Runtime::new().expect("fallback runtime is created"))
            .handle()
            .clone()
    })
}
