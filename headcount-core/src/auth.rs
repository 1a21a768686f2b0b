use std::fmt::{self, Display};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// The opaque id a provider assigns to an authenticated account.
pub type PrincipalId = String;

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Represents an external identity provider that verifies credentials and
/// keeps a device-local session.
///
/// The provider is the source of truth for which sign-in methods an account
/// has. It knows nothing about user records or parties.
#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    /// Check a credential against an existing account and make its principal
    /// the current session.
    async fn verify(&self, credential: Credential) -> ProviderResult<PrincipalId>;

    /// Create an account for the credential and make its principal the
    /// current session. Password registration fails if the email is taken;
    /// federated registration behaves like a first [`AuthProvider::verify`].
    async fn register(&self, credential: Credential) -> ProviderResult<PrincipalId>;

    /// Confirm a credential belongs to the given principal without touching
    /// the session. A credential for a different account fails with
    /// [`ProviderError::InvalidCredentials`], and never creates one.
    async fn reauthenticate(&self, principal: &str, credential: Credential) -> ProviderResult<()>;

    /// The principal of the device's current session, if any.
    fn current_principal(&self) -> Option<PrincipalId>;

    /// The email a principal registered with, when the provider knows one.
    async fn account_email(&self, principal: &str) -> ProviderResult<Option<String>>;

    /// The sign-in methods currently attached to a principal's account.
    async fn linked_methods(&self, principal: &str) -> ProviderResult<Vec<AuthMethod>>;

    /// Attach another sign-in method to an existing account.
    async fn link(&self, principal: &str, credential: Credential) -> ProviderResult<()>;

    /// Detach a sign-in method from an account.
    async fn unlink(&self, principal: &str, method: AuthMethod) -> ProviderResult<()>;

    /// Permanently delete an account, ending the session if it belongs to it.
    async fn remove_account(&self, principal: &str) -> ProviderResult<()>;

    /// End the current session, if any.
    async fn sign_out(&self);

    /// Register an observer that is called whenever the session starts or
    /// ends, including changes made outside this process.
    fn on_session_change(&self, observer: SessionObserver);
}

/// A way to sign in to an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AuthMethod {
    Password,
    Google,
    Apple,
}

impl AuthMethod {
    /// The identifier this method goes by in stored records.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::Google => "google.com",
            Self::Apple => "apple.com",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "password" => Some(Self::Password),
            "google.com" => Some(Self::Google),
            "apple.com" => Some(Self::Apple),
            _ => None,
        }
    }
}

impl Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Proof of identity presented to a provider.
#[derive(Debug, Clone)]
pub enum Credential {
    Password {
        email: String,
        password: String,
    },
    /// An assertion already verified by a federated identity provider,
    /// such as a Google or Apple sign-in token.
    Federated {
        method: AuthMethod,
        assertion: String,
    },
}

impl Credential {
    pub fn method(&self) -> AuthMethod {
        match self {
            Self::Password { .. } => AuthMethod::Password,
            Self::Federated { method, .. } => *method,
        }
    }
}

/// Whether a device currently has an authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    SignedIn(PrincipalId),
    SignedOut,
}

/// A callback invoked by the provider when the session state changes.
pub type SessionObserver = Arc<dyn Fn(SessionState) + Send + Sync>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("An account with this identity already exists")]
    AccountExists,
    #[error("No principal is signed in")]
    NotSignedIn,
    #[error("Unknown principal")]
    UnknownPrincipal,
    #[error("{0} is not linked to this account")]
    MethodNotLinked(AuthMethod),
    #[error("{0} is already linked to this account")]
    MethodAlreadyLinked(AuthMethod),
    #[error("The provider rejected the operation: {0}")]
    Rejected(String),
}
