use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use headcount_core::{
    AuthMethod, AuthProvider, Credential, PrincipalId, ProviderError, ProviderResult,
    SessionObserver, SessionState,
};

/// An in-process [`AuthProvider`] holding its accounts in memory, with
/// argon2-hashed passwords.
///
/// Accounts are shared between every handle cloned from the same provider;
/// [`LocalAuthProvider::new_device`] creates a handle with its own session,
/// so tests can act as several signed-in devices at once. Federated
/// credentials are taken at face value, with the assertion standing in for a
/// token whose subject is the account email.
#[derive(Clone, Default)]
pub struct LocalAuthProvider {
    accounts: Arc<Accounts>,
    session: Arc<Mutex<Option<PrincipalId>>>,
    observers: Arc<Mutex<Vec<SessionObserver>>>,
}

#[derive(Default)]
struct Accounts {
    records: DashMap<PrincipalId, AccountRecord>,
    by_email: DashMap<String, PrincipalId>,
}

struct AccountRecord {
    email: String,
    password_hash: Option<String>,
    methods: Vec<AuthMethod>,
}

impl LocalAuthProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle to the same accounts with a session of its own.
    pub fn new_device(&self) -> Self {
        Self {
            accounts: self.accounts.clone(),
            session: Arc::new(Mutex::new(None)),
            observers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn set_session(&self, principal: Option<PrincipalId>) {
        let changed = {
            let mut session = self.session.lock();

            if *session == principal {
                false
            } else {
                *session = principal.clone();
                true
            }
        };

        if changed {
            let state = match principal {
                Some(id) => SessionState::SignedIn(id),
                None => SessionState::SignedOut,
            };

            self.notify(state);
        }
    }

    /// Observers are cloned out of the lock before they run, since one of
    /// them may call back into the provider.
    fn notify(&self, state: SessionState) {
        let observers: Vec<SessionObserver> = self.observers.lock().clone();

        for observer in observers {
            observer(state.clone());
        }
    }

    async fn federated_sign_in(
        &self,
        method: AuthMethod,
        assertion: String,
    ) -> ProviderResult<PrincipalId> {
        if method == AuthMethod::Password {
            return Err(ProviderError::Rejected(
                "password is not a federated method".to_string(),
            ));
        }

        let email = normalize_email(&assertion);

        let existing = self.accounts.by_email.get(&email).map(|entry| entry.clone());

        let principal = match existing {
            Some(principal) => {
                let linked = self
                    .accounts
                    .records
                    .get(&principal)
                    .map(|account| account.methods.contains(&method))
                    .unwrap_or(false);

                // The email belongs to an account this method was never
                // linked to. The caller has to sign in the account's own way
                // and link the method explicitly.
                if !linked {
                    return Err(ProviderError::AccountExists);
                }

                principal
            }
            None => {
                let principal = generate_principal_id();

                self.accounts.records.insert(
                    principal.clone(),
                    AccountRecord {
                        email: email.clone(),
                        password_hash: None,
                        methods: vec![method],
                    },
                );

                self.accounts.by_email.insert(email, principal.clone());
                principal
            }
        };

        self.set_session(Some(principal.clone()));
        Ok(principal)
    }

    /// Resolve a credential to the principal it proves, without touching the
    /// session or creating accounts.
    fn resolve_credential(&self, credential: &Credential) -> ProviderResult<PrincipalId> {
        match credential {
            Credential::Password { email, password } => {
                let email = normalize_email(email);

                let principal = self
                    .accounts
                    .by_email
                    .get(&email)
                    .map(|entry| entry.clone())
                    .ok_or(ProviderError::InvalidCredentials)?;

                let verified = {
                    let account = self
                        .accounts
                        .records
                        .get(&principal)
                        .ok_or(ProviderError::InvalidCredentials)?;

                    let hash = account
                        .password_hash
                        .as_deref()
                        .ok_or(ProviderError::InvalidCredentials)?;

                    verify_password(hash, password)
                };

                if !verified {
                    return Err(ProviderError::InvalidCredentials);
                }

                Ok(principal)
            }
            Credential::Federated { method, assertion } => {
                if *method == AuthMethod::Password {
                    return Err(ProviderError::Rejected(
                        "password is not a federated method".to_string(),
                    ));
                }

                let email = normalize_email(assertion);

                let principal = self
                    .accounts
                    .by_email
                    .get(&email)
                    .map(|entry| entry.clone())
                    .ok_or(ProviderError::InvalidCredentials)?;

                let linked = self
                    .accounts
                    .records
                    .get(&principal)
                    .map(|account| account.methods.contains(method))
                    .unwrap_or(false);

                if !linked {
                    return Err(ProviderError::InvalidCredentials);
                }

                Ok(principal)
            }
        }
    }
}

#[async_trait]
impl AuthProvider for LocalAuthProvider {
    async fn verify(&self, credential: Credential) -> ProviderResult<PrincipalId> {
        match credential {
            Credential::Password { .. } => {
                let principal = self.resolve_credential(&credential)?;

                self.set_session(Some(principal.clone()));
                Ok(principal)
            }
            Credential::Federated { method, assertion } => {
                self.federated_sign_in(method, assertion).await
            }
        }
    }

    async fn register(&self, credential: Credential) -> ProviderResult<PrincipalId> {
        match credential {
            Credential::Password { email, password } => {
                let email = normalize_email(&email);
                let hash = hash_password(&password)?;
                let principal = generate_principal_id();

                match self.accounts.by_email.entry(email.clone()) {
                    Entry::Occupied(_) => return Err(ProviderError::AccountExists),
                    Entry::Vacant(vacant) => {
                        self.accounts.records.insert(
                            principal.clone(),
                            AccountRecord {
                                email,
                                password_hash: Some(hash),
                                methods: vec![AuthMethod::Password],
                            },
                        );

                        vacant.insert(principal.clone());
                    }
                }

                self.set_session(Some(principal.clone()));
                Ok(principal)
            }
            Credential::Federated { method, assertion } => {
                self.federated_sign_in(method, assertion).await
            }
        }
    }

    async fn reauthenticate(&self, principal: &str, credential: Credential) -> ProviderResult<()> {
        let verified = self.resolve_credential(&credential)?;

        // A valid credential for some other account proves nothing here.
        if verified != principal {
            return Err(ProviderError::InvalidCredentials);
        }

        Ok(())
    }

    fn current_principal(&self) -> Option<PrincipalId> {
        self.session.lock().clone()
    }

    async fn account_email(&self, principal: &str) -> ProviderResult<Option<String>> {
        let account = self
            .accounts
            .records
            .get(principal)
            .ok_or(ProviderError::UnknownPrincipal)?;

        Ok(Some(account.email.clone()))
    }

    async fn linked_methods(&self, principal: &str) -> ProviderResult<Vec<AuthMethod>> {
        let account = self
            .accounts
            .records
            .get(principal)
            .ok_or(ProviderError::UnknownPrincipal)?;

        Ok(account.methods.clone())
    }

    async fn link(&self, principal: &str, credential: Credential) -> ProviderResult<()> {
        let method = credential.method();

        let hash = match &credential {
            Credential::Password { password, .. } => Some(hash_password(password)?),
            Credential::Federated { .. } => None,
        };

        let mut account = self
            .accounts
            .records
            .get_mut(principal)
            .ok_or(ProviderError::UnknownPrincipal)?;

        if account.methods.contains(&method) {
            return Err(ProviderError::MethodAlreadyLinked(method));
        }

        if let Some(hash) = hash {
            account.password_hash = Some(hash);
        }

        account.methods.push(method);
        Ok(())
    }

    async fn unlink(&self, principal: &str, method: AuthMethod) -> ProviderResult<()> {
        let mut account = self
            .accounts
            .records
            .get_mut(principal)
            .ok_or(ProviderError::UnknownPrincipal)?;

        if !account.methods.contains(&method) {
            return Err(ProviderError::MethodNotLinked(method));
        }

        account.methods.retain(|existing| *existing != method);

        if method == AuthMethod::Password {
            account.password_hash = None;
        }

        Ok(())
    }

    async fn remove_account(&self, principal: &str) -> ProviderResult<()> {
        let (_, removed) = self
            .accounts
            .records
            .remove(principal)
            .ok_or(ProviderError::UnknownPrincipal)?;

        self.accounts.by_email.remove(&removed.email);

        let is_current = self.session.lock().as_deref() == Some(principal);

        if is_current {
            self.set_session(None);
        }

        Ok(())
    }

    async fn sign_out(&self) {
        self.set_session(None);
    }

    fn on_session_change(&self, observer: SessionObserver) {
        self.observers.lock().push(observer);
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn generate_principal_id() -> PrincipalId {
    thread_rng()
        .sample_iter(Alphanumeric)
        .take(28)
        .map(char::from)
        .collect()
}

fn hash_password(password: &str) -> ProviderResult<String> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ProviderError::Rejected(err.to_string()))
}

fn verify_password(hash: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}
