use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::error::RegistryError;
use crate::sip::SipUri;

/// Outcome of a registry operation: where the user is and for how long
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub seconds_to_expiry: u64,
    pub contact: SipUri,
}

#[derive(Debug, Clone)]
struct Binding {
    contact: SipUri,
    expires_at: Instant,
}

impl Binding {
    fn registration(&self, now: Instant) -> Registration {
        Registration {
            seconds_to_expiry: self.expires_at.saturating_duration_since(now).as_secs(),
            contact: self.contact.clone(),
        }
    }
}

/// Non-persistent registry for a single domain, keyed by the user part of
/// the address-of-record. Expired bindings are dropped lazily on access.
#[derive(Debug)]
pub struct InMemoryRegistry {
    domain: String,
    users: Mutex<HashMap<String, Binding>>,
}

impl InMemoryRegistry {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn check_domain(&self, uri: &SipUri) -> Result<(), RegistryError> {
        if uri.host.eq_ignore_ascii_case(&self.domain) {
            Ok(())
        } else {
            Err(RegistryError::UnknownDomain(uri.host.clone()))
        }
    }

    fn prune(users: &mut HashMap<String, Binding>, now: Instant) {
        users.retain(|user, binding| {
            let live = binding.expires_at > now;
            if !live {
                tracing::debug!("[Registry] Binding for {} expired", user);
            }
            live
        });
    }

    /// Bind `logical` (the address-of-record) to `contact` for `expires`.
    /// An existing binding for the same user is replaced and its timer reset.
    pub async fn register_address(
        &self,
        domain_uri: &SipUri,
        logical: &SipUri,
        contact: &SipUri,
        expires: Duration,
    ) -> Result<Registration, RegistryError> {
        if self.check_domain(domain_uri).is_err() || self.check_domain(logical).is_err() {
            tracing::warn!("[Registry] Registration for domain we don't handle: {}", logical);
            return Err(RegistryError::Registration(404));
        }

        let now = Instant::now();
        let expires_at = now
            .checked_add(expires)
            .ok_or(RegistryError::Registration(400))?;
        let binding = Binding {
            contact: contact.clone(),
            expires_at,
        };
        let registration = binding.registration(now);

        let mut users = self.users.lock().await;
        Self::prune(&mut users, now);
        users.insert(logical.user_key(), binding);

        tracing::info!("[Registry] Registered {} at {}", logical, contact);
        Ok(registration)
    }

    pub async fn unregister_address(&self, logical: &SipUri) -> Result<Registration, RegistryError> {
        let now = Instant::now();
        let mut users = self.users.lock().await;
        Self::prune(&mut users, now);
        let binding = users
            .remove(&logical.user_key())
            .ok_or_else(|| RegistryError::NoSuchUser(logical.user_key()))?;

        tracing::info!("[Registry] Unregistered {}", logical);
        Ok(Registration {
            seconds_to_expiry: 0,
            contact: binding.contact,
        })
    }

    /// Current contact for a user
    pub async fn get_address(&self, user: &SipUri) -> Result<SipUri, RegistryError> {
        Ok(self.get_registration_info(user).await?.contact)
    }

    pub async fn get_registration_info(&self, user: &SipUri) -> Result<Registration, RegistryError> {
        self.check_domain(user)?;
        let now = Instant::now();
        let mut users = self.users.lock().await;
        Self::prune(&mut users, now);
        users
            .get(&user.user_key())
            .map(|b| b.registration(now))
            .ok_or_else(|| RegistryError::NoSuchUser(user.user_key()))
    }

    pub async fn len(&self) -> usize {
        let mut users = self.users.lock().await;
        Self::prune(&mut users, Instant::now());
        users.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
