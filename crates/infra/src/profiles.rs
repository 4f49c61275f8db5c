//! User profile directory (subscription tier lookup).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use annotator_core::{SubscriptionTier, UserId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    #[error("unknown user: {0}")]
    UnknownUser(UserId),

    /// Network/throttling/service failure; retry later.
    #[error("profile directory unavailable: {0}")]
    Unavailable(String),
}

pub trait ProfileDirectory: Send + Sync {
    fn tier(&self, user_id: &UserId) -> Result<SubscriptionTier, ProfileError>;

    fn set_tier(&self, user_id: &UserId, tier: SubscriptionTier) -> Result<(), ProfileError>;
}

impl<S> ProfileDirectory for Arc<S>
where
    S: ProfileDirectory + ?Sized,
{
    fn tier(&self, user_id: &UserId) -> Result<SubscriptionTier, ProfileError> {
        (**self).tier(user_id)
    }

    fn set_tier(&self, user_id: &UserId, tier: SubscriptionTier) -> Result<(), ProfileError> {
        (**self).set_tier(user_id, tier)
    }
}

/// In-memory profile directory for tests/dev.
///
/// `set_tier` registers unknown users, so it doubles as the sign-up path.
#[derive(Debug, Default)]
pub struct InMemoryProfileDirectory {
    tiers: RwLock<HashMap<UserId, SubscriptionTier>>,
    unavailable: AtomicBool,
}

impl InMemoryProfileDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ProfileError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProfileError::Unavailable("profile directory unavailable".to_string()));
        }
        Ok(())
    }
}

fn poisoned() -> ProfileError {
    ProfileError::Unavailable("profile directory lock poisoned".to_string())
}

impl ProfileDirectory for InMemoryProfileDirectory {
    fn tier(&self, user_id: &UserId) -> Result<SubscriptionTier, ProfileError> {
        self.check_available()?;
        let tiers = self.tiers.read().map_err(|_| poisoned())?;
        tiers
            .get(user_id)
            .copied()
            .ok_or_else(|| ProfileError::UnknownUser(user_id.clone()))
    }

    fn set_tier(&self, user_id: &UserId, tier: SubscriptionTier) -> Result<(), ProfileError> {
        self.check_available()?;
        let mut tiers = self.tiers.write().map_err(|_| poisoned())?;
        tiers.insert(user_id.clone(), tier);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_roundtrip_and_unknown_user() {
        let dir = InMemoryProfileDirectory::new();
        let user = UserId::new("u1").unwrap();

        assert_eq!(dir.tier(&user), Err(ProfileError::UnknownUser(user.clone())));

        dir.set_tier(&user, SubscriptionTier::Free).unwrap();
        assert_eq!(dir.tier(&user).unwrap(), SubscriptionTier::Free);

        dir.set_tier(&user, SubscriptionTier::Premium).unwrap();
        assert!(dir.tier(&user).unwrap().is_premium());
    }

    #[test]
    fn outage_is_reported() {
        let dir = InMemoryProfileDirectory::new();
        dir.set_unavailable(true);
        assert!(matches!(
            dir.tier(&UserId::new("u1").unwrap()),
            Err(ProfileError::Unavailable(_))
        ));
    }
}
