//! Display profiles for members.
//!
//! Authentication is out of scope; the engine only needs a name and avatar
//! to cache on the member record at join time.

use std::collections::HashMap;
use std::sync::RwLock;

use labsync_core::{DisplayProfile, UserId};

pub trait IdentityProvider: Send + Sync {
    fn profile(&self, user_id: UserId) -> Option<DisplayProfile>;
}

/// Profile for `user_id`, falling back to a short-id name.
pub fn resolve_profile(provider: &dyn IdentityProvider, user_id: UserId) -> DisplayProfile {
    provider.profile(user_id).unwrap_or_else(|| {
        let short = user_id.simple().to_string();
        DisplayProfile::named(format!("user-{}", &short[..8]))
    })
}

/// In-memory identity map.
#[derive(Default)]
pub struct StaticIdentity {
    profiles: RwLock<HashMap<UserId, DisplayProfile>>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles(profiles: impl IntoIterator<Item = (UserId, DisplayProfile)>) -> Self {
        Self { profiles: RwLock::new(profiles.into_iter().collect()) }
    }

    pub fn insert(&self, user_id: UserId, profile: DisplayProfile) {
        if let Ok(mut profiles) = self.profiles.write() {
            profiles.insert(user_id, profile);
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn profile(&self, user_id: UserId) -> Option<DisplayProfile> {
        self.profiles.read().ok()?.get(&user_id).cloned()
    }
}
