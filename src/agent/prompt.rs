//! Enhanced system prompt assembly.
//!
//! The installed prompt is the binding's template enriched with the user
//! profile and ambient context (local time, resolved location). Location
//! lookups go through the cache and fail open: a cold or unavailable cache
//! just leaves the section out.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{get_typed, set_typed, CacheKind, CacheStore};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocationInfo {
    pub city: String,
}

pub struct PromptManager {
    cache: Arc<dyn CacheStore>,
}

impl PromptManager {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Resolve the client location, serving from cache when warm.
    /// Private and unknown addresses resolve to no location.
    pub async fn resolve_location(&self, client_ip: &str) -> Option<LocationInfo> {
        if client_ip.is_empty() || is_private_ip(client_ip) {
            return None;
        }
        match get_typed::<LocationInfo>(self.cache.as_ref(), CacheKind::IpInfo, client_ip).await {
            Ok(Some(info)) => return Some(info),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "location cache read failed, recomputing"),
        }
        // Resolution service is a deployment concern; without one the
        // section is omitted and the result negatively cached.
        let info = LocationInfo {
            city: String::new(),
        };
        let _ = set_typed(self.cache.as_ref(), CacheKind::IpInfo, client_ip, &info).await;
        None
    }

    /// Build the full system prompt installed into the dialogue.
    pub async fn build_enhanced_prompt(
        &self,
        template: &str,
        user_profile: Option<&str>,
        client_ip: &str,
    ) -> String {
        let mut sections = vec![template.trim().to_string()];

        if let Some(profile) = user_profile.filter(|p| !p.trim().is_empty()) {
            sections.push(format!("About the user:\n{}", profile.trim()));
        }

        let now = Utc::now();
        sections.push(format!(
            "Current UTC time: {}.",
            now.format("%Y-%m-%d %H:%M")
        ));

        if let Some(location) = self.resolve_location(client_ip).await {
            if !location.city.is_empty() {
                sections.push(format!("The user is near {}.", location.city));
            }
        }

        sections.join("\n\n")
    }
}

fn is_private_ip(ip: &str) -> bool {
    let Ok(addr) = ip.parse::<std::net::IpAddr>() else {
        return true;
    };
    match addr {
        std::net::IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        std::net::IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    #[tokio::test]
    async fn prompt_includes_template_and_profile() {
        let manager = PromptManager::new(Arc::new(MemoryCache::new()));
        let prompt = manager
            .build_enhanced_prompt("Be terse.", Some("Name: Linh"), "127.0.0.1")
            .await;
        assert!(prompt.starts_with("Be terse."));
        assert!(prompt.contains("Name: Linh"));
        assert!(prompt.contains("Current UTC time"));
    }

    #[tokio::test]
    async fn blank_profile_is_skipped() {
        let manager = PromptManager::new(Arc::new(MemoryCache::new()));
        let prompt = manager
            .build_enhanced_prompt("Be terse.", Some("   "), "10.0.0.1")
            .await;
        assert!(!prompt.contains("About the user"));
    }

    #[tokio::test]
    async fn cached_location_is_used() {
        let cache = Arc::new(MemoryCache::new());
        set_typed(
            cache.as_ref(),
            CacheKind::IpInfo,
            "8.8.8.8",
            &LocationInfo {
                city: "Mountain View".to_string(),
            },
        )
        .await
        .unwrap();

        let manager = PromptManager::new(cache);
        let prompt = manager
            .build_enhanced_prompt("Hi.", None, "8.8.8.8")
            .await;
        assert!(prompt.contains("Mountain View"));
    }

    #[test]
    fn private_ranges_detected() {
        assert!(is_private_ip("192.168.1.10"));
        assert!(is_private_ip("10.1.2.3"));
        assert!(is_private_ip("127.0.0.1"));
        assert!(is_private_ip("not-an-ip"));
        assert!(!is_private_ip("8.8.8.8"));
    }
}
