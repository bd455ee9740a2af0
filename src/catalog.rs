//! Channel lookup boundary. The relay only reads channels; whoever owns
//! the catalog (database, admin console) sits behind [`ChannelCatalog`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    pub stream_url: String,
    #[serde(default = "enabled")]
    pub is_active: bool,
    #[serde(default = "enabled")]
    pub is_approved: bool,
    #[serde(default)]
    pub proxy_enabled: bool,
    #[serde(default)]
    pub logo_url: Option<String>,
}

impl Channel {
    /// Only active, approved channels may be handed out to listeners.
    pub fn is_playable(&self) -> bool {
        self.is_active && self.is_approved
    }
}

fn enabled() -> bool {
    true
}

#[async_trait]
pub trait ChannelCatalog: Send + Sync {
    async fn find(&self, id: i64) -> Option<Channel>;
}

/// Catalog loaded from the `channels` section of the config file.
pub struct StaticCatalog {
    channels: HashMap<i64, Channel>,
}

impl StaticCatalog {
    pub fn new(channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            channels: channels.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl ChannelCatalog for StaticCatalog {
    async fn find(&self, id: i64) -> Option<Channel> {
        self.channels.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: i64, active: bool, approved: bool) -> Channel {
        Channel {
            id,
            title: format!("ch{id}"),
            stream_url: format!("https://example/{id}"),
            is_active: active,
            is_approved: approved,
            proxy_enabled: false,
            logo_url: None,
        }
    }

    #[tokio::test]
    async fn finds_channels_by_id() {
        let catalog = StaticCatalog::new(vec![channel(1, true, true), channel(2, true, false)]);
        assert_eq!(catalog.len(), 2);
        assert!(catalog.find(1).await.unwrap().is_playable());
        assert!(!catalog.find(2).await.unwrap().is_playable());
        assert!(catalog.find(3).await.is_none());
    }
}
