//! Closed adapter registry and account lifecycle.
//!
//! Holds the fixed set of surface adapters, serves cheap docks to shared
//! code, and enforces at most one active account instance per
//! `(adapter, account_id)`. Reload is stop-then-start under a per-adapter
//! lock so two reloads cannot interleave.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::adapters::{
    DiscordAdapter, ImessageAdapter, SignalAdapter, SlackAdapter, TelegramAdapter,
    WebchatAdapter, WhatsappAdapter,
};
use crate::adapters::webchat::WebchatOutbound;
use crate::channel_contract::{AccountContext, ChannelAdapter, ChannelDock, ChannelRuntimeStatus};
use crate::channel_envelope::ChannelSurface;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// One row of the `channels.status` snapshot.
pub struct AccountStatusRow {
    pub surface: ChannelSurface,
    pub account_id: String,
    pub status: String,
}

pub struct ChannelRegistry {
    adapters: BTreeMap<ChannelSurface, Arc<dyn ChannelAdapter>>,
    account_locks: BTreeMap<ChannelSurface, Arc<Mutex<()>>>,
    active: Mutex<HashMap<(ChannelSurface, String), AccountContext>>,
}

impl ChannelRegistry {
    /// Builds the full builtin adapter set. The webchat delivery queue is
    /// returned for the gateway to drain.
    pub fn builtin() -> (Self, tokio::sync::mpsc::UnboundedReceiver<WebchatOutbound>) {
        let (webchat, webchat_rx) = WebchatAdapter::new_with_queue();
        let mut adapters: BTreeMap<ChannelSurface, Arc<dyn ChannelAdapter>> = BTreeMap::new();
        adapters.insert(
            ChannelSurface::Whatsapp,
            Arc::new(WhatsappAdapter::new(None)),
        );
        adapters.insert(
            ChannelSurface::Telegram,
            Arc::new(TelegramAdapter::new(None)),
        );
        adapters.insert(ChannelSurface::Discord, Arc::new(DiscordAdapter::new(None)));
        adapters.insert(ChannelSurface::Signal, Arc::new(SignalAdapter::new(None)));
        adapters.insert(
            ChannelSurface::Imessage,
            Arc::new(ImessageAdapter::new(None)),
        );
        adapters.insert(ChannelSurface::Slack, Arc::new(SlackAdapter::new(None)));
        adapters.insert(ChannelSurface::Webchat, Arc::new(webchat));
        (Self::from_adapters(adapters), webchat_rx)
    }

    pub fn from_adapters(adapters: BTreeMap<ChannelSurface, Arc<dyn ChannelAdapter>>) -> Self {
        let account_locks = adapters
            .keys()
            .map(|surface| (*surface, Arc::new(Mutex::new(()))))
            .collect();
        Self {
            adapters,
            account_locks,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn adapter(&self, surface: ChannelSurface) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&surface).cloned()
    }

    /// Docks for every registered adapter, ordered for display.
    pub fn docks(&self) -> Vec<ChannelDock> {
        let mut docks = self
            .adapters
            .values()
            .map(|adapter| adapter.dock())
            .collect::<Vec<_>>();
        docks.sort_by_key(|dock| dock.order);
        docks
    }

    /// Union of every adapter's hot-restart config prefixes.
    pub fn config_prefixes(&self) -> Vec<String> {
        let mut prefixes = self
            .adapters
            .values()
            .flat_map(|adapter| adapter.config_prefixes())
            .collect::<Vec<_>>();
        prefixes.sort();
        prefixes.dedup();
        prefixes
    }

    pub async fn start_account(
        &self,
        surface: ChannelSurface,
        account_id: &str,
    ) -> Result<AccountContext> {
        let Some(adapter) = self.adapter(surface) else {
            bail!("no adapter registered for surface '{}'", surface.as_str());
        };
        let lock = self.adapter_lock(surface);
        let _guard = lock.lock().await;

        let key = (surface, account_id.to_string());
        {
            let active = self.active.lock().await;
            if active.contains_key(&key) {
                bail!(
                    "account '{}' on '{}' is already active",
                    account_id,
                    surface.as_str()
                );
            }
        }

        let ctx = AccountContext::new(account_id);
        adapter.start_account(&ctx).await?;
        self.active.lock().await.insert(key, ctx.clone());
        info!(
            target: "clawdis.channel",
            surface = surface.as_str(),
            account = account_id,
            "account started"
        );
        Ok(ctx)
    }

    pub async fn stop_account(&self, surface: ChannelSurface, account_id: &str) -> Result<()> {
        let Some(adapter) = self.adapter(surface) else {
            bail!("no adapter registered for surface '{}'", surface.as_str());
        };
        let lock = self.adapter_lock(surface);
        let _guard = lock.lock().await;

        let key = (surface, account_id.to_string());
        let Some(ctx) = self.active.lock().await.remove(&key) else {
            return Ok(());
        };
        adapter.stop_account(&ctx).await?;
        info!(
            target: "clawdis.channel",
            surface = surface.as_str(),
            account = account_id,
            "account stopped"
        );
        Ok(())
    }

    /// Hot reload: stop-then-start under the per-adapter lock.
    pub async fn reload_account(
        &self,
        surface: ChannelSurface,
        account_id: &str,
    ) -> Result<AccountContext> {
        self.stop_account(surface, account_id).await?;
        self.start_account(surface, account_id).await
    }

    pub async fn status_snapshot(&self) -> Vec<AccountStatusRow> {
        let active = self.active.lock().await;
        let mut rows = active
            .iter()
            .map(|((surface, account_id), ctx)| AccountStatusRow {
                surface: *surface,
                account_id: account_id.clone(),
                status: ctx.status.get().as_str().to_string(),
            })
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| (a.surface, &a.account_id).cmp(&(b.surface, &b.account_id)));
        rows
    }

    pub async fn account_status(
        &self,
        surface: ChannelSurface,
        account_id: &str,
    ) -> Option<ChannelRuntimeStatus> {
        let active = self.active.lock().await;
        active
            .get(&(surface, account_id.to_string()))
            .map(|ctx| ctx.status.get())
    }

    fn adapter_lock(&self, surface: ChannelSurface) -> Arc<Mutex<()>> {
        self.account_locks
            .get(&surface)
            .cloned()
            .unwrap_or_else(|| Arc::new(Mutex::new(())))
    }
}

#[cfg(test)]
mod tests {
    use super::ChannelRegistry;
    use crate::channel_envelope::ChannelSurface;

    #[test]
    fn unit_builtin_registry_covers_every_surface_in_order() {
        let (registry, _webchat_rx) = ChannelRegistry::builtin();
        let docks = registry.docks();
        assert_eq!(docks.len(), ChannelSurface::ALL.len());
        let orders = docks.iter().map(|dock| dock.order).collect::<Vec<_>>();
        let mut sorted = orders.clone();
        sorted.sort();
        assert_eq!(orders, sorted);
    }

    #[test]
    fn unit_config_prefixes_name_each_channel_subtree() {
        let (registry, _webchat_rx) = ChannelRegistry::builtin();
        let prefixes = registry.config_prefixes();
        assert!(prefixes.contains(&"channels.whatsapp".to_string()));
        assert!(prefixes.contains(&"channels.webchat".to_string()));
    }

    #[tokio::test]
    async fn functional_second_start_of_same_account_is_rejected() {
        let (registry, _webchat_rx) = ChannelRegistry::builtin();
        registry
            .start_account(ChannelSurface::Webchat, "default")
            .await
            .expect("first start");
        let error = registry
            .start_account(ChannelSurface::Webchat, "default")
            .await
            .expect_err("duplicate start should fail");
        assert!(error.to_string().contains("already active"));
    }

    #[tokio::test]
    async fn functional_reload_is_stop_then_start() {
        let (registry, _webchat_rx) = ChannelRegistry::builtin();
        registry
            .start_account(ChannelSurface::Webchat, "default")
            .await
            .expect("start");
        registry
            .reload_account(ChannelSurface::Webchat, "default")
            .await
            .expect("reload");
        let snapshot = registry.status_snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, "running");
    }

    #[tokio::test]
    async fn regression_stop_of_unknown_account_is_a_noop() {
        let (registry, _webchat_rx) = ChannelRegistry::builtin();
        registry
            .stop_account(ChannelSurface::Signal, "ghost")
            .await
            .expect("noop stop");
    }
}
