//! Vendor selection: ordered per (channel, tenant), health-aware, with a
//! last-resort probe so open breakers get a chance to close.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use herald_common::Channel;
use herald_config::{AppConfig, ChannelConfig};
use herald_store::{VendorStatusStore, GLOBAL_TENANT};

pub struct VendorSelector {
    channels: HashMap<String, ChannelConfig>,
    vendor_status: Arc<dyn VendorStatusStore>,
}

impl VendorSelector {
    pub fn new(config: &AppConfig, vendor_status: Arc<dyn VendorStatusStore>) -> Self {
        Self {
            channels: config.channels.clone(),
            vendor_status,
        }
    }

    /// Configured ordering for (channel, tenant), with the notification's
    /// vendor preference moved to the front when it is configured.
    fn ordering(&self, channel: Channel, tenant_id: &str, preference: Option<&str>) -> Vec<String> {
        let mut order = self
            .channels
            .get(channel.as_str())
            .map(|c| c.vendors_for(tenant_id).to_vec())
            .unwrap_or_default();

        if let Some(preferred) = preference {
            if let Some(pos) = order.iter().position(|v| v == preferred) {
                let preferred = order.remove(pos);
                order.insert(0, preferred);
            }
        }

        order
    }

    /// The next candidate vendor: the first configured vendor that is not
    /// excluded and whose status snapshot is healthy. When no vendor
    /// qualifies by health, the first non-excluded configured vendor is
    /// returned regardless of health (last-resort probe). `None` only when
    /// every configured vendor is excluded or the channel has none.
    pub async fn next(
        &self,
        channel: Channel,
        tenant_id: &str,
        excluded: &[String],
        preference: Option<&str>,
    ) -> Option<String> {
        let order = self.ordering(channel, tenant_id, preference);
        let candidates: Vec<&String> = order.iter().filter(|v| !excluded.contains(v)).collect();
        if candidates.is_empty() {
            return None;
        }

        // One read covers the whole channel; tenant-specific snapshots win
        // over the monitor's global scope.
        let tenant_statuses = self
            .vendor_status
            .list(channel, tenant_id)
            .await
            .unwrap_or_default();
        let global_statuses = self
            .vendor_status
            .list(channel, GLOBAL_TENANT)
            .await
            .unwrap_or_default();

        for vendor in &candidates {
            let status = tenant_statuses
                .iter()
                .find(|s| &s.vendor == *vendor)
                .or_else(|| global_statuses.iter().find(|s| &s.vendor == *vendor));

            // No snapshot yet means the monitor has not judged this vendor;
            // treat it as eligible rather than forcing the last-resort path.
            let healthy = status.map(|s| s.is_healthy()).unwrap_or(true);
            if healthy {
                return Some((*vendor).clone());
            }
        }

        let fallback = candidates[0].clone();
        debug!(
            channel = %channel,
            tenant_id = %tenant_id,
            vendor = %fallback,
            "No healthy vendor; returning first configured as last-resort probe"
        );
        Some(fallback)
    }
}
