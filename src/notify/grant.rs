//! Grant URL construction and grant sinks.

use super::{AccessGrant, GrantSink};
use crate::config::GrantConfig;
use crate::error::{Error, Result};
use crate::identifier::AccountId;
use tokio::sync::mpsc;
use url::Url;

/// Builds the captive-portal grant URL, e.g.
/// `https://portal/guest/s/default?user_id=%2B255712345678&session_duration=60`.
#[derive(Clone, Debug)]
pub struct GrantUrlBuilder {
    base: Url,
    user_param: String,
    duration_param: String,
}

impl GrantUrlBuilder {
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the base URL is invalid.
    pub fn new(config: &GrantConfig) -> Result<Self> {
        config.validate()?;
        let trimmed = config.base_grant_url.trim_end_matches('/');
        Ok(GrantUrlBuilder {
            base: Url::parse(trimmed)?,
            user_param: config.user_param.clone(),
            duration_param: config.duration_param.clone(),
        })
    }

    /// Grant URL for `account`. The duration parameter is left out for pure data vouchers.
    pub fn build(&self, account: &AccountId, session_minutes: Option<u64>) -> String {
        let mut url = self.base.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(&self.user_param, account.as_str());
            if let Some(minutes) = session_minutes {
                query.append_pair(&self.duration_param, &minutes.to_string());
            }
        }
        url.into()
    }
}

/// Grant sink that forwards grants to a gateway worker over a channel.
pub struct ChannelGrantSink {
    gateway: mpsc::UnboundedSender<AccessGrant>,
}

impl ChannelGrantSink {
    pub fn new(gateway: mpsc::UnboundedSender<AccessGrant>) -> Self {
        ChannelGrantSink { gateway }
    }

    /// Create a sink together with the gateway's receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AccessGrant>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl GrantSink for ChannelGrantSink {
    fn grant(&self, grant: &AccessGrant) -> Result<()> {
        self.gateway.send(grant.clone()).map_err(|e| {
            Error::DeliveryError(format!("gateway channel closed, grant {} dropped", e.0.code))
        })
    }
}

/// Grant sink that only logs. Default when none is configured.
#[derive(Clone, Default)]
pub struct LogGrantSink;

impl GrantSink for LogGrantSink {
    fn grant(&self, grant: &AccessGrant) -> Result<()> {
        info!(
            "Grant {} for {} -> {}",
            grant.code, grant.account, grant.grant_url
        );
        Ok(())
    }
}
