//! Price update callbacks

use super::messages::PriceMessage;
use async_trait::async_trait;
use std::sync::Arc;

/// Receives price updates for one subscribed instrument
///
/// Handlers run inside the read loop, one frame at a time. An error or a
/// panic is logged as a handler fault and the loop carries on with the next
/// frame.
#[async_trait]
pub trait PriceHandler: Send + Sync {
    /// Process one price frame for the bound instrument
    async fn handle(&self, message: PriceMessage) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> PriceHandler for FnHandler<F>
where
    F: Fn(PriceMessage) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, message: PriceMessage) -> anyhow::Result<()> {
        (self.0)(message)
    }
}

/// Wrap a synchronous closure as a handler
pub fn handler_fn<F>(f: F) -> Arc<dyn PriceHandler>
where
    F: Fn(PriceMessage) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}
