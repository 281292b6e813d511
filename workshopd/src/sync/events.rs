use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;
use workshop_integrations::{PackageState, StateEvent};

use super::installer::ConflictResolution;

/// Receives every package state transition, synchronously and in order.
pub trait StateSink: Send + Sync {
    fn emit(&self, remote_id: &str, state: &PackageState);
}

impl<F> StateSink for F
where
    F: Fn(&str, &PackageState) + Send + Sync,
{
    fn emit(&self, remote_id: &str, state: &PackageState) {
        self(remote_id, state)
    }
}

/// Forwards transitions as [`StateEvent`]s over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StateEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StateSink for ChannelSink {
    fn emit(&self, remote_id: &str, state: &PackageState) {
        if self
            .tx
            .send(StateEvent::new(remote_id, state.clone()))
            .is_err()
        {
            tracing::debug!(mod_id = remote_id, "state receiver dropped");
        }
    }
}

/// Asked when an install target exists without a package id. The batch
/// waits on the returned future for that package.
pub trait ConflictResolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        remote_id: &'a str,
        folder_name: &'a str,
    ) -> BoxFuture<'a, ConflictResolution>;
}

/// Answers every conflict the same way.
#[derive(Debug, Clone, Copy)]
pub struct FixedResolver(pub ConflictResolution);

impl ConflictResolver for FixedResolver {
    fn resolve<'a>(
        &'a self,
        remote_id: &'a str,
        folder_name: &'a str,
    ) -> BoxFuture<'a, ConflictResolution> {
        let decision = self.0;
        tracing::info!(
            mod_id = remote_id,
            folder = folder_name,
            ?decision,
            "resolving corrupted folder conflict"
        );
        async move { decision }.boxed()
    }
}
