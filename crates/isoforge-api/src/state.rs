//! Application state.

use isoforge_core::channel::StatusChannel;
use isoforge_core::signing::Signer;
use isoforge_scheduler::BuildService;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub builds: Arc<BuildService>,
    pub channel: Arc<dyn StatusChannel>,
    pub signer: Arc<Signer>,
}

impl AppState {
    pub fn new(
        builds: Arc<BuildService>,
        channel: Arc<dyn StatusChannel>,
        signer: Arc<Signer>,
    ) -> Self {
        Self {
            builds,
            channel,
            signer,
        }
    }
}
