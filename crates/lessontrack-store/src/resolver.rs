//! Picks the store that backs an operation.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::durable::DurableStore;
use crate::ephemeral::EphemeralStore;
use crate::model::{DataMode, Source};
use crate::stats::AccessStats;

/// Decides between the ephemeral and durable store for one call.
///
/// The mode preference is read on every call, so a change takes effect on
/// the next operation. Resolution never fails: when the durable probe
/// cannot be answered the ephemeral store is chosen.
#[derive(Clone)]
pub struct SourceResolver {
    ephemeral: EphemeralStore,
    durable: DurableStore,
    stats: Arc<AccessStats>,
}

impl SourceResolver {
    pub fn new(ephemeral: EphemeralStore, durable: DurableStore, stats: Arc<AccessStats>) -> Self {
        Self {
            ephemeral,
            durable,
            stats,
        }
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self, user_id: Option<&str>) -> Source {
        let mode = match self.ephemeral.data_mode().await {
            Ok(mode) => mode,
            Err(err) => {
                warn!(%err, "mode preference unreadable, assuming automatic");
                DataMode::Automatic
            }
        };

        let source = match (mode, user_id) {
            (DataMode::ForcedEphemeral, _) => Source::Ephemeral,
            (DataMode::ForcedDurable, _) => Source::Durable,
            (DataMode::Automatic, None) => Source::Ephemeral,
            (DataMode::Automatic, Some(user_id)) => match self.durable.has_progress(user_id).await {
                Ok(true) => Source::Durable,
                Ok(false) => Source::Ephemeral,
                Err(err) => {
                    self.stats.record_fail_open();
                    warn!(user_id, %err, "durable probe failed, using ephemeral store");
                    Source::Ephemeral
                }
            },
        };
        debug!(%mode, %source, "source resolved");
        source
    }
}
