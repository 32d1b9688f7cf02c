//! Laser power synchronisation.
//!
//! The acquisition software does not store laser powers in its configuration bundles,
//! so the experiment record carries them and they are pushed back onto the
//! illumination sliders when a session starts.
//!
//! Channel ids are resolved through the [`LaserChannelMap`] given at construction. An
//! unknown id resolves to nothing: `get` reads `None` and `set` is a logged no-op.

use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::LaserChannelMap;
use crate::error::AppResult;
use crate::instrument::Microscope;

/// Reads and writes laser intensities by logical channel id.
pub struct LaserPowerSync<'a, M: Microscope + ?Sized> {
    scope: &'a M,
    channels: LaserChannelMap,
    panel_settle: Duration,
}

impl<'a, M: Microscope + ?Sized> LaserPowerSync<'a, M> {
    /// Sync over `scope` using the given channel table.
    pub fn new(scope: &'a M, channels: LaserChannelMap, panel_settle: Duration) -> Self {
        Self {
            scope,
            channels,
            panel_settle,
        }
    }

    /// The channel table in use.
    pub fn channels(&self) -> &LaserChannelMap {
        &self.channels
    }

    /// Intensity of channel `id`, or `None` for an unknown channel.
    pub async fn get(&self, id: &str) -> AppResult<Option<f64>> {
        match self.channels.slider(id) {
            Some(slider) => Ok(Some(self.scope.slider(slider).await?)),
            None => Ok(None),
        }
    }

    /// Sets channel `id` to `value`. Unknown channels are ignored.
    pub async fn set(&self, id: &str, value: f64) -> AppResult<()> {
        match self.channels.slider(id) {
            Some(slider) => {
                debug!("Laser {} ({}) -> {}", id, slider, value);
                self.scope.set_slider(slider, value).await
            }
            None => {
                debug!("Ignoring unknown laser channel '{}'", id);
                Ok(())
            }
        }
    }

    /// Applies every entry of `powers`, then refreshes the panel once.
    ///
    /// The panel only shows new slider values after it is reopened, so it is hidden,
    /// given `panel_settle` to catch up, and shown again.
    pub async fn sync_all(&self, powers: &BTreeMap<String, f64>) -> AppResult<()> {
        for (id, value) in powers {
            self.set(id, *value).await?;
        }
        self.scope.hide_panel().await?;
        tokio::time::sleep(self.panel_settle).await;
        self.scope.show_panel().await?;
        info!("Restored {} laser power setting(s)", powers.len());
        Ok(())
    }

    /// Intensities of all known channels.
    pub async fn read_all(&self) -> AppResult<BTreeMap<String, f64>> {
        let mut powers = BTreeMap::new();
        for channel in self.channels.channels() {
            let value = self.scope.slider(&channel.slider).await?;
            powers.insert(channel.id.clone(), value);
        }
        Ok(powers)
    }
}
