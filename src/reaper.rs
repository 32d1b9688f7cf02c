//! Result window reaping.
//!
//! Every capture opens a result window. Over a long unattended run they would pile up, so
//! after each cycle the reaper closes every window from an older iteration and keeps the
//! newest iteration open for the operator.
//!
//! Windows are tracked in a [`WindowHandleSet`] keyed by `(phase, iteration)`, filled by
//! the acquisition runner as captures finish. For windows the runner never saw, a set can
//! also be rebuilt from display names (`<tag>-...-<iteration>`), see
//! [`WindowNamePattern`].

use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::error::{AppResult, TimelapseError};
use crate::experiment::Phase;
use crate::instrument::{Microscope, WindowId, WindowInfo};

/// A tracked result window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowHandle {
    /// Phase that produced the window.
    pub phase: Phase,
    /// Iteration (1-based cycle number) that produced the window.
    pub iteration: u32,
    /// Instrument window id.
    pub id: WindowId,
}

/// Open result windows grouped by iteration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WindowHandleSet {
    handles: Vec<WindowHandle>,
}

impl WindowHandleSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks window `id` as produced by `phase` in `iteration`. Re-inserting an id
    /// replaces its previous entry.
    pub fn insert(&mut self, phase: Phase, iteration: u32, id: WindowId) {
        self.handles.retain(|h| h.id != id);
        self.handles.push(WindowHandle {
            phase,
            iteration,
            id,
        });
    }

    /// Number of tracked windows.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Highest tracked iteration.
    pub fn max_iteration(&self) -> Option<u32> {
        self.handles.iter().map(|h| h.iteration).max()
    }

    /// Windows tracked for `iteration`, in insertion order.
    pub fn iteration(&self, iteration: u32) -> Vec<WindowHandle> {
        self.handles
            .iter()
            .filter(|h| h.iteration == iteration)
            .copied()
            .collect()
    }

    /// Windows older than the newest iteration.
    pub fn stale(&self) -> Vec<WindowHandle> {
        match self.max_iteration() {
            Some(max) => self
                .handles
                .iter()
                .filter(|h| h.iteration < max)
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }

    fn remove(&mut self, id: WindowId) {
        self.handles.retain(|h| h.id != id);
    }
}

/// Parses `(phase, iteration)` out of window display names.
///
/// A name matches when it starts with one of the two phase tags followed by a dash and
/// ends in a dash-delimited integer, e.g. `A1-cells-12` or `A2-3`.
#[derive(Clone, Debug)]
pub struct WindowNamePattern {
    regex: Regex,
    tag_a1: String,
}

impl WindowNamePattern {
    /// Pattern for the given phase tags.
    pub fn new(tag_a1: &str, tag_a2: &str) -> AppResult<Self> {
        let pattern = format!(
            r"^(?P<tag>{}|{})-(?:.*-)?(?P<iter>\d+)$",
            regex::escape(tag_a1),
            regex::escape(tag_a2)
        );
        let regex = Regex::new(&pattern).map_err(|e| {
            TimelapseError::Configuration(format!("invalid window name pattern: {e}"))
        })?;
        Ok(Self {
            regex,
            tag_a1: tag_a1.to_string(),
        })
    }

    /// `(phase, iteration)` encoded in `name`, if it matches.
    pub fn parse(&self, name: &str) -> Option<(Phase, u32)> {
        let caps = self.regex.captures(name)?;
        let iteration = caps.name("iter")?.as_str().parse().ok()?;
        let phase = if caps.name("tag")?.as_str() == self.tag_a1 {
            Phase::A1
        } else {
            Phase::A2
        };
        Some((phase, iteration))
    }

    /// Set of every window whose name matches. Others are left out.
    pub fn handle_set(&self, windows: &[WindowInfo]) -> WindowHandleSet {
        let mut set = WindowHandleSet::new();
        for window in windows {
            if let Some((phase, iteration)) = self.parse(&window.name) {
                set.insert(phase, iteration, window.id);
            }
        }
        set
    }

    /// Names among `names` that belong to an older iteration than the newest one.
    pub fn stale_names<'n>(&self, names: &[&'n str]) -> Vec<&'n str> {
        let parsed: Vec<(&str, u32)> = names
            .iter()
            .filter_map(|name| self.parse(name).map(|(_, it)| (*name, it)))
            .collect();
        let Some(max) = parsed.iter().map(|(_, it)| *it).max() else {
            return Vec::new();
        };
        parsed
            .into_iter()
            .filter(|(_, it)| *it < max)
            .map(|(name, _)| name)
            .collect()
    }
}

/// Closes result windows from older iterations.
#[derive(Clone, Debug)]
pub struct WindowReaper {
    pattern: WindowNamePattern,
}

impl WindowReaper {
    /// Reaper recognising windows of the given phase tags by name.
    pub fn new(pattern: WindowNamePattern) -> Self {
        Self { pattern }
    }

    /// Closes every tracked window older than the newest iteration and forgets it.
    ///
    /// Windows that are no longer open (closed by the operator) are dropped from the set
    /// without a close call. A failed close is logged and the window forgotten. Returns the
    /// number of windows closed.
    pub async fn reap<M: Microscope + ?Sized>(
        &self,
        scope: &M,
        set: &mut WindowHandleSet,
    ) -> AppResult<usize> {
        let stale = set.stale();
        if stale.is_empty() {
            return Ok(0);
        }
        let open: HashSet<WindowId> = scope.open_windows().await?.iter().map(|w| w.id).collect();

        let mut closed = 0;
        for handle in stale {
            if open.contains(&handle.id) {
                match scope.close_window(handle.id).await {
                    Ok(()) => closed += 1,
                    Err(e) => warn!("Could not close window {}: {}", handle.id, e),
                }
            } else {
                debug!("Window {} already closed", handle.id);
            }
            set.remove(handle.id);
        }
        if closed > 0 {
            info!("Closed {} result window(s) from earlier cycles", closed);
        }
        Ok(closed)
    }

    /// Name-based reaping over all open windows.
    ///
    /// Windows whose names do not carry a phase tag and iteration are left alone.
    pub async fn reap_by_name<M: Microscope + ?Sized>(&self, scope: &M) -> AppResult<usize> {
        let windows = scope.open_windows().await?;
        let mut set = self.pattern.handle_set(&windows);
        self.reap(scope, &mut set).await
    }
}
