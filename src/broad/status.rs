use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    #[default]
    NotBuilt,
    Building,
    Ready,
    Error,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotBuilt => "not_built",
            Self::Building => "building",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }

    /// Whether a start request should launch a new build from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::NotBuilt | Self::Error)
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snapshot of the broad index lifecycle, safe to hand to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStatus {
    pub state: BuildState,
    pub progress: u8,
    #[serde(rename = "n_spectra")]
    pub spectra_count: usize,
    pub message: String,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for BuildStatus {
    fn default() -> Self {
        Self {
            state: BuildState::NotBuilt,
            progress: 0,
            spectra_count: 0,
            message: "Index not built yet. Start a build to create it.".to_string(),
            error: None,
            updated_at: Utc::now(),
        }
    }
}

impl BuildStatus {
    pub(crate) fn begin(&mut self) {
        self.state = BuildState::Building;
        self.progress = 0;
        self.message = "Starting build…".to_string();
        self.error = None;
        self.updated_at = Utc::now();
    }

    /// Move progress forward. Progress never decreases while building.
    pub(crate) fn advance<S: Into<String>>(&mut self, progress: u8, message: S) {
        self.progress = self.progress.max(progress.min(100));
        self.message = message.into();
        self.updated_at = Utc::now();
    }

    pub(crate) fn ready(&mut self, spectra_count: usize) {
        self.state = BuildState::Ready;
        self.progress = 100;
        self.spectra_count = spectra_count;
        self.message = format!("Index ready, {spectra_count} spectra.");
        self.error = None;
        self.updated_at = Utc::now();
    }

    pub(crate) fn failed<S: ToString>(&mut self, error: S) {
        let error = error.to_string();
        self.state = BuildState::Error;
        self.progress = 0;
        self.message = format!("Build failed: {error}");
        self.error = Some(error);
        self.updated_at = Utc::now();
    }
}
