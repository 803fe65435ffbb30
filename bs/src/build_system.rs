//! Collaborator interfaces consumed by the settings manager

use std::collections::HashSet;

use async_trait::async_trait;
use eyre::Result;
use url::Url;

use crate::types::{BuildSettings, FileEvent, Language};

/// An underlying source of build settings (a build server, a compilation
/// database, a synthesized fallback).
///
/// Failures to produce settings are not fatal to callers: the manager
/// layers systems and falls through on error.
#[async_trait]
pub trait BuildSystem: Send + Sync {
    /// Settings for a main file, if this system knows the file.
    async fn build_settings(&self, uri: &Url, language: Language) -> Result<Option<BuildSettings>>;

    /// Start reporting settings changes for a main file.
    async fn register_for_change_notifications(&self, uri: &Url, language: Language);

    /// Stop reporting settings changes for a main file.
    async fn unregister_for_change_notifications(&self, uri: &Url);

    /// Watched files changed on disk.
    async fn files_did_change(&self, events: &[FileEvent]);
}

/// Maps a file onto the main files whose compilation includes it.
///
/// A header has no settings of its own; the provider names the translation
/// units it is compiled into. May return the URI itself.
#[async_trait]
pub trait MainFilesProvider: Send + Sync {
    async fn main_files_containing_file(&self, uri: &Url) -> HashSet<Url>;
}
