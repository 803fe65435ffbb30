//! buildsettings - layered per-file build settings for a language-server host
//!
//! Clients want compiler arguments for any file an editor can open; build
//! systems only know about main files (translation units). This crate sits
//! between the two:
//!
//! - **Layering**: a primary build system answers first; a fallback
//!   synthesizes approximate settings when the primary cannot.
//! - **Main-file inference**: headers and other secondary files are mapped
//!   onto a main file via a [`MainFilesProvider`], and the main file's
//!   arguments are patched to apply to the requested file.
//! - **Change notifications**: watched URIs are refcounted per main file,
//!   registered with the underlying system exactly once, and settings
//!   changes fan back out to the affected watchers over a channel.
//!
//! # Modules
//!
//! - [`manager`] - the [`BuildSettingsManager`]
//! - [`build_system`] - collaborator traits
//! - [`fallback`] - the build system of last resort
//! - [`types`] - settings, languages, events

pub mod build_system;
pub mod fallback;
pub mod manager;
pub mod types;

// Re-export commonly used types
pub use build_system::{BuildSystem, MainFilesProvider};
pub use fallback::FallbackBuildSystem;
pub use manager::BuildSettingsManager;
pub use types::{
    BuildSettings, BuildTargetEvent, FileEvent, FileEventKind, Language, SettingsChange, SettingsEvent,
};
