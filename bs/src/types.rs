//! Build-settings data model

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

/// Source language of a document, as far as build settings care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Language {
    C,
    Cpp,
    ObjectiveC,
    ObjectiveCpp,
    Swift,
}

impl Language {
    pub fn is_c_family(&self) -> bool {
        !matches!(self, Self::Swift)
    }

    /// The `-x` dialect that makes a compiler driver treat a file as a
    /// header of this language. `None` for languages without header files.
    pub fn header_dialect(&self) -> Option<&'static str> {
        match self {
            Self::C => Some("c-header"),
            Self::Cpp => Some("c++-header"),
            Self::ObjectiveC => Some("objective-c-header"),
            Self::ObjectiveCpp => Some("objective-c++-header"),
            Self::Swift => None,
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::C => write!(f, "c"),
            Self::Cpp => write!(f, "c++"),
            Self::ObjectiveC => write!(f, "objective-c"),
            Self::ObjectiveCpp => write!(f, "objective-c++"),
            Self::Swift => write!(f, "swift"),
        }
    }
}

/// Compiler arguments for one translation unit.
///
/// Settings are immutable values: an update always replaces the whole
/// record, never patches it in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSettings {
    pub compiler_arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
}

impl BuildSettings {
    pub fn new(compiler_arguments: Vec<String>) -> Self {
        Self {
            compiler_arguments,
            working_directory: None,
        }
    }

    pub fn with_working_directory(mut self, working_directory: PathBuf) -> Self {
        self.working_directory = Some(working_directory);
        self
    }

    /// Rewrite settings derived for `main_file` so they apply to `uri`.
    ///
    /// Every argument that names the main file is replaced with the
    /// requested file, preserving argument order, and for C-family languages
    /// a header dialect flag is inserted at the head so the driver picks the
    /// right dialect for the header.
    pub fn patched(&self, main_file: &Url, uri: &Url, language: Language) -> BuildSettings {
        let main_path = argument_path(main_file);
        let uri_path = argument_path(uri);

        let mut compiler_arguments: Vec<String> = self
            .compiler_arguments
            .iter()
            .map(|argument| {
                if *argument == main_path {
                    uri_path.clone()
                } else {
                    argument.clone()
                }
            })
            .collect();

        if let Some(dialect) = language.header_dialect() {
            compiler_arguments.insert(0, format!("-x{}", dialect));
        }

        BuildSettings {
            compiler_arguments,
            working_directory: self.working_directory.clone(),
        }
    }
}

/// The path string a compiler invocation would use for a document.
pub(crate) fn argument_path(uri: &Url) -> String {
    match uri.to_file_path() {
        Ok(path) => path.display().to_string(),
        Err(()) => uri.path().to_string(),
    }
}

/// How the settings for a watched URI changed, from a consumer's view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsChange {
    /// No layer can produce settings for the URI anymore.
    RemovedOrUnavailable,
    /// Settings were synthesized without knowledge of the real build;
    /// consumers should treat the arguments as approximate.
    Fallback(BuildSettings),
    /// Authoritative settings.
    Modified(BuildSettings),
}

/// Kind of a file-system or target change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventKind {
    Created,
    Changed,
    Deleted,
}

/// A watched-file change forwarded to the underlying build systems.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub uri: Url,
    pub kind: FileEventKind,
}

/// A build-target change reported by the underlying build system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTargetEvent {
    pub target: String,
    pub kind: FileEventKind,
}

/// Notification delivered to the manager's consumer.
///
/// Settings notifications carry the set of affected watched URIs rather than
/// a snapshot of the new settings; consumers re-query, which rules out the
/// stale-snapshot class of bugs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsEvent {
    /// Build settings for these watched URIs may have changed.
    FileBuildSettingsChanged(HashSet<Url>),
    /// Dependencies of these watched URIs were updated. An empty set means
    /// every watched URI may be affected.
    FilesDependenciesUpdated(HashSet<Url>),
    BuildTargetsChanged(Vec<BuildTargetEvent>),
    FileHandlingCapabilityChanged,
}
