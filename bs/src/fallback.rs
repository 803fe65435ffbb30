//! Synthesized settings for files no build system knows

use async_trait::async_trait;
use eyre::Result;
use tracing::debug;
use url::Url;

use crate::build_system::BuildSystem;
use crate::types::{argument_path, BuildSettings, FileEvent, Language};

/// A build system of last resort.
///
/// Synthesizes a plausible argument list (configured base arguments plus the
/// file itself) without any knowledge of the real build. It never fails and
/// tracks no registrations; change notifications cannot originate here.
#[derive(Debug, Default)]
pub struct FallbackBuildSystem {
    base_arguments: Vec<String>,
}

impl FallbackBuildSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend the given arguments (e.g. SDK or include paths from the
    /// toolchain) to every synthesized argument list.
    pub fn with_base_arguments(base_arguments: Vec<String>) -> Self {
        Self { base_arguments }
    }
}

#[async_trait]
impl BuildSystem for FallbackBuildSystem {
    async fn build_settings(&self, uri: &Url, language: Language) -> Result<Option<BuildSettings>> {
        debug!(%uri, %language, "FallbackBuildSystem: synthesizing settings");
        let mut compiler_arguments = self.base_arguments.clone();
        compiler_arguments.push(argument_path(uri));
        Ok(Some(BuildSettings::new(compiler_arguments)))
    }

    async fn register_for_change_notifications(&self, uri: &Url, _language: Language) {
        debug!(%uri, "FallbackBuildSystem: registration is a no-op");
    }

    async fn unregister_for_change_notifications(&self, uri: &Url) {
        debug!(%uri, "FallbackBuildSystem: unregistration is a no-op");
    }

    async fn files_did_change(&self, _events: &[FileEvent]) {}
}
