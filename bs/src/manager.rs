//! Layered build-settings manager

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use url::Url;

use crate::build_system::{BuildSystem, MainFilesProvider};
use crate::types::{BuildSettings, BuildTargetEvent, FileEvent, Language, SettingsChange, SettingsEvent};

/// Per-watched-URI bookkeeping.
struct Watch {
    main_file: Url,
    language: Language,
}

/// State behind the manager's mutex. Transitions are short and never
/// suspend; calls into the underlying systems happen outside the lock.
struct ManagerState {
    watched: HashMap<Url, Watch>,
    /// Watcher counts per main file. A main file is registered with the
    /// primary system on the 0 -> 1 edge and unregistered on the 1 -> 0 edge.
    main_file_refs: HashMap<Url, usize>,
}

/// A single, stable view of per-URI build settings over a layered pair of
/// build systems.
///
/// The manager maps secondary files (headers) onto main files that actually
/// have settings, caches the watched-file mapping, refcounts registrations
/// on the underlying primary system, and fans settings changes back out to
/// watched URIs.
///
/// Notifications reach the consumer through the channel returned by
/// [`BuildSettingsManager::new`]; nothing of the consumer's ever runs under
/// the manager's lock.
pub struct BuildSettingsManager {
    primary: Option<Arc<dyn BuildSystem>>,
    fallback: Option<Arc<dyn BuildSystem>>,
    main_files: Arc<dyn MainFilesProvider>,
    state: Mutex<ManagerState>,
    events_tx: mpsc::UnboundedSender<SettingsEvent>,
}

impl BuildSettingsManager {
    /// Build a manager over `(primary, fallback)` and return the consumer's
    /// end of the notification channel.
    pub fn new(
        primary: Option<Arc<dyn BuildSystem>>,
        fallback: Option<Arc<dyn BuildSystem>>,
        main_files: Arc<dyn MainFilesProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<SettingsEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            primary,
            fallback,
            main_files,
            state: Mutex::new(ManagerState {
                watched: HashMap::new(),
                main_file_refs: HashMap::new(),
            }),
            events_tx,
        };
        (manager, events_rx)
    }

    /// Settings for a URI, inferred through its main file when the URI has
    /// none of its own. The flag is `true` when the settings came from the
    /// fallback layered under a primary and should be treated as approximate.
    ///
    /// Resolution is recursive: when the chosen main file itself has a
    /// distinct main file (a header included by an umbrella header included
    /// by a translation unit), resolution follows the chain to its end
    /// before querying the layers, and the resulting arguments are patched
    /// to apply to the requested URI.
    ///
    /// Returns `None` only when no layer can produce settings.
    pub async fn build_settings_inferred_from_main_file(
        &self,
        uri: &Url,
        language: Language,
    ) -> Option<(BuildSettings, bool)> {
        // Walk the main-file chain to its fixed point. The visited set
        // guards against provider cycles; on a cycle, resolution settles on
        // the last file reached before the repeat.
        let mut visited = HashSet::from([uri.clone()]);
        let mut main_file = uri.clone();
        loop {
            let next = self.main_file_for(&main_file).await;
            if !visited.insert(next.clone()) {
                break;
            }
            debug!(%uri, from = %main_file, to = %next, "following main-file chain");
            main_file = next;
        }

        let (settings, is_fallback) = self.settings_from_layers(&main_file, language).await?;
        if main_file != *uri {
            return Some((settings.patched(&main_file, uri, language), is_fallback));
        }
        Some((settings, is_fallback))
    }

    /// Re-query helper for consumers reacting to a settings notification.
    pub async fn settings_change(&self, uri: &Url, language: Language) -> SettingsChange {
        match self.build_settings_inferred_from_main_file(uri, language).await {
            Some((settings, true)) => SettingsChange::Fallback(settings),
            Some((settings, false)) => SettingsChange::Modified(settings),
            None => SettingsChange::RemovedOrUnavailable,
        }
    }

    /// Watch a URI for settings changes.
    ///
    /// Chooses a main file, forwards registration for it to the primary
    /// system when this is its first watcher, and always delivers an initial
    /// notification for the URI; consumers re-query and observe
    /// [`SettingsChange::RemovedOrUnavailable`] when nothing can produce
    /// settings yet.
    pub async fn register_for_change_notifications(&self, uri: &Url, language: Language) {
        let candidates = self.main_files.main_files_containing_file(uri).await;
        let main_file = choose_main_file(uri, None, &candidates);
        debug!(%uri, %main_file, "registering for change notifications");

        let register_main = {
            let mut state = self.state.lock().await;
            if state.watched.contains_key(uri) {
                warn!(%uri, "already registered for change notifications, ignoring");
                return;
            }
            state.watched.insert(
                uri.clone(),
                Watch {
                    main_file: main_file.clone(),
                    language,
                },
            );
            let refs = state.main_file_refs.entry(main_file.clone()).or_insert(0);
            *refs += 1;
            *refs == 1
        };

        if register_main {
            if let Some(primary) = &self.primary {
                primary.register_for_change_notifications(&main_file, language).await;
            }
        }

        self.emit(SettingsEvent::FileBuildSettingsChanged(HashSet::from([uri.clone()])));
    }

    /// Drop the watch on a URI. Unregistration is forwarded to the primary
    /// system only when this was the last watcher of the underlying main
    /// file.
    pub async fn unregister_for_change_notifications(&self, uri: &Url) {
        let unregister_main = {
            let mut state = self.state.lock().await;
            let Some(watch) = state.watched.remove(uri) else {
                warn!(%uri, "unregister for a URI that was never registered, ignoring");
                return;
            };
            match state.main_file_refs.get_mut(&watch.main_file) {
                Some(refs) if *refs > 1 => {
                    *refs -= 1;
                    None
                }
                _ => {
                    state.main_file_refs.remove(&watch.main_file);
                    Some(watch.main_file)
                }
            }
        };

        if let Some(main_file) = unregister_main {
            debug!(%uri, %main_file, "last watcher dropped, unregistering main file");
            if let Some(primary) = &self.primary {
                primary.unregister_for_change_notifications(&main_file).await;
            }
        }
    }

    /// Forward file-system changes to both layers.
    pub async fn files_did_change(&self, events: &[FileEvent]) {
        if let Some(primary) = &self.primary {
            primary.files_did_change(events).await;
        }
        if let Some(fallback) = &self.fallback {
            fallback.files_did_change(events).await;
        }
    }

    /// The underlying system reported changed settings for a set of main
    /// files. Maps them back to the watched URIs and issues one
    /// notification. An empty input set means every watched URI.
    pub async fn file_build_settings_changed(&self, changed_main_files: &HashSet<Url>) {
        let affected = self.watched_uris_for_main_files(changed_main_files).await;
        if affected.is_empty() {
            return;
        }
        self.emit(SettingsEvent::FileBuildSettingsChanged(affected));
    }

    /// The underlying system reported updated dependencies for a set of main
    /// files. An empty input set passes through empty, meaning "assume all
    /// watched URIs are affected".
    pub async fn files_dependencies_updated(&self, changed_main_files: &HashSet<Url>) {
        if changed_main_files.is_empty() {
            self.emit(SettingsEvent::FilesDependenciesUpdated(HashSet::new()));
            return;
        }
        let affected = self.watched_uris_for_main_files(changed_main_files).await;
        if affected.is_empty() {
            return;
        }
        self.emit(SettingsEvent::FilesDependenciesUpdated(affected));
    }

    /// Pass-through from the underlying system.
    pub fn build_targets_changed(&self, events: Vec<BuildTargetEvent>) {
        self.emit(SettingsEvent::BuildTargetsChanged(events));
    }

    /// Pass-through from the underlying system.
    pub fn file_handling_capability_changed(&self) {
        self.emit(SettingsEvent::FileHandlingCapabilityChanged);
    }

    /// The file-to-main-file mapping may have changed: re-evaluate every
    /// watch with the stability-preserving policy, fix up registrations, and
    /// report retargeted watches as a settings change.
    pub async fn main_files_changed(&self) {
        let watches: Vec<(Url, Url, Language)> = {
            let state = self.state.lock().await;
            state
                .watched
                .iter()
                .map(|(uri, watch)| (uri.clone(), watch.main_file.clone(), watch.language))
                .collect()
        };

        // Provider queries happen outside the lock; re-validate each watch
        // against the state before committing the retarget.
        let mut retargets = Vec::new();
        for (uri, previous, language) in watches {
            let candidates = self.main_files.main_files_containing_file(&uri).await;
            let chosen = choose_main_file(&uri, Some(&previous), &candidates);
            if chosen != previous {
                retargets.push((uri, previous, chosen, language));
            }
        }
        if retargets.is_empty() {
            return;
        }

        let mut to_register = Vec::new();
        let mut to_unregister = Vec::new();
        let mut changed = HashSet::new();
        {
            let mut state = self.state.lock().await;
            for (uri, previous, new_main, language) in retargets {
                let Some(watch) = state.watched.get_mut(&uri) else {
                    continue;
                };
                if watch.main_file != previous {
                    continue;
                }
                watch.main_file = new_main.clone();
                debug!(%uri, from = %previous, to = %new_main, "watch retargeted to a new main file");

                let refs = state.main_file_refs.entry(new_main.clone()).or_insert(0);
                *refs += 1;
                if *refs == 1 {
                    to_register.push((new_main, language));
                }
                match state.main_file_refs.get_mut(&previous) {
                    Some(refs) if *refs > 1 => *refs -= 1,
                    _ => {
                        state.main_file_refs.remove(&previous);
                        to_unregister.push(previous);
                    }
                }
                changed.insert(uri);
            }
        }

        if let Some(primary) = &self.primary {
            for (main_file, language) in &to_register {
                primary.register_for_change_notifications(main_file, *language).await;
            }
            for main_file in &to_unregister {
                primary.unregister_for_change_notifications(main_file).await;
            }
        }

        if !changed.is_empty() {
            self.emit(SettingsEvent::FileBuildSettingsChanged(changed));
        }
    }

    /// Watched URIs whose recorded main file is in the given set; every
    /// watched URI when the set is empty.
    async fn watched_uris_for_main_files(&self, main_files: &HashSet<Url>) -> HashSet<Url> {
        let state = self.state.lock().await;
        if main_files.is_empty() {
            return state.watched.keys().cloned().collect();
        }
        state
            .watched
            .iter()
            .filter(|(_, watch)| main_files.contains(&watch.main_file))
            .map(|(uri, _)| uri.clone())
            .collect()
    }

    /// The main file a settings query for `uri` should go through: the
    /// recorded one for watched URIs, a freshly chosen one otherwise.
    async fn main_file_for(&self, uri: &Url) -> Url {
        if let Some(watch) = self.state.lock().await.watched.get(uri) {
            return watch.main_file.clone();
        }
        let candidates = self.main_files.main_files_containing_file(uri).await;
        choose_main_file(uri, None, &candidates)
    }

    /// Primary first, fallback second. A primary failure is not an error;
    /// the fallback answer is flagged approximate only when a primary
    /// exists to be approximate relative to.
    async fn settings_from_layers(&self, uri: &Url, language: Language) -> Option<(BuildSettings, bool)> {
        if let Some(primary) = &self.primary {
            match primary.build_settings(uri, language).await {
                Ok(Some(settings)) => return Some((settings, false)),
                Ok(None) => {}
                Err(error) => {
                    debug!(%uri, %error, "primary build system failed to produce settings, falling back");
                }
            }
        }
        if let Some(fallback) = &self.fallback {
            match fallback.build_settings(uri, language).await {
                Ok(Some(settings)) => return Some((settings, self.primary.is_some())),
                Ok(None) => {}
                Err(error) => {
                    debug!(%uri, %error, "fallback build system failed to produce settings");
                }
            }
        }
        None
    }

    fn emit(&self, event: SettingsEvent) {
        // Fire-and-forget: a consumer that went away is not an error.
        let _ = self.events_tx.send(event);
    }
}

/// Main-file selection policy.
///
/// Stability first: a previous choice that is still a candidate is kept.
/// Otherwise the URI stands for itself when the candidate set is empty or
/// contains it; otherwise the smallest candidate wins, so the choice is
/// deterministic across calls.
fn choose_main_file(uri: &Url, previous: Option<&Url>, candidates: &HashSet<Url>) -> Url {
    if let Some(previous) = previous {
        if candidates.contains(previous) {
            return previous.clone();
        }
    }
    if candidates.is_empty() || candidates.contains(uri) {
        return uri.clone();
    }
    candidates
        .iter()
        .min_by(|a, b| a.as_str().cmp(b.as_str()))
        .cloned()
        .unwrap_or_else(|| uri.clone())
}
