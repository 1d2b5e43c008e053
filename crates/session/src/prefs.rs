use std::sync::Arc;

use vellum_cache::Cache;

/// Cache key holding the selected theme preset name.
pub const THEME_PRESET_KEY: &str = "themePreset";
/// Cache key holding the sidebar-open flag.
pub const SIDEBAR_TOGGLE_KEY: &str = "sidebarToggle";

/// UI preference persistence over dedicated cache keys, each independently
/// removable.
pub struct UiPrefs {
    cache: Arc<dyn Cache>,
}

impl UiPrefs {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    pub fn theme_preset(&self) -> Option<String> {
        self.cache
            .get(THEME_PRESET_KEY)
            .filter(|preset| !preset.is_empty())
    }

    pub fn set_theme_preset(&self, preset: &str) {
        if preset.is_empty() {
            self.cache.remove(THEME_PRESET_KEY);
        } else {
            self.cache.set(THEME_PRESET_KEY, preset);
        }
    }

    /// Sidebar defaults to open when nothing is stored.
    pub fn sidebar_open(&self) -> bool {
        match self.cache.get(SIDEBAR_TOGGLE_KEY).as_deref() {
            Some("false") => false,
            Some(_) | None => true,
        }
    }

    pub fn set_sidebar_open(&self, open: bool) {
        self.cache
            .set(SIDEBAR_TOGGLE_KEY, if open { "true" } else { "false" });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_cache::MemoryCache;

    #[test]
    fn theme_preset_round_trips_and_clears() {
        let cache = Arc::new(MemoryCache::new());
        let prefs = UiPrefs::new(Arc::clone(&cache) as Arc<dyn Cache>);

        assert_eq!(prefs.theme_preset(), None);
        prefs.set_theme_preset("dusk");
        assert_eq!(prefs.theme_preset().as_deref(), Some("dusk"));

        prefs.set_theme_preset("");
        assert_eq!(prefs.theme_preset(), None);
        assert_eq!(cache.get(THEME_PRESET_KEY), None);
    }

    #[test]
    fn sidebar_defaults_to_open() {
        let cache = Arc::new(MemoryCache::new());
        let prefs = UiPrefs::new(cache);

        assert!(prefs.sidebar_open());
        prefs.set_sidebar_open(false);
        assert!(!prefs.sidebar_open());
        prefs.set_sidebar_open(true);
        assert!(prefs.sidebar_open());
    }
}
