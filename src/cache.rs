//! Weak caches for constant resource state, keyed by resource id and
//! optionally by the theme the state was resolved against.
//!
//! Entries hold [`Weak`] references, so the cache never keeps a value
//! alive on its own; a hit requires someone else to still own the `Arc`.
//! Configuration changes sweep out entries whose declared sensitivity
//! intersects the changed axes, along with anything already dropped.

use bitflags::bitflags;
use log::trace;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

bitflags! {
    /// Configuration axes a cached value may depend on. Matches the
    /// public `ActivityInfo` change bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ConfigChanges: u32 {
        const MCC = 0x0001;
        const MNC = 0x0002;
        const LOCALE = 0x0004;
        const TOUCHSCREEN = 0x0008;
        const KEYBOARD = 0x0010;
        const KEYBOARD_HIDDEN = 0x0020;
        const NAVIGATION = 0x0040;
        const ORIENTATION = 0x0080;
        const SCREEN_LAYOUT = 0x0100;
        const UI_MODE = 0x0200;
        const SCREEN_SIZE = 0x0400;
        const SMALLEST_SCREEN_SIZE = 0x0800;
        const DENSITY = 0x1000;
        const LAYOUT_DIRECTION = 0x2000;
        const COLOR_MODE = 0x4000;
        const FONT_SCALE = 0x4000_0000;
        const ASSET_PATHS = 0x8000_0000;
    }
}

/// Decides whether a cached value survives a configuration change.
pub trait ConfigSensitive {
    fn should_invalidate(&self, changes: ConfigChanges) -> bool;
}

/// Identity of a theme as the ordered list of styles applied to it.
/// Two themes with the same style history resolve attributes identically
/// and share cache entries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ThemeKey {
    applied: Vec<(u32, bool)>,
}

impl ThemeKey {
    pub fn new() -> ThemeKey {
        ThemeKey::default()
    }

    /// Records one `applyStyle(style, force)` step.
    pub fn apply_style(&mut self, style: u32, force: bool) {
        self.applied.push((style, force));
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}

struct CacheState<V> {
    /// Entries resolved against a concrete theme, bucketed by theme key.
    themed: HashMap<ThemeKey, HashMap<u64, Weak<V>>>,
    /// Entries resolved against an empty (default-constructed) theme.
    null_themed: HashMap<u64, Weak<V>>,
    /// Entries resolved with no theme at all.
    unthemed: HashMap<u64, Weak<V>>,
}

impl<V> Default for CacheState<V> {
    fn default() -> Self {
        CacheState {
            themed: HashMap::new(),
            null_themed: HashMap::new(),
            unthemed: HashMap::new(),
        }
    }
}

/// Weak-value cache with separate buckets for unthemed entries, entries
/// for the empty theme, and one bucket per distinct theme key.
pub struct ThemedCache<V> {
    state: Mutex<CacheState<V>>,
}

impl<V> Default for ThemedCache<V> {
    fn default() -> Self {
        ThemedCache::new()
    }
}

impl<V> ThemedCache<V> {
    pub fn new() -> ThemedCache<V> {
        ThemedCache {
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a weak reference to `value`. `uses_theme` is false when the
    /// value was resolved without consulting the theme at all; such
    /// entries go to the unthemed bucket regardless of `theme`.
    pub fn put(&self, key: u64, theme: Option<&ThemeKey>, value: &Arc<V>, uses_theme: bool) {
        let mut state = self.lock();
        let entries = if !uses_theme {
            &mut state.unthemed
        } else {
            match theme {
                Some(theme) if !theme.is_empty() => state.themed.entry(theme.clone()).or_default(),
                // A missing theme and a default-constructed one resolve
                // identically and share the null-themed bucket.
                _ => &mut state.null_themed,
            }
        };
        entries.insert(key, Arc::downgrade(value));
    }

    /// Looks the key up for the given theme. A themed lookup only probes
    /// that theme's bucket; an unthemed lookup probes the unthemed bucket
    /// first and falls back to the empty-theme bucket.
    pub fn get(&self, key: u64, theme: Option<&ThemeKey>) -> Option<Arc<V>> {
        let state = self.lock();
        match theme {
            Some(theme) if !theme.is_empty() => state
                .themed
                .get(theme)
                .and_then(|entries| entries.get(&key))
                .and_then(Weak::upgrade),
            _ => state
                .unthemed
                .get(&key)
                .and_then(Weak::upgrade)
                .or_else(|| state.null_themed.get(&key).and_then(Weak::upgrade)),
        }
    }

    /// Evicts every entry whose value is gone or for which the predicate
    /// says the changed axes invalidate it. Emptied theme buckets are
    /// removed. The predicate is the specializing cache's to supply.
    pub fn prune(&self, changes: ConfigChanges, should_invalidate: impl Fn(&V, ConfigChanges) -> bool) {
        let mut state = self.lock();
        let survives = |entry: &Weak<V>| match entry.upgrade() {
            Some(value) => !should_invalidate(&value, changes),
            None => false,
        };
        state.unthemed.retain(|_, entry| survives(entry));
        state.null_themed.retain(|_, entry| survives(entry));
        for entries in state.themed.values_mut() {
            entries.retain(|_, entry| survives(entry));
        }
        state.themed.retain(|_, entries| !entries.is_empty());
        trace!("themed cache swept for changes {changes:?}");
    }

    /// Drops every entry in every bucket.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.themed.clear();
        state.null_themed.clear();
        state.unthemed.clear();
    }
}

impl<V: ConfigSensitive> ThemedCache<V> {
    /// Sweeps with each value's own declared sensitivity.
    pub fn on_configuration_change(&self, changes: ConfigChanges) {
        self.prune(changes, V::should_invalidate);
    }
}

/// Factory for per-use instances of a shared constant state, such as a
/// drawable's shared bitmap or a color state list.
pub trait ConstantState {
    /// Context the factory needs when materializing an instance.
    type Source: ?Sized;
    /// What a caller actually receives.
    type Instance;

    fn new_instance(&self, source: &Self::Source, theme: Option<&ThemeKey>) -> Self::Instance;

    /// Union of configuration axes any instance of this state depends on.
    fn changing_configurations(&self) -> ConfigChanges;
}

/// Cache of [`ConstantState`] factories that hands out fresh instances,
/// so callers never share mutable state through the cache.
pub struct ConfigBoundInstanceCache<F: ConstantState> {
    inner: ThemedCache<F>,
}

impl<F: ConstantState> Default for ConfigBoundInstanceCache<F> {
    fn default() -> Self {
        ConfigBoundInstanceCache::new()
    }
}

impl<F: ConstantState> ConfigBoundInstanceCache<F> {
    pub fn new() -> ConfigBoundInstanceCache<F> {
        ConfigBoundInstanceCache {
            inner: ThemedCache::new(),
        }
    }

    pub fn put(&self, key: u64, theme: Option<&ThemeKey>, factory: &Arc<F>, uses_theme: bool) {
        self.inner.put(key, theme, factory, uses_theme);
    }

    /// Materializes a new instance from the cached factory, if any.
    pub fn get_instance(
        &self,
        key: u64,
        source: &F::Source,
        theme: Option<&ThemeKey>,
    ) -> Option<F::Instance> {
        self.inner
            .get(key, theme)
            .map(|factory| factory.new_instance(source, theme))
    }

    /// A factory is invalidated when any of its declared configuration
    /// axes changed.
    pub fn on_configuration_change(&self, changes: ConfigChanges) {
        self.inner
            .prune(changes, |factory, changes| {
                factory.changing_configurations().intersects(changes)
            });
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}
