#![deny(unsafe_code)]

//! Session layer tying the conversation store to a streaming provider.
//!
//! [`ChatController`] owns the active transcript and the single in-flight
//! stream, routing terminal commits to the conversation each send was issued
//! from. Provider credentials persist through [`SettingsStore`]; lightweight
//! UI preferences through [`UiPrefs`].

pub mod controller;
pub mod prefs;
pub mod settings;

pub use controller::{ChatController, SessionError, SessionResult};
pub use prefs::{SIDEBAR_TOGGLE_KEY, THEME_PRESET_KEY, UiPrefs};
pub use settings::{
    DEFAULT_ENDPOINT, DEFAULT_PROVIDER_ID, ProviderSettings, SettingsError, SettingsResult,
    SettingsStore,
};
