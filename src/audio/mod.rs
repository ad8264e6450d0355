//! Audio rules, the audio source registry and the resolution engine

pub mod list;
pub mod rules;
pub mod tracker;

pub use list::AudioList;
pub use rules::{AudioRule, DayTime, DelayRange, DelayRule};
pub use tracker::{AudioTracker, TrackState};
