//! Read preferences.
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

/// A read mode plus tag sets, tried in order. An empty tag set matches
/// every member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPreference {
    pub mode: ReadMode,
    pub tag_sets: Vec<BTreeMap<String, String>>,
}

impl ReadPreference {
    pub fn new(mode: ReadMode, tag_sets: Option<Vec<BTreeMap<String, String>>>) -> ReadPreference {
        ReadPreference {
            mode: mode,
            tag_sets: tag_sets.unwrap_or_default(),
        }
    }

    pub fn primary() -> ReadPreference {
        ReadPreference::new(ReadMode::Primary, None)
    }
}

impl Default for ReadPreference {
    fn default() -> Self {
        ReadPreference::primary()
    }
}
