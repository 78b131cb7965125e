//! Weight-key selection.
//!
//! Targets are written as literal key prefixes with `*` wildcards, or as one
//! of the named groups in [`BASE_SELECTORS`]. Every target must match a whole
//! key; a list of targets matches a key when any of them does.

use regex::Regex;

/// Named key groups of a Stable Diffusion style checkpoint.
pub const BASE_SELECTORS: &[(&str, &str)] = &[
    ("all", ".*"),
    ("clip", "cond.*"),
    ("base", "cond.*"),
    ("model_ema", "model_ema.*"),
    ("unet", r"model\.diffusion_model.*"),
    ("in", r"model\.diffusion_model\.input_blocks.*"),
    ("out", r"model\.diffusion_model\.output_blocks.*"),
    ("mid", r"model\.diffusion_model\.middle_block.*"),
];

/// Anchored pattern for a single target.
pub fn target_pattern(target: &str) -> String {
    let target = target.trim();
    let target = target.strip_suffix('-').unwrap_or(target);
    let body = BASE_SELECTORS
        .iter()
        .find(|(name, _)| *name == target)
        .map(|(_, pattern)| (*pattern).to_string())
        .unwrap_or_else(|| regex::escape(target).replace(r"\*", ".*"));
    format!("^{}$", body)
}

/// Compiled set of targets.
#[derive(Debug, Clone)]
pub struct KeySelector {
    regex: Option<Regex>,
}

impl KeySelector {
    /// Compile `targets`. An empty list selects nothing.
    pub fn new<S: AsRef<str>>(targets: &[S]) -> crate::Result<Self> {
        if targets.is_empty() {
            return Ok(Self { regex: None });
        }
        let pattern = targets
            .iter()
            .map(|t| target_pattern(t.as_ref()))
            .collect::<Vec<_>>()
            .join("|");
        Ok(Self {
            regex: Some(Regex::new(&pattern)?),
        })
    }

    /// Whether `key` is selected.
    pub fn matches(&self, key: &str) -> bool {
        self.regex.as_ref().is_some_and(|re| re.is_match(key))
    }

    /// Combined pattern, if any target was given.
    pub fn as_str(&self) -> Option<&str> {
        self.regex.as_ref().map(Regex::as_str)
    }
}
