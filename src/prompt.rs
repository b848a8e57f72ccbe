//! Prompt-boundary detection for unframed shell output.
//!
//! The remote shell has no length or delimiter framing: the only signal that
//! a response is complete is the device re-printing its prompt, whose exact
//! text varies with the device identity and privilege mode. The detector is
//! a pure function over the accumulating output buffer so it can run
//! incrementally as chunks arrive and be unit-tested without a transport.
//!
//! Only the final (still incomplete) line of the buffer is ever a candidate.
//! Three classes of false positives are excluded outright: indented
//! configuration lines, lines starting with the comment marker, and lines
//! too long to be a prompt. A surviving line qualifies when it ends with a
//! mode marker plus a trailing space, or, as a fallback, ends with the bare
//! marker and exceeds a minimum length.

use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Privilege mode revealed by the prompt's trailing marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PromptMode {
    /// Read-mostly user mode (`>` marker).
    User,
    /// Elevated mode requiring secondary authentication (`#` marker).
    Privileged,
}

/// A detected prompt boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptHit {
    /// The prompt text, stripped of control-character prefix and trailing
    /// whitespace.
    pub prompt: String,
    /// Privilege mode indicated by the marker.
    pub mode: PromptMode,
}

/// Leading control characters terminals emit before redrawing a line.
///
/// Devices often preface the prompt with NUL padding or a bare carriage
/// return; classification must see past them.
static CONTROL_PREFIX: Lazy<Regex> =
    Lazy::new(|| match Regex::new(r"^[\x00\r\u{8}]+") {
        Ok(re) => re,
        Err(err) => panic!("invalid CONTROL_PREFIX regex: {err}"),
    });

/// Classifies the tail of an output buffer as a prompt boundary.
///
/// Construction is cheap and the detector is `Clone`; each session carries
/// its own copy.
#[derive(Debug, Clone)]
pub struct PromptDetector {
    user_marker: char,
    privileged_marker: char,
    comment_prefix: char,
    max_prompt_len: usize,
    min_bare_len: usize,
}

impl Default for PromptDetector {
    fn default() -> Self {
        Self {
            user_marker: '>',
            privileged_marker: '#',
            comment_prefix: '#',
            max_prompt_len: 64,
            min_bare_len: 3,
        }
    }
}

impl PromptDetector {
    /// Detector with the default marker set (`>` user, `#` privileged).
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the mode marker characters.
    pub fn with_markers(mut self, user: char, privileged: char) -> Self {
        self.user_marker = user;
        self.privileged_marker = privileged;
        self
    }

    /// Overrides the maximum byte length a prompt candidate may have.
    pub fn with_max_prompt_len(mut self, len: usize) -> Self {
        self.max_prompt_len = len;
        self
    }

    /// Checks whether the accumulated buffer ends at a prompt boundary.
    ///
    /// Pure: no I/O, no internal state. Call it after every received chunk;
    /// the common path returns as soon as the boundary appears.
    pub fn detect(&self, buffer: &[u8]) -> Option<PromptHit> {
        let text = String::from_utf8_lossy(buffer);
        let text = text.as_ref();
        let tail = match text.rfind('\n') {
            Some(pos) => &text[pos + 1..],
            None => text,
        };
        self.classify(tail).map(|mode| PromptHit {
            prompt: CONTROL_PREFIX.replace(tail, "").trim_end().to_string(),
            mode,
        })
    }

    /// Applies the line-classification ruleset to a single candidate line.
    pub fn classify(&self, line: &str) -> Option<PromptMode> {
        let line = CONTROL_PREFIX.replace(line, "");
        let line = line.as_ref();

        if line.is_empty() {
            return None;
        }
        // Indented configuration lines are never prompts.
        if line.starts_with([' ', '\t']) {
            return None;
        }
        // Saved-config comment lines can end in a marker character.
        if line.starts_with(self.comment_prefix) {
            return None;
        }
        // Prompts are short.
        if line.len() > self.max_prompt_len {
            return None;
        }

        // Primary rule: marker plus trailing space, the shape the device
        // prints when ready ("[RTX1210] > ").
        if let Some(mode) = self.marker_before_space(line) {
            return Some(mode);
        }

        // Fallback: bare trailing marker on a sufficiently long line.
        let trimmed = line.trim_end();
        if trimmed.len() >= self.min_bare_len {
            if trimmed.ends_with(self.privileged_marker) {
                return Some(PromptMode::Privileged);
            }
            if trimmed.ends_with(self.user_marker) {
                return Some(PromptMode::User);
            }
        }

        None
    }

    fn marker_before_space(&self, line: &str) -> Option<PromptMode> {
        let mut chars = line.chars().rev();
        if chars.next() != Some(' ') {
            return None;
        }
        match chars.next() {
            Some(c) if c == self.privileged_marker => Some(PromptMode::Privileged),
            Some(c) if c == self.user_marker => Some(PromptMode::User),
            _ => None,
        }
    }
}
