//! Colour vocabulary shared by the progress spinner, tables and summary.

use std::fmt::Display;

use console::{style, StyledObject};

/// Still in flight: a pending run, a poll countdown.
pub fn waiting(text: impl Display) -> StyledObject<String> {
    style(text.to_string()).bright().yellow()
}

pub fn good(text: impl Display) -> StyledObject<String> {
    style(text.to_string()).bright().green()
}

pub fn bad(text: impl Display) -> StyledObject<String> {
    style(text.to_string()).bright().red()
}

/// Prefix naming what a progress line is about.
pub fn label(text: impl Display) -> StyledObject<String> {
    style(text.to_string()).cyan()
}

pub fn muted(text: impl Display) -> StyledObject<String> {
    style(text.to_string()).dim()
}

pub fn heading(text: impl Display) -> StyledObject<String> {
    style(text.to_string()).bright().underlined()
}

pub fn brand(text: impl Display) -> StyledObject<String> {
    style(text.to_string()).magenta().bold()
}

/// `text ✓` in green or `text ✗` in red.
pub fn verdict(ok: bool, text: impl Display) -> String {
    if ok {
        good(format!("{text} ✓")).to_string()
    } else {
        bad(format!("{text} ✗")).to_string()
    }
}
