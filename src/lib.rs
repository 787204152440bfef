//! Peer-to-peer identity failover for Solana validators.
//!
//! Two hosts run the same binary: the passive one serves a QUIC handover
//! channel, the active one dials it, and the two coordinate an atomic role
//! swap - set-identity on the departing active, tower-file transfer, then
//! set-identity on the arriving active - with admission checks before and
//! gossip verification after.

use {
    console::style,
    indicatif::{ProgressDrawTarget, ProgressStyle},
    std::{borrow::Cow, fmt::Display, time::Duration},
};

pub mod cli;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod confirm;
pub mod error;
pub mod failover;
pub mod hooks;
pub mod identity;
pub mod style;
pub mod template;
pub mod utils;
pub mod validator;

/// Version of this program; both peers must run the same one.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Format a name-value pair with the name bold-styled.
pub fn format_name_value(name: &str, value: &str) -> String {
    format!("{} {}", style(name).bold(), value)
}

/// Creates a new spinner progress bar for indeterminate waits (health
/// polling, leader-slot gating, gossip confirmation).
pub fn new_spinner_progress_bar() -> ProgressBar {
    let progress_bar = indicatif::ProgressBar::new(42);
    progress_bar.set_draw_target(ProgressDrawTarget::stdout());
    progress_bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {wide_msg}")
            .expect("ProgressStyle::template direct input to be correct"),
    );
    progress_bar.enable_steady_tick(Duration::from_millis(100));

    ProgressBar {
        progress_bar,
        is_term: console::Term::stdout().is_term(),
    }
}

/// Progress bar wrapper that adapts to terminal vs non-terminal output. In
/// terminal mode it animates; with redirected output it degrades to plain
/// lines so status still lands in logs.
pub struct ProgressBar {
    progress_bar: indicatif::ProgressBar,
    is_term: bool,
}

impl ProgressBar {
    pub fn set_message<T: Into<Cow<'static, str>> + Display>(&self, msg: T) {
        if self.is_term {
            self.progress_bar.set_message(msg);
        } else {
            println!("{msg}");
        }
    }

    pub fn println<I: AsRef<str>>(&self, msg: I) {
        self.progress_bar.println(msg);
    }

    pub fn abandon_with_message<T: Into<Cow<'static, str>> + Display>(&self, msg: T) {
        if self.is_term {
            self.progress_bar.abandon_with_message(msg);
        } else {
            println!("{msg}");
        }
    }
}
