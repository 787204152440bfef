//! Interactive confirmation seam.
//!
//! The coordinator only decides where confirmation points sit; rendering is
//! behind this trait so the protocol can run headless under test.

use std::io;

pub trait Confirmer: Send + Sync {
    /// Ask the operator a yes/no question. `false` cancels the failover.
    fn confirm(&self, prompt: &str) -> io::Result<bool>;

    /// Ask the operator to pick one of `options`, returning its index.
    fn select(&self, prompt: &str, options: &[String]) -> io::Result<usize>;
}

/// Prompts on the controlling terminal.
pub struct TerminalConfirmer;

impl Confirmer for TerminalConfirmer {
    fn confirm(&self, prompt: &str) -> io::Result<bool> {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(io::Error::other)
    }

    fn select(&self, prompt: &str, options: &[String]) -> io::Result<usize> {
        dialoguer::Select::new()
            .with_prompt(prompt)
            .items(options)
            .default(0)
            .interact()
            .map_err(io::Error::other)
    }
}

/// Scripted confirmer answering every prompt the same way. Used by tests and
/// useful for rehearsing the flow in CI.
pub struct ScriptedConfirmer {
    pub answer: bool,
}

impl Confirmer for ScriptedConfirmer {
    fn confirm(&self, _prompt: &str) -> io::Result<bool> {
        Ok(self.answer)
    }

    fn select(&self, _prompt: &str, _options: &[String]) -> io::Result<usize> {
        Ok(0)
    }
}
