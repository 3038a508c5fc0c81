/// The seam through which passphrases enter the program.
use crate::crypto::sensitive::Passphrase;
use crate::error::Result;

/// Source of passphrases: the terminal in production, a queue in tests.
pub trait PassphraseProvider {
    fn read_passphrase(&mut self, prompt: &str) -> Result<Passphrase>;
}

/// Prompts on the controlling terminal with echo disabled. The trailing
/// newline (or carriage return) is stripped from the input.
pub struct TerminalPrompt;

impl PassphraseProvider for TerminalPrompt {
    fn read_passphrase(&mut self, prompt: &str) -> Result<Passphrase> {
        let entered = rpassword::prompt_password(prompt)?;
        Ok(Passphrase::new(entered))
    }
}

/// Hands out pre-arranged passphrases in order.
#[cfg(test)]
pub struct QueuedPassphrases(std::collections::VecDeque<String>);

#[cfg(test)]
impl QueuedPassphrases {
    pub fn new(entries: &[&str]) -> Self {
        Self(entries.iter().map(|s| s.to_string()).collect())
    }
}

#[cfg(test)]
impl PassphraseProvider for QueuedPassphrases {
    fn read_passphrase(&mut self, _prompt: &str) -> Result<Passphrase> {
        let entry = self.0.pop_front().expect("ran out of queued passphrases");
        Ok(Passphrase::new(entry))
    }
}
