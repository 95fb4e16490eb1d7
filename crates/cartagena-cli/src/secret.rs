//! Masked terminal prompt for the client secret.
//!
//! Each typed character is echoed as `*`; Backspace erases the last one.
//! Control characters are ignored and Enter finishes the input. Ctrl+C
//! aborts the prompt.

use std::io::{self, Write};

use anyhow::{Result, bail};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;

use cartagena_auth::ClientSecret;

/// What the terminal should show after a key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    Nothing,
    Mask,
    Erase,
    Done,
    Cancelled,
}

impl Echo {
    fn as_str(self) -> &'static str {
        match self {
            Echo::Mask => "*",
            Echo::Erase => "\u{8} \u{8}",
            Echo::Nothing | Echo::Done | Echo::Cancelled => "",
        }
    }
}

/// The secret typed so far.
#[derive(Default)]
pub struct MaskedInput {
    buf: String,
}

impl MaskedInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one key press.
    pub fn push_key(&mut self, key: KeyEvent) -> Echo {
        if key.kind != KeyEventKind::Press {
            return Echo::Nothing;
        }
        match key.code {
            KeyCode::Enter => Echo::Done,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Echo::Cancelled,
            KeyCode::Backspace => match self.buf.pop() {
                Some(_) => Echo::Erase,
                None => Echo::Nothing,
            },
            KeyCode::Char(c) if !c.is_control() && !key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.buf.push(c);
                Echo::Mask
            }
            _ => Echo::Nothing,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> ClientSecret {
        ClientSecret::new(self.buf)
    }
}

/// Restores cooked mode on drop.
struct RawMode;

impl RawMode {
    fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Prompt on the terminal and read a secret without echoing it.
///
/// Blocking; run it off the async runtime.
pub fn read_secret(prompt: &str) -> Result<ClientSecret> {
    let mut stdout = io::stdout();
    writeln!(stdout, "{prompt}")?;
    stdout.flush()?;

    let mut input = MaskedInput::new();
    {
        let raw = RawMode::enable()?;
        loop {
            let Event::Key(key) = event::read()? else {
                continue;
            };
            match input.push_key(key) {
                Echo::Done => break,
                Echo::Cancelled => {
                    drop(raw);
                    println!();
                    bail!("secret entry cancelled");
                }
                echo => {
                    write!(stdout, "{}", echo.as_str())?;
                    stdout.flush()?;
                }
            }
        }
    }

    println!();
    Ok(input.finish())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
