//! Response keys read from stdin, one per line.

use tokio::sync::mpsc;

use dyad_core::wire::Category;
use dyad_services::{LocalInput, ResponseInput};

pub struct StdinInput {
    rx: mpsc::UnboundedReceiver<LocalInput>,
}

impl StdinInput {
    /// Start a reader thread. Blocking stdin stays off the runtime so it
    /// cannot hold up shutdown.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            for line in std::io::stdin().lines() {
                let Ok(line) = line else { break };
                match parse_key(&line) {
                    Some(input) => {
                        if tx.send(input).is_err() {
                            break;
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => tracing::warn!(key = line.trim(), "unknown key (f/l/h/c, q to abort)"),
                }
            }
        });
        Self { rx }
    }
}

impl ResponseInput for StdinInput {
    fn poll_input(&mut self) -> Option<LocalInput> {
        self.rx.try_recv().ok()
    }
}

pub fn parse_key(line: &str) -> Option<LocalInput> {
    let key = line.trim().to_ascii_lowercase();
    match key.as_str() {
        "q" | "esc" | "escape" => Some(LocalInput::Abort),
        _ => {
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Category::from_key(c).map(LocalInput::Respond),
                _ => None,
            }
        }
    }
}
