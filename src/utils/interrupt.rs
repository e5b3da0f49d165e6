/// Operator interrupt shared by every stage of a run

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::error::VaultError;

#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    raised: Arc<AtomicBool>,
}

impl Interrupt {
    /// Flag raised by Ctrl-C for the rest of the process
    ///
    /// The listener lives on its own task so a signal that arrives while a
    /// stage is copying or waiting on a prompt is still recorded.
    pub fn on_ctrl_c() -> Self {
        let interrupt = Self::default();
        let flag = interrupt.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping at the next safe point");
                flag.raise();
            }
        });
        interrupt
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// `Err(Interrupted)` naming `during` once the flag is up
    pub fn check(&self, during: &str) -> Result<()> {
        if self.is_raised() {
            return Err(VaultError::Interrupted(during.to_string()).into());
        }
        Ok(())
    }
}
