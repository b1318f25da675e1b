//! Retry wrapper around a stateful sandbox.
//!
//! A worker can die at any moment: killed by policy, by the watchdog, or
//! by its own bug. A [`Transaction`] owns a [`Sandbox`] and re-runs a
//! user function against a freshly initialized worker until it succeeds
//! or the retry budget is spent.

use std::time::Duration;

use crate::error::Result;
use crate::sandbox::Sandbox;

pub struct Transaction {
    sandbox: Sandbox,
    retries: u32,
    time_budget: Option<Duration>,
}

impl Transaction {
    /// Wrap `sandbox` with no retries and no time budget.
    pub fn new(sandbox: Sandbox) -> Transaction {
        Transaction {
            sandbox,
            retries: 0,
            time_budget: None,
        }
    }

    /// Allow up to `retries` re-runs after the first failure.
    pub fn with_retries(mut self, retries: u32) -> Transaction {
        self.retries = retries;
        self
    }

    /// Give the worker this much wall-clock time per attempt.
    pub fn with_time_budget(mut self, budget: Duration) -> Transaction {
        self.time_budget = Some(budget);
        self
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn sandbox_mut(&mut self) -> &mut Sandbox {
        &mut self.sandbox
    }

    /// Run `f` against an initialized sandbox. On failure the worker is
    /// torn down, a fresh one is spawned, and `f` runs again, at most
    /// `retries` more times. `f` observes the sandbox in whatever state
    /// the previous attempt left it only through worker-side effects;
    /// each retry starts from a clean worker.
    pub fn run<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Sandbox) -> Result<()>,
    {
        let mut remaining = self.retries;
        loop {
            match self.attempt(&mut f) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if remaining == 0 {
                        return Err(err);
                    }
                    remaining -= 1;
                    tracing::warn!(%err, remaining, "transaction attempt failed, retrying");
                    self.sandbox.terminate(false);
                }
            }
        }
    }

    fn attempt<F>(&mut self, f: &mut F) -> Result<()>
    where
        F: FnMut(&mut Sandbox) -> Result<()>,
    {
        if !self.sandbox.is_active() {
            self.sandbox.init()?;
        }
        if let Some(budget) = self.time_budget {
            self.sandbox.set_wall_time_limit(Some(budget))?;
        }
        f(&mut self.sandbox)
    }

    /// Tear the sandbox down and bring it back up without running the
    /// user function.
    pub fn restart(&mut self) -> Result<()> {
        self.sandbox.terminate(false);
        self.sandbox.init()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("retries", &self.retries)
            .field("time_budget", &self.time_budget)
            .field("sandbox", &self.sandbox)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn init_failure_consumes_retries() {
        // The binary does not exist, so every attempt fails in init and
        // the user function never runs.
        let sandbox = Sandbox::for_library("/nonexistent/libstringop.so");
        let mut transaction = Transaction::new(sandbox).with_retries(2);

        let mut invocations = 0;
        let err = transaction
            .run(|_sandbox| {
                invocations += 1;
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, Error::Unavailable(_)));
        assert_eq!(invocations, 0);
    }
}
