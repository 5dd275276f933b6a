//! Module registration surface: the extension point per-deployment modules
//! bind to. No concrete module ships here beyond the no-op example used by
//! tests.

use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&mut self) -> Result<()>;

    async fn tick(&mut self) -> Result<()>;

    /// Returns `0` when fully stopped, or a positive "not yet, retry me"
    /// signal that keeps the app's stop loop re-entering this module.
    fn stop(&mut self) -> i32 {
        0
    }

    /// Invoked once if `stop_timeout` elapses with this module still
    /// reporting `stop() > 0`.
    fn timeout(&mut self) {}
}

#[cfg(test)]
pub(crate) struct NoopModule {
    pub name: String,
    pub tick_count: u32,
}

#[cfg(test)]
#[async_trait]
impl Module for NoopModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn tick(&mut self) -> Result<()> {
        self.tick_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_module_counts_ticks() {
        let mut module = NoopModule { name: "noop".into(), tick_count: 0 };
        module.init().await.unwrap();
        module.tick().await.unwrap();
        module.tick().await.unwrap();
        assert_eq!(module.tick_count, 2);
        assert_eq!(module.stop(), 0);
    }
}
