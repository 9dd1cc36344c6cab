use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::collab::CronScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Starting,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent {
    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drives attached components through startup and shutdown. A scheduler,
/// if given, starts ticking only once every component has started.
pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<Mutex<dyn LifecycleComponent + Send + Sync>>>,
    scheduler: Option<CronScheduler>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: CronScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn attach(&mut self, component: Arc<Mutex<dyn LifecycleComponent + Send + Sync>>) {
        self.components.push(component);
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        info!("Lifecycle Phase: Starting");
        self.state = LifecycleState::Starting;
        for comp in &self.components {
            comp.lock().await.on_start().await?;
        }

        if let Some(scheduler) = &self.scheduler {
            info!("Lifecycle Phase: Ready (Starting Scheduler)");
            scheduler.start().await?;
        } else {
            info!("Lifecycle Phase: Ready");
        }
        self.state = LifecycleState::Ready;
        Ok(())
    }

    /// Components shut down in reverse attach order. Failures are logged so
    /// every component gets its turn.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        for comp in self.components.iter().rev() {
            if let Err(e) = comp.lock().await.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }
        if let Some(scheduler) = &self.scheduler
            && let Err(e) = scheduler.shutdown().await
        {
            warn!("Scheduler shutdown error: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        name: &'static str,
        log: Arc<std::sync::Mutex<Vec<String>>>,
        fail_shutdown: bool,
    }

    #[async_trait::async_trait]
    impl LifecycleComponent for Recorder {
        async fn on_init(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:init", self.name));
            Ok(())
        }
        async fn on_start(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:start", self.name));
            Ok(())
        }
        async fn on_shutdown(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:shutdown", self.name));
            if self.fail_shutdown {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn phases_run_in_order_and_shutdown_reverses() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut manager = LifecycleManager::new();
        for (name, fail_shutdown) in [("a", true), ("b", false)] {
            manager.attach(Arc::new(Mutex::new(Recorder {
                name,
                log: log.clone(),
                fail_shutdown,
            })));
        }
        manager.start().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Ready);
        manager.shutdown().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Shutdown);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:init", "b:init", "a:start", "b:start", "b:shutdown", "a:shutdown"]
        );
    }
}
