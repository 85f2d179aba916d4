//! Instance lifecycle
//!
//! `start` runs every task in order and stops at the first failure; tasks
//! already started stay up until `close`. `close` cancels the shared token,
//! closes every task and reports all failures together. Closing twice is a
//! no-op.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tunproxy_config::Config;

use crate::context::RuntimeContext;
use crate::task::{Task, TaskConfig};
use crate::InstanceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ready,
    Running,
    Closed,
}

pub struct Instance {
    ctx: Arc<RuntimeContext>,
    tasks: Vec<Box<dyn Task>>,
    state: Mutex<State>,
}

impl Instance {
    /// Build every task for `config`; must run inside a tokio runtime
    pub fn new(config: &Config) -> Result<Self, InstanceError> {
        config.validate()?;

        let ctx = Arc::new(RuntimeContext::new(&config.transfer).map_err(InstanceError::Context)?);
        let tasks = TaskConfig::from_config(config)
            .into_iter()
            .map(|task| task.build(ctx.clone()))
            .collect();

        Ok(Self {
            ctx,
            tasks,
            state: Mutex::new(State::Ready),
        })
    }

    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.ctx
    }

    pub async fn is_running(&self) -> bool {
        *self.state.lock().await == State::Running
    }

    pub async fn start(&self) -> Result<(), InstanceError> {
        let mut state = self.state.lock().await;
        match *state {
            State::Ready => {}
            State::Running => return Err(InstanceError::AlreadyStarted),
            State::Closed => return Err(InstanceError::Closed),
        }
        *state = State::Running;

        for task in &self.tasks {
            info!(task = task.name(), "Starting task");
            if let Err(e) = task.run().await {
                error!(task = task.name(), "Task failed to start: {}", e);
                return Err(InstanceError::Start {
                    task: task.name(),
                    source: e,
                });
            }
        }

        info!("Instance started with {} task(s)", self.tasks.len());
        Ok(())
    }

    pub async fn close(&self) -> Result<(), InstanceError> {
        let mut state = self.state.lock().await;
        if *state == State::Closed {
            return Ok(());
        }
        *state = State::Closed;

        self.ctx.cancel_token().cancel();

        let mut failures = Vec::new();
        for task in &self.tasks {
            if let Err(e) = task.close().await {
                warn!(task = task.name(), "Task failed to close: {}", e);
                failures.push((task.name(), e));
            }
        }

        if failures.is_empty() {
            info!("Instance closed");
            Ok(())
        } else {
            Err(InstanceError::Close(failures))
        }
    }
}
