//! 重连定时器
//! Reconnect timer
//!
//! Holds at most one pending scheduled task. Arming replaces the pending
//! task; cancelling aborts it if it has not fired yet.
//!
//! 最多持有一个待执行的计划任务。重新设置会替换待执行任务；取消会在其触发前中止它。

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Default)]
pub(crate) struct RetryTimer {
    pending: Option<JoinHandle<()>>,
}

impl RetryTimer {
    /// Schedules `on_fire` to run once after `delay`, cancelling any task
    /// that was pending.
    pub(crate) fn arm<F>(&mut self, delay: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire();
        }));
    }

    /// Aborts the pending task. A task that already fired is unaffected.
    pub(crate) fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            if !handle.is_finished() {
                trace!("Cancelling scheduled reconnect");
            }
            handle.abort();
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
