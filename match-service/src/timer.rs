// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;

/// A delayed, cancellable unit of work on the tokio runtime.
///
/// Cancelling only prevents a future that has not started running yet; callers
/// still re-check their own state when the task fires.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn after<F>(delay: Duration, work: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            work.await;
        });
        Self { handle }
    }

    /// Safe to call any number of times, before or after the task fired.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    fn counting_task(delay_ms: u64, counter: &Arc<AtomicUsize>) -> ScheduledTask {
        let counter = counter.clone();
        ScheduledTask::after(Duration::from_millis(delay_ms), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let counter = Arc::new(AtomicUsize::new(0));
        let _task = counting_task(500, &counter);

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_never_fires() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task(100, &counter);
        task.cancel();
        task.cancel();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_firing_is_a_no_op() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task(10, &counter);

        tokio::time::sleep(Duration::from_millis(50)).await;
        task.cancel();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
