//! Single-thread executor lane
//!
//! Every observable reader owns one lane. Monitoring jobs are queued on it, so at most one
//! job runs at a time for a given reader, and the thread is reused across state switches.
//! The lane is never joined: shutting it down closes the queue and the thread exits once
//! the task in progress returns.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    thread,
};

use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::{NotificationExecutor, ReaderError};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Named thread draining a task queue in submission order
#[derive(Debug)]
pub struct ExecutorLane {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
}

impl ExecutorLane {
    /// Spawn the lane thread
    pub fn spawn(name: impl Into<String>) -> Result<Self, ReaderError> {
        let name = name.into();
        let (sender, receiver) = unbounded::<Task>();

        let thread_name = name.clone();
        thread::Builder::new().name(name.clone()).spawn(move || {
            for task in receiver.iter() {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    error!(
                        lane = %thread_name,
                        panic = %panic_message(payload.as_ref()),
                        "Task panicked on executor lane"
                    );
                }
            }
            trace!(lane = %thread_name, "Executor lane stopped");
        })?;

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
        })
    }

    /// Lane name, also used as thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a task; returns false once the lane is shut down
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.sender
            .lock()
            .as_ref()
            .is_some_and(|sender| sender.send(Box::new(task)).is_ok())
    }

    /// Close the queue; tasks already queued still run
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            trace!(lane = %self.name, "Executor lane shut down");
        }
    }

    /// Whether [`Self::shutdown`] has been called
    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl NotificationExecutor for ExecutorLane {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        if !self.submit(task) {
            warn!(lane = %self.name, "Notification dropped, executor lane is shut down");
        }
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tasks_run_in_order_on_one_thread() {
        let lane = ExecutorLane::spawn("lane-order").unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..5 {
            let tx = tx.clone();
            assert!(lane.submit(move || {
                tx.send((i, thread::current().name().map(str::to_string)))
                    .unwrap();
            }));
        }
        for i in 0..5 {
            let (value, thread) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(value, i);
            assert_eq!(thread.as_deref(), Some("lane-order"));
        }
    }

    fn boom() {
        panic!("boom")
    }

    #[test]
    fn test_panicking_task_does_not_kill_lane() {
        let lane = ExecutorLane::spawn("lane-panic").unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        assert!(lane.submit(boom));
        assert!(lane.submit(move || tx.send(()).unwrap()));
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_submit_after_shutdown() {
        let lane = ExecutorLane::spawn("lane-shutdown").unwrap();
        lane.shutdown();
        assert!(lane.is_shut_down());
        assert!(!lane.submit(|| {}));
        lane.shutdown();
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
