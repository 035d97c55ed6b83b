//! Notifier worker
//!
//! One cooperative background thread per coordinator. Commits (and
//! notifier registrations) send a wake-up over a channel; each wake-up
//! re-runs the registered change-set notifiers against the newest
//! snapshot. A dedicated thread rather than a pool: per-coordinator
//! ordering of notifier runs matters.

use std::sync::Weak;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use tracing::trace;

use super::Coordinator;

enum WorkerMsg {
  Wake,
  Shutdown,
}

pub struct NotifierWorker {
  sender: Sender<WorkerMsg>,
  thread: Option<JoinHandle<()>>,
}

impl NotifierWorker {
  /// Spawn the worker. It holds only a weak reference back to the
  /// coordinator so that the coordinator can be dropped while the
  /// worker is idle.
  pub fn spawn(coordinator: Weak<Coordinator>) -> Self {
    let (sender, receiver) = unbounded::<WorkerMsg>();
    let thread = std::thread::Builder::new()
      .name("tidedb-notifier".into())
      .spawn(move || {
        while let Ok(msg) = receiver.recv() {
          match msg {
            WorkerMsg::Shutdown => break,
            WorkerMsg::Wake => {
              let Some(coordinator) = coordinator.upgrade() else {
                break;
              };
              trace!("notifier worker woke");
              coordinator.on_change();
            }
          }
        }
      })
      .expect("spawn notifier worker");
    Self {
      sender,
      thread: Some(thread),
    }
  }

  /// Schedule a notifier pass (coalesced by the channel)
  pub fn wake(&self) {
    let _ = self.sender.send(WorkerMsg::Wake);
  }
}

impl Drop for NotifierWorker {
  fn drop(&mut self) {
    let _ = self.sender.send(WorkerMsg::Shutdown);
    if let Some(thread) = self.thread.take() {
      // The final coordinator reference can be released by the worker
      // thread itself; joining would then deadlock.
      if thread.thread().id() != std::thread::current().id() {
        let _ = thread.join();
      }
    }
  }
}
