use std::{
  sync::Weak,
  thread::{self, JoinHandle},
  time::Duration,
};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info};

use crate::{
  compactor::CancellationToken,
  db::DbInner,
  errors::{Errors, Result},
};

pub(crate) enum SchedulerMessage {
  Advise,
  Stop,
}

/// Background thread running the compactor when advised, after a quiet
/// period, and periodically.
pub(crate) struct CompactorScheduler {
  sender: Sender<SchedulerMessage>,
  token: CancellationToken,
  handle: Option<JoinHandle<()>>,
}

impl CompactorScheduler {
  pub(crate) fn start(
    db: Weak<DbInner>,
    wait_time: Duration,
    interval: Option<Duration>,
  ) -> Result<Self> {
    let (sender, receiver) = unbounded();
    let token = CancellationToken::new();
    let worker_token = token.clone();
    let handle = thread::Builder::new()
      .name("snapkv-compactor".into())
      .spawn(move || run(db, receiver, worker_token, wait_time, interval))
      .map_err(|e| {
        error!("failed to start compactor thread: {}", e);
        Errors::InvalidOperation(format!("cannot start compactor thread: {e}"))
      })?;
    Ok(CompactorScheduler {
      sender,
      token,
      handle: Some(handle),
    })
  }

  pub(crate) fn advisor(&self) -> Sender<SchedulerMessage> {
    self.sender.clone()
  }

  /// Cancels a running compaction and waits for the thread to exit.
  pub(crate) fn stop(&mut self) {
    self.token.cancel();
    let _ = self.sender.send(SchedulerMessage::Stop);
    if let Some(handle) = self.handle.take() {
      if handle.join().is_err() {
        error!("compactor thread panicked");
      }
    }
  }
}

impl Drop for CompactorScheduler {
  fn drop(&mut self) {
    self.stop();
  }
}

fn run(
  db: Weak<DbInner>,
  receiver: Receiver<SchedulerMessage>,
  token: CancellationToken,
  wait_time: Duration,
  interval: Option<Duration>,
) {
  debug!("compactor scheduler started");
  loop {
    let message = match interval {
      Some(interval) => receiver.recv_timeout(interval),
      None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
    };
    match message {
      Ok(SchedulerMessage::Advise) => {
        if !settle(&receiver, wait_time) {
          break;
        }
      }
      Ok(SchedulerMessage::Stop) | Err(RecvTimeoutError::Disconnected) => break,
      Err(RecvTimeoutError::Timeout) => {}
    }

    let Some(db) = db.upgrade() else {
      break;
    };
    match db.compact(&token) {
      Ok(true) => info!("background compaction finished"),
      Ok(false) => debug!("background compaction had nothing to do"),
      Err(e) => error!("background compaction failed: {}", e),
    }
    drop(db);
    if token.is_cancelled() {
      break;
    }
  }
  debug!("compactor scheduler stopped");
}

/// Waits until no advice arrived for `wait_time`. False when asked to stop.
fn settle(receiver: &Receiver<SchedulerMessage>, wait_time: Duration) -> bool {
  loop {
    match receiver.recv_timeout(wait_time) {
      Ok(SchedulerMessage::Advise) => continue,
      Err(RecvTimeoutError::Timeout) => return true,
      Ok(SchedulerMessage::Stop) | Err(RecvTimeoutError::Disconnected) => return false,
    }
  }
}
