//! Broadcast channel for run/stop/close commands.
//!
//! Only the latest command is kept. A receiver that falls behind skips straight to it, which is
//! what a run monitor wants: it only cares about the current run state.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerCmd {
    Run(bool),
    Close,
}

pub struct CmdChan {
    cmd: Arc<Mutex<(usize, WorkerCmd)>>, // (msg_num, latest command)
    condvar: Arc<Condvar>,
}

impl CmdChan {
    pub fn new() -> Self {
        Self {
            cmd: Arc::new(Mutex::new((0, WorkerCmd::Run(false)))),
            condvar: Arc::new(Condvar::new()),
        }
    }

    pub fn new_recvr(&self) -> CmdRecvr {
        // A receiver reacts to messages posted after its creation, starting at `msg_num + 1`
        let (msg_num, _) = *self.cmd.lock();
        CmdRecvr {
            cmd: self.cmd.clone(),
            condvar: self.condvar.clone(),
            viewed_msg_num: msg_num,
        }
    }

    pub fn send(&self, cmd: WorkerCmd) {
        let mut guard = self.cmd.lock();
        let (msg_num, cmd_val) = &mut *guard;
        *cmd_val = cmd;
        *msg_num += 1;
        self.condvar.notify_all();
    }
}

impl Default for CmdChan {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CmdRecvr {
    cmd: Arc<Mutex<(usize, WorkerCmd)>>,
    condvar: Arc<Condvar>,
    viewed_msg_num: usize,
}

impl CmdRecvr {
    /// Blocks until a new command has been posted.
    pub fn recv(&mut self) -> WorkerCmd {
        let mut guard = self.cmd.lock();
        while guard.0 == self.viewed_msg_num {
            self.condvar.wait(&mut guard);
        }
        let (msg_num, cmd) = *guard;
        drop(guard);
        self.take(msg_num, cmd)
    }

    /// Like [`CmdRecvr::recv`], but gives up after `timeout`.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<WorkerCmd> {
        let mut guard = self.cmd.lock();
        if guard.0 == self.viewed_msg_num {
            let _ = self.condvar.wait_for(&mut guard, timeout);
        }
        let (msg_num, cmd) = *guard;
        drop(guard);
        if msg_num == self.viewed_msg_num {
            return None;
        }
        Some(self.take(msg_num, cmd))
    }

    fn take(&mut self, msg_num: usize, cmd: WorkerCmd) -> WorkerCmd {
        if msg_num > self.viewed_msg_num + 1 {
            log::debug!(
                "Skipped {} command(s), continuing with {:?}",
                msg_num - self.viewed_msg_num - 1,
                cmd
            );
        }
        self.viewed_msg_num = msg_num;
        cmd
    }
}
