//! The pulser as seen by the commit engine.
//!
//! A [`DeviceDriver`] owns two threads:
//!
//! - the **worker** owns the [`Transport`] and executes requests one at a time, in order. Replies
//!   are tagged with the number of the request they answer, so a reply arriving after its
//!   request timed out is recognized and dropped.
//! - the **run monitor** follows the run state posted on a [`CmdChan`]. While the pulser runs
//!   it queues a status query every poll interval and records the number of completed shots.
//!
//! The driver implements [`ChannelWriter`], so it can be handed to
//! [`SequencerState::commit`](pulsecompiler_backend::SequencerState::commit) directly. Every call
//! blocks until the device has acknowledged the command or the reply timeout has passed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use pulsecompiler_backend::{ChannelWriter, Ticks};
use pulsecompiler_backend::commit::WriteResult;

use crate::command::{parse_reply, parse_shot_count, DeviceCommand};
use crate::error::{DeviceError, Result};
use crate::transport::Transport;
use crate::utils::TickTimer;
use crate::worker_cmd_chan::{CmdChan, CmdRecvr, WorkerCmd};

#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// How long a request may take from queueing to reply.
    pub reply_timeout: Duration,
    /// Status poll interval while running; `None` disables the run monitor.
    pub poll_interval: Option<Duration>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(1),
            poll_interval: Some(Duration::from_secs(1)),
        }
    }
}

enum Job {
    Request { seq: u64, command: DeviceCommand },
    Poll,
}

struct Reply {
    seq: u64,
    result: Result<String>,
}

#[derive(Default)]
struct DeviceStatus {
    shots: AtomicU64,
    faults: AtomicU64,
}

pub struct DeviceDriver {
    jobs: Option<Sender<Job>>,
    replies: Receiver<Reply>,
    next_seq: u64,
    reply_timeout: Duration,
    run_chan: CmdChan,
    status: Arc<DeviceStatus>,
    worker: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl DeviceDriver {
    pub fn spawn(transport: impl Transport + 'static, config: DriverConfig) -> Result<Self> {
        let (job_tx, job_rx) = channel::unbounded();
        let (reply_tx, reply_rx) = channel::unbounded();
        let status = Arc::new(DeviceStatus::default());

        let worker_status = status.clone();
        let worker = thread::Builder::new()
            .name("pulser-worker".to_string())
            .spawn(move || worker_loop(Box::new(transport), job_rx, reply_tx, worker_status))?;

        let run_chan = CmdChan::new();
        let monitor = match config.poll_interval {
            Some(interval) => {
                let recvr = run_chan.new_recvr();
                let jobs = job_tx.clone();
                Some(
                    thread::Builder::new()
                        .name("pulser-monitor".to_string())
                        .spawn(move || monitor_loop(recvr, jobs, interval))?,
                )
            }
            None => None,
        };

        Ok(Self {
            jobs: Some(job_tx),
            replies: reply_rx,
            next_seq: 0,
            reply_timeout: config.reply_timeout,
            run_chan,
            status,
            worker: Some(worker),
            monitor,
        })
    }

    /// Sends `command` and waits for its reply, returning the payload of the acknowledgement.
    pub fn request(&mut self, command: DeviceCommand) -> Result<String> {
        let jobs = self.jobs.as_ref().ok_or(DeviceError::WorkerClosed)?;
        let seq = self.next_seq;
        self.next_seq += 1;
        jobs.send(Job::Request { seq, command })
            .map_err(|_| DeviceError::WorkerClosed)?;

        let deadline = Instant::now() + self.reply_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok(reply) if reply.seq == seq => return reply.result,
                Ok(reply) => log::debug!("Dropping late reply to request {}", reply.seq),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(DeviceError::Timeout(self.reply_timeout))
                }
                Err(RecvTimeoutError::Disconnected) => return Err(DeviceError::WorkerClosed),
            }
        }
    }

    /// Shots completed according to the last status reply.
    pub fn shots_completed(&self) -> u64 {
        self.status.shots.load(Ordering::Relaxed)
    }

    /// Status queries the device answered with an error.
    pub fn faults(&self) -> u64 {
        self.status.faults.load(Ordering::Relaxed)
    }

    pub fn is_open(&self) -> bool {
        self.jobs.is_some()
    }

    /// Stops both threads. Requests queued before are still executed.
    pub fn close(&mut self) {
        self.run_chan.send(WorkerCmd::Close);
        if let Some(monitor) = self.monitor.take() {
            if monitor.join().is_err() {
                log::error!("Pulser run monitor panicked");
            }
        }
        // The worker exits once every job sender is gone
        self.jobs = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Pulser worker panicked");
            }
        }
    }
}

impl Drop for DeviceDriver {
    fn drop(&mut self) {
        self.close();
    }
}

impl ChannelWriter for DeviceDriver {
    fn write_channel(&mut self, channel: usize, pulses: &[(Ticks, Ticks)]) -> WriteResult {
        self.request(DeviceCommand::Pattern {
            channel,
            pulses: pulses.to_vec(),
        })?;
        Ok(())
    }

    fn set_running(&mut self, running: bool) -> WriteResult {
        self.request(DeviceCommand::Run(running))?;
        self.run_chan.send(WorkerCmd::Run(running));
        Ok(())
    }

    fn send_raw(&mut self, command: &str) -> WriteResult {
        let payload = self.request(DeviceCommand::Raw(command.to_string()))?;
        if !payload.is_empty() {
            log::info!("'{command}' -> {payload}");
        }
        Ok(())
    }
}

fn exchange(transport: &mut dyn Transport, line: &str) -> Result<String> {
    transport.send_line(line)?;
    let reply = transport.read_line()?;
    parse_reply(line, &reply)
}

fn worker_loop(
    mut transport: Box<dyn Transport>,
    jobs: Receiver<Job>,
    replies: Sender<Reply>,
    status: Arc<DeviceStatus>,
) {
    let mut timer = TickTimer::new();
    for job in jobs.iter() {
        match job {
            Job::Request { seq, command } => {
                let line = command.encode();
                timer.tick();
                let result = exchange(transport.as_mut(), &line);
                timer.tick_debug(&format!("Request {seq} '{line}'"));
                if let Err(err) = &result {
                    log::warn!("Request {seq} failed: {err}");
                }
                if replies.send(Reply { seq, result }).is_err() {
                    break;
                }
            }
            Job::Poll => match exchange(transport.as_mut(), &DeviceCommand::Status.encode()) {
                Ok(payload) => match parse_shot_count(&payload) {
                    Some(shots) => status.shots.store(shots, Ordering::Relaxed),
                    None => log::warn!("Malformed status reply '{payload}'"),
                },
                Err(err) => {
                    status.faults.fetch_add(1, Ordering::Relaxed);
                    log::error!("Status query failed: {err}");
                }
            },
        }
    }
    log::debug!("Pulser worker stopped");
}

fn monitor_loop(mut recvr: CmdRecvr, jobs: Sender<Job>, interval: Duration) {
    let mut running = false;
    loop {
        let cmd = if running {
            recvr.recv_timeout(interval)
        } else {
            Some(recvr.recv())
        };
        match cmd {
            Some(WorkerCmd::Run(run)) => running = run,
            Some(WorkerCmd::Close) => break,
            None => {
                if jobs.send(Job::Poll).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::RecordingTransport;

    fn quiet() -> DriverConfig {
        DriverConfig {
            reply_timeout: Duration::from_millis(500),
            poll_interval: None,
        }
    }

    #[test]
    fn writes_are_encoded_and_acknowledged() {
        let transport = RecordingTransport::new();
        let log = transport.log();
        let mut driver = DeviceDriver::spawn(transport, quiet()).unwrap();

        driver.write_channel(2, &[(10, 20), (50, 4)]).unwrap();
        driver.set_running(true).unwrap();
        driver.close();

        assert_eq!(*log.lock(), vec!["PAT 2 2 10,20 50,4", "RUN 1"]);
        assert!(matches!(
            driver.request(DeviceCommand::Run(false)),
            Err(DeviceError::WorkerClosed)
        ));
    }

    #[test]
    fn rejected_commands_are_errors() {
        let transport = RecordingTransport::new().rejecting("PAT 1");
        let mut driver = DeviceDriver::spawn(transport, quiet()).unwrap();
        let err = driver.write_channel(1, &[(0, 8)]).unwrap_err();
        assert!(err.to_string().contains("code 1"));
        driver.write_channel(0, &[(0, 8)]).unwrap();
    }

    #[test]
    fn late_replies_are_dropped() {
        let transport = RecordingTransport::new().with_delay(Duration::from_millis(100));
        let mut driver = DeviceDriver::spawn(
            transport,
            DriverConfig {
                reply_timeout: Duration::from_millis(30),
                poll_interval: None,
            },
        )
        .unwrap();
        assert!(matches!(
            driver.request(DeviceCommand::Run(true)),
            Err(DeviceError::Timeout(_))
        ));

        // The reply to the first request arrives while the second one waits
        driver.reply_timeout = Duration::from_millis(500);
        assert_eq!(driver.request(DeviceCommand::Status).unwrap(), "1");
    }

    #[test]
    fn monitor_polls_while_running() {
        let transport = RecordingTransport::new();
        let log = transport.log();
        let mut driver = DeviceDriver::spawn(
            transport,
            DriverConfig {
                reply_timeout: Duration::from_millis(500),
                poll_interval: Some(Duration::from_millis(5)),
            },
        )
        .unwrap();
        driver.set_running(true).unwrap();
        thread::sleep(Duration::from_millis(60));
        driver.set_running(false).unwrap();
        driver.close();

        let sent = log.lock();
        assert!(sent.iter().any(|line| line == "STAT?"));
        assert!(sent.iter().any(|line| line == "RUN 0"));
        assert!(driver.shots_completed() > 0);
        assert_eq!(driver.faults(), 0);
    }
}
