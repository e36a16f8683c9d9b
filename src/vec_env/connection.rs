use std::io::BufReader;
use std::process::{Child, ChildStdin, ChildStdout, Stdio};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, warn};

use crate::env::ParallelEnvironment;
use crate::error::{PallasError, Result};
use crate::vec_env::protocol::{read_frame, write_frame, Command, Reply};
use crate::vec_env::worker::{run_worker, ChannelEndpoint};

/// Supervisor side of the duplex link to one worker
pub trait WorkerConnection: Send {
    fn index(&self) -> usize;

    fn send(&mut self, command: &Command) -> Result<()>;

    /// Block until the worker's next reply
    fn recv(&mut self) -> Result<Reply>;

    /// Wait for the worker to exit
    fn join(&mut self) -> Result<()>;
}

fn crashed<S: Into<String>>(worker: usize, reason: S) -> PallasError {
    PallasError::WorkerCrashed {
        worker,
        reason: reason.into(),
    }
}

/// Worker hosted by a child process speaking frames over stdin/stdout
pub struct ProcessConnection {
    index: usize,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl ProcessConnection {
    /// Start `command` with piped stdin/stdout; stderr is inherited
    pub fn spawn(index: usize, mut command: std::process::Command) -> Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = command.spawn()?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| crashed(index, "worker stdout was not captured"))?;
        debug!("spawned worker {} (pid {})", index, child.id());
        Ok(ProcessConnection {
            index,
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }
}

impl WorkerConnection for ProcessConnection {
    fn index(&self) -> usize {
        self.index
    }

    fn send(&mut self, command: &Command) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or(PallasError::PoolClosed)?;
        write_frame(stdin, command).map_err(|e| crashed(self.index, e.to_string()))
    }

    fn recv(&mut self) -> Result<Reply> {
        match read_frame(&mut self.stdout) {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(crashed(self.index, "worker closed its output")),
            Err(e) => Err(crashed(self.index, e.to_string())),
        }
    }

    fn join(&mut self) -> Result<()> {
        // closing stdin lets a worker that never saw Close exit on EOF
        self.stdin.take();
        let status = self.child.wait()?;
        if !status.success() {
            warn!("worker {} exited with {}", self.index, status);
        }
        Ok(())
    }
}

/// Worker hosted by a thread of this process
pub struct ThreadConnection {
    index: usize,
    commands: Option<Sender<Command>>,
    replies: Receiver<Reply>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl ThreadConnection {
    /// Start a worker thread around `env`
    pub fn spawn(index: usize, mut env: Box<dyn ParallelEnvironment>) -> Result<Self> {
        let (command_tx, command_rx) = channel::unbounded();
        let (reply_tx, reply_rx) = channel::unbounded();
        let handle = thread::Builder::new()
            .name(format!("pallas-worker-{}", index))
            .spawn(move || {
                let mut endpoint = ChannelEndpoint::new(command_rx, reply_tx);
                run_worker(&mut env, &mut endpoint)
            })?;
        Ok(ThreadConnection {
            index,
            commands: Some(command_tx),
            replies: reply_rx,
            handle: Some(handle),
        })
    }
}

impl WorkerConnection for ThreadConnection {
    fn index(&self) -> usize {
        self.index
    }

    fn send(&mut self, command: &Command) -> Result<()> {
        let commands = self.commands.as_ref().ok_or(PallasError::PoolClosed)?;
        commands
            .send(command.clone())
            .map_err(|_| crashed(self.index, "worker thread is gone"))
    }

    fn recv(&mut self) -> Result<Reply> {
        self.replies
            .recv()
            .map_err(|_| crashed(self.index, "worker thread hung up"))
    }

    fn join(&mut self) -> Result<()> {
        self.commands.take();
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("worker {} stopped with an error: {}", self.index, e),
                Err(_) => warn!("worker {} panicked", self.index),
            }
        }
        Ok(())
    }
}
