//! The loop run by every pool worker.
//!
//! A worker owns one environment and answers supervisor commands one at a
//! time, in the order they arrive. It stops after acknowledging `Close`, when
//! the supervisor hangs up, or on the first environment or protocol error.

use std::io::{self, Read, Write};

use crossbeam::channel::{Receiver, Sender};
use log::{debug, error, info, warn};

use crate::env::{ParallelEnvironment, StepResult};
use crate::error::{PallasError, Result};
use crate::types::{AgentMap, InfoValue, Tensor};
use crate::vec_env::info::{FINAL_INFO, FINAL_OBSERVATION};
use crate::vec_env::protocol::{read_frame, write_frame, Command, Reply};

/// Worker side of a supervisor link
pub trait WorkerEndpoint {
    /// Next command; `None` once the supervisor hung up
    fn recv(&mut self) -> Result<Option<Command>>;

    fn send(&mut self, reply: Reply) -> Result<()>;
}

/// Frames over a byte stream, typically the worker's stdin and stdout
pub struct StreamEndpoint<R, W> {
    reader: R,
    writer: W,
}

impl<R: Read, W: Write> StreamEndpoint<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        StreamEndpoint { reader, writer }
    }
}

impl<R: Read, W: Write> WorkerEndpoint for StreamEndpoint<R, W> {
    fn recv(&mut self) -> Result<Option<Command>> {
        read_frame(&mut self.reader)
    }

    fn send(&mut self, reply: Reply) -> Result<()> {
        write_frame(&mut self.writer, &reply)
    }
}

/// In-process link used by thread workers
pub struct ChannelEndpoint {
    commands: Receiver<Command>,
    replies: Sender<Reply>,
}

impl ChannelEndpoint {
    pub fn new(commands: Receiver<Command>, replies: Sender<Reply>) -> Self {
        ChannelEndpoint { commands, replies }
    }
}

impl WorkerEndpoint for ChannelEndpoint {
    fn recv(&mut self) -> Result<Option<Command>> {
        Ok(self.commands.recv().ok())
    }

    fn send(&mut self, reply: Reply) -> Result<()> {
        self.replies
            .send(reply)
            .map_err(|_| PallasError::Protocol("supervisor dropped the reply channel".to_string()))
    }
}

/// Step, resetting right away when any agent's episode ended.
///
/// After a reset the returned observations are the fresh ones; the observations
/// and info of the finished episode move to `final_observation` / `final_info`.
pub fn step_with_autoreset<E>(env: &mut E, actions: &AgentMap<Tensor>) -> Result<StepResult>
where
    E: ParallelEnvironment + ?Sized,
{
    let mut result = env.step(actions)?;
    if result.episode_ended() {
        let (observations, info) = env.reset(None)?;
        let final_observations = std::mem::replace(&mut result.observations, observations);
        let final_info = std::mem::replace(&mut result.info, info);
        result
            .info
            .insert(FINAL_OBSERVATION.to_string(), InfoValue::from_observations(final_observations));
        result
            .info
            .insert(FINAL_INFO.to_string(), InfoValue::Map(final_info));
    }
    Ok(result)
}

fn handle<E>(env: &mut E, command: Command) -> Result<Reply>
where
    E: ParallelEnvironment + ?Sized,
{
    let reply = match command {
        Command::Reset { seed } => {
            let (observations, info) = env.reset(seed)?;
            Reply::Reset { observations, info }
        }
        Command::Step { actions } => Reply::Step(step_with_autoreset(env, &actions)?),
        Command::GetAgents => Reply::Agents(env.agents()),
        Command::GetNumAgents => Reply::NumAgents(env.num_agents()),
        Command::GetSpaces => {
            let mut observation_spaces = AgentMap::new();
            let mut action_spaces = AgentMap::new();
            for agent in env.agents() {
                observation_spaces.insert(agent.clone(), env.observation_space(&agent)?);
                action_spaces.insert(agent.clone(), env.action_space(&agent)?);
            }
            Reply::Spaces {
                observation_spaces,
                action_spaces,
            }
        }
        Command::Close => {
            env.close()?;
            Reply::Closed
        }
    };
    Ok(reply)
}

/// Serve commands until `Close`, hang-up or failure
pub fn run_worker<E, P>(env: &mut E, endpoint: &mut P) -> Result<()>
where
    E: ParallelEnvironment + ?Sized,
    P: WorkerEndpoint,
{
    loop {
        let command = match endpoint.recv() {
            Ok(Some(command)) => command,
            Ok(None) => {
                warn!("supervisor hung up without closing; shutting the environment down");
                return env.close();
            }
            Err(e) => {
                error!("worker received an invalid command: {}", e);
                return Err(e);
            }
        };
        let name = command.name();
        let closing = matches!(command, Command::Close);
        debug!("worker handling '{}'", name);

        let reply = handle(env, command).map_err(|e| {
            error!("environment failed during '{}': {}", name, e);
            e
        })?;
        endpoint.send(reply)?;

        if closing {
            info!("worker closed");
            return Ok(());
        }
    }
}

/// Host `env` over this process's stdin and stdout.
///
/// Nothing else may write to stdout while the worker runs.
pub fn serve_stdio<E>(env: &mut E) -> Result<()>
where
    E: ParallelEnvironment + ?Sized,
{
    let mut endpoint = StreamEndpoint::new(io::stdin(), io::stdout());
    run_worker(env, &mut endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{CounterEnv, SingleAgent};
    use crate::types::{scalar, DEFAULT_AGENT};
    use std::io::Cursor;

    fn action(v: f32) -> AgentMap<Tensor> {
        let mut actions = AgentMap::new();
        actions.insert(DEFAULT_AGENT.to_string(), scalar(v));
        actions
    }

    #[test]
    fn test_autoreset_stashes_final_observation() {
        let mut env = SingleAgent::new(CounterEnv::discrete(2, 3));
        env.reset(None).unwrap();
        let first = step_with_autoreset(&mut env, &action(2.0)).unwrap();
        assert!(!first.info.contains_key(FINAL_OBSERVATION));

        let second = step_with_autoreset(&mut env, &action(1.0)).unwrap();
        assert!(second.terminated[DEFAULT_AGENT]);
        assert_eq!(second.observations[DEFAULT_AGENT][[0]], 0.0);
        let stashed = second.info[FINAL_OBSERVATION].as_map().unwrap();
        assert_eq!(stashed[DEFAULT_AGENT].as_tensor().unwrap()[[0]], 3.0);
        assert!(second.info[FINAL_INFO].as_map().unwrap().contains_key("t"));
    }

    #[test]
    fn test_stream_worker_answers_in_order() {
        let mut input = Vec::new();
        write_frame(&mut input, &Command::Reset { seed: Some(1) }).unwrap();
        write_frame(&mut input, &Command::GetNumAgents).unwrap();
        write_frame(&mut input, &Command::Step { actions: action(1.0) }).unwrap();
        write_frame(&mut input, &Command::Close).unwrap();

        let mut output = Vec::new();
        let mut env = SingleAgent::new(CounterEnv::discrete(5, 2));
        {
            let mut endpoint = StreamEndpoint::new(Cursor::new(input), &mut output);
            run_worker(&mut env, &mut endpoint).unwrap();
        }

        let mut replies = Cursor::new(output);
        let mut names = Vec::new();
        while let Some(reply) = read_frame::<_, Reply>(&mut replies).unwrap() {
            names.push(reply.name());
        }
        assert_eq!(names, vec!["reset", "num_agents", "step", "closed"]);
    }

    #[test]
    fn test_environment_error_stops_worker() {
        let mut input = Vec::new();
        write_frame(&mut input, &Command::Reset { seed: None }).unwrap();
        write_frame(&mut input, &Command::Step { actions: action(7.0) }).unwrap();
        write_frame(&mut input, &Command::GetAgents).unwrap();

        let mut output = Vec::new();
        let mut env = SingleAgent::new(CounterEnv::discrete(5, 2));
        let mut endpoint = StreamEndpoint::new(Cursor::new(input), &mut output);
        let result = run_worker(&mut env, &mut endpoint);
        assert!(matches!(result, Err(PallasError::Environment(_))));
    }

    #[test]
    fn test_hang_up_is_clean_exit() {
        let mut output = Vec::new();
        let mut env = SingleAgent::new(CounterEnv::discrete(5, 2));
        let mut endpoint = StreamEndpoint::new(Cursor::new(Vec::new()), &mut output);
        assert!(run_worker(&mut env, &mut endpoint).is_ok());
        assert!(output.is_empty());
    }
}
