use log::{error, info, warn};

use crate::env::ParallelEnvironment;
use crate::error::{PallasError, Result};
use crate::types::{AgentId, AgentMap, Info, Space, Tensor};
use crate::vec_env::connection::{ProcessConnection, ThreadConnection, WorkerConnection};
use crate::vec_env::protocol::{Command, Reply};
use crate::vec_env::{env_seed, lookup_space, stack_resets, stack_steps, unstack_actions, VecEnv, VecInfo, VecStep};

/// Supervisor of one worker per environment.
///
/// At most one step may be in flight. A worker that stops answering marks the
/// pool degraded: the failing call returns `WorkerCrashed` and every later call
/// returns `PoolDegraded`. Workers are never restarted.
pub struct VecEnvPool {
    workers: Vec<Box<dyn WorkerConnection>>,
    agents: Vec<AgentId>,
    num_agents: usize,
    observation_spaces: AgentMap<Space>,
    action_spaces: AgentMap<Space>,
    waiting: bool,
    closed: bool,
    degraded: bool,
}

fn unexpected(worker: usize, expected: &str, reply: &Reply) -> PallasError {
    PallasError::Protocol(format!(
        "worker {} answered '{}' where '{}' was expected",
        worker,
        reply.name(),
        expected
    ))
}

impl VecEnvPool {
    /// Take ownership of connected workers, reset them and query the
    /// environment description from the first one
    pub fn from_connections(workers: Vec<Box<dyn WorkerConnection>>) -> Result<Self> {
        if workers.is_empty() {
            return Err(PallasError::invalid_parameter(
                "workers".to_string(),
                "a pool needs at least one worker".to_string(),
            ));
        }
        let mut pool = VecEnvPool {
            workers,
            agents: Vec::new(),
            num_agents: 0,
            observation_spaces: AgentMap::new(),
            action_spaces: AgentMap::new(),
            waiting: false,
            closed: false,
            degraded: false,
        };

        for i in 0..pool.workers.len() {
            pool.send(i, &Command::Reset { seed: None })?;
            match pool.recv(i)? {
                Reply::Reset { .. } => {}
                other => return Err(unexpected(i, "reset", &other)),
            }
        }

        pool.agents = match pool.request(0, &Command::GetAgents)? {
            Reply::Agents(agents) => agents,
            other => return Err(unexpected(0, "agents", &other)),
        };
        pool.num_agents = match pool.request(0, &Command::GetNumAgents)? {
            Reply::NumAgents(n) => n,
            other => return Err(unexpected(0, "num_agents", &other)),
        };
        match pool.request(0, &Command::GetSpaces)? {
            Reply::Spaces {
                observation_spaces,
                action_spaces,
            } => {
                pool.observation_spaces = observation_spaces;
                pool.action_spaces = action_spaces;
            }
            other => return Err(unexpected(0, "spaces", &other)),
        }

        info!(
            "environment pool started with {} workers and {} agents",
            pool.workers.len(),
            pool.num_agents
        );
        Ok(pool)
    }

    /// One child process per environment; `command(i)` builds the command line of worker `i`
    pub fn spawn_processes<F>(num_envs: usize, mut command: F) -> Result<Self>
    where
        F: FnMut(usize) -> std::process::Command,
    {
        let workers = (0..num_envs)
            .map(|i| ProcessConnection::spawn(i, command(i)).map(|c| Box::new(c) as Box<dyn WorkerConnection>))
            .collect::<Result<Vec<_>>>()?;
        VecEnvPool::from_connections(workers)
    }

    /// One thread per environment; `make_env(i)` builds the environment of worker `i`
    pub fn spawn_threads<F>(num_envs: usize, make_env: F) -> Result<Self>
    where
        F: Fn(usize) -> Result<Box<dyn ParallelEnvironment>>,
    {
        let workers = (0..num_envs)
            .map(|i| {
                let env = make_env(i)?;
                ThreadConnection::spawn(i, env).map(|c| Box::new(c) as Box<dyn WorkerConnection>)
            })
            .collect::<Result<Vec<_>>>()?;
        VecEnvPool::from_connections(workers)
    }

    pub fn num_agents(&self) -> usize {
        self.num_agents
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    fn check_usable(&self) -> Result<()> {
        if self.closed {
            return Err(PallasError::PoolClosed);
        }
        if self.degraded {
            return Err(PallasError::PoolDegraded);
        }
        Ok(())
    }

    fn mark_degraded(&mut self, err: PallasError) -> PallasError {
        if let PallasError::WorkerCrashed { worker, reason } = &err {
            error!("worker {} crashed: {}; pool is now degraded", worker, reason);
            self.degraded = true;
        }
        err
    }

    /// A worker out of step with the protocol leaves unread replies behind; the pool cannot resync
    fn out_of_step(&mut self, worker: usize, expected: &str, reply: &Reply) -> PallasError {
        let err = unexpected(worker, expected, reply);
        error!("{}; pool is now degraded", err);
        self.degraded = true;
        err
    }

    fn send(&mut self, worker: usize, command: &Command) -> Result<()> {
        let result = self.workers[worker].send(command);
        result.map_err(|e| self.mark_degraded(e))
    }

    fn recv(&mut self, worker: usize) -> Result<Reply> {
        let result = self.workers[worker].recv();
        result.map_err(|e| self.mark_degraded(e))
    }

    fn request(&mut self, worker: usize, command: &Command) -> Result<Reply> {
        self.send(worker, command)?;
        self.recv(worker)
    }
}

impl VecEnv for VecEnvPool {
    fn num_envs(&self) -> usize {
        self.workers.len()
    }

    fn agents(&self) -> &[AgentId] {
        &self.agents
    }

    fn observation_space(&self, agent: &str) -> Result<&Space> {
        lookup_space(&self.observation_spaces, agent)
    }

    fn action_space(&self, agent: &str) -> Result<&Space> {
        lookup_space(&self.action_spaces, agent)
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<(AgentMap<Tensor>, VecInfo)> {
        self.check_usable()?;
        if self.waiting {
            return Err(PallasError::StepPending);
        }
        for i in 0..self.workers.len() {
            self.send(i, &Command::Reset { seed: env_seed(seed, i) })?;
        }
        let mut resets: Vec<(AgentMap<Tensor>, Info)> = Vec::with_capacity(self.workers.len());
        for i in 0..self.workers.len() {
            match self.recv(i)? {
                Reply::Reset { observations, info } => resets.push((observations, info)),
                other => return Err(self.out_of_step(i, "reset", &other)),
            }
        }
        stack_resets(&self.agents, resets)
    }

    fn step_async(&mut self, actions: &AgentMap<Tensor>) -> Result<()> {
        self.check_usable()?;
        if self.waiting {
            return Err(PallasError::StepPending);
        }
        let per_env = unstack_actions(actions, &self.agents, self.workers.len())?;
        for (i, actions) in per_env.into_iter().enumerate() {
            self.send(i, &Command::Step { actions })?;
        }
        self.waiting = true;
        Ok(())
    }

    fn step_wait(&mut self) -> Result<VecStep> {
        self.check_usable()?;
        if !self.waiting {
            return Err(PallasError::NoPendingStep);
        }
        self.waiting = false;
        let mut results = Vec::with_capacity(self.workers.len());
        for i in 0..self.workers.len() {
            match self.recv(i)? {
                Reply::Step(result) => results.push(result),
                other => return Err(self.out_of_step(i, "step", &other)),
            }
        }
        stack_steps(&self.agents, results)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.degraded {
            if self.waiting {
                for worker in self.workers.iter_mut() {
                    if let Err(e) = worker.recv() {
                        warn!("draining worker {} failed: {}", worker.index(), e);
                    }
                }
                self.waiting = false;
            }
            for worker in self.workers.iter_mut() {
                let acknowledged = worker.send(&Command::Close).and_then(|_| worker.recv());
                match acknowledged {
                    Ok(Reply::Closed) => {}
                    Ok(other) => warn!("worker {} answered '{}' to close", worker.index(), other.name()),
                    Err(e) => warn!("worker {} did not acknowledge close: {}", worker.index(), e),
                }
            }
        }
        for worker in self.workers.iter_mut() {
            worker.join()?;
        }
        info!("environment pool closed");
        Ok(())
    }
}

impl Drop for VecEnvPool {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("failed to close environment pool: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{CounterEnv, SingleAgent};
    use crate::types::DEFAULT_AGENT;
    use crate::vec_env::FINAL_OBSERVATION;
    use ndarray::arr1;

    fn thread_pool(lengths: Vec<usize>) -> VecEnvPool {
        let n = lengths.len();
        VecEnvPool::spawn_threads(n, move |i| {
            Ok(Box::new(SingleAgent::new(CounterEnv::discrete(lengths[i], 4))) as Box<dyn ParallelEnvironment>)
        })
        .unwrap()
    }

    fn actions(values: &[f32]) -> AgentMap<Tensor> {
        let mut actions = AgentMap::new();
        actions.insert(DEFAULT_AGENT.to_string(), arr1(values).into_dyn());
        actions
    }

    #[test]
    fn test_thread_pool_steps_in_lock_step() {
        let mut pool = thread_pool(vec![1, 3]);
        assert_eq!(pool.num_envs(), 2);
        assert_eq!(pool.agents(), &[DEFAULT_AGENT.to_string()]);
        assert!(pool.action_space(DEFAULT_AGENT).unwrap().is_discrete());

        let (obs, _) = pool.reset(Some(0)).unwrap();
        assert_eq!(obs[DEFAULT_AGENT].shape(), &[2, 1]);

        let step = pool.step(&actions(&[2.0, 3.0])).unwrap();
        assert_eq!(step.rewards[DEFAULT_AGENT].to_vec(), vec![2.0, 3.0]);
        assert_eq!(step.terminated[DEFAULT_AGENT].to_vec(), vec![true, false]);
        assert_eq!(step.observations[DEFAULT_AGENT][[0, 0]], 0.0);
        assert_eq!(step.observations[DEFAULT_AGENT][[1, 0]], 3.0);
        assert_eq!(step.infos.ended_envs(), vec![0]);
        let final_obs = step.infos.final_observation(0).unwrap();
        assert_eq!(final_obs[DEFAULT_AGENT][[0]], 2.0);
        assert!(step.infos.is_present("t", 1));
        assert!(!step.infos.is_present(FINAL_OBSERVATION, 1));

        pool.close().unwrap();
        pool.close().unwrap();
        assert!(matches!(pool.reset(None), Err(PallasError::PoolClosed)));
    }

    #[test]
    fn test_pending_step_rules() {
        let mut pool = thread_pool(vec![5, 5]);
        assert!(matches!(pool.step_wait(), Err(PallasError::NoPendingStep)));
        pool.step_async(&actions(&[1.0, 1.0])).unwrap();
        assert!(matches!(pool.step_async(&actions(&[1.0, 1.0])), Err(PallasError::StepPending)));
        assert!(pool.step_wait().is_ok());
        // closing with a step in flight drains it first
        pool.step_async(&actions(&[1.0, 1.0])).unwrap();
        pool.close().unwrap();
    }

    #[test]
    fn test_crashed_worker_degrades_pool() {
        let mut pool = thread_pool(vec![5, 5]);
        // 9 is outside the discrete space: worker 1 fails and exits
        pool.step_async(&actions(&[1.0, 9.0])).unwrap();
        assert!(matches!(pool.step_wait(), Err(PallasError::WorkerCrashed { worker: 1, .. })));
        assert!(pool.is_degraded());
        assert!(matches!(pool.step_async(&actions(&[1.0, 1.0])), Err(PallasError::PoolDegraded)));
        pool.close().unwrap();
    }

    /// Forwards to a thread worker but answers every step with the wrong reply
    struct WrongStepReply {
        inner: ThreadConnection,
        stepping: bool,
    }

    impl WorkerConnection for WrongStepReply {
        fn index(&self) -> usize {
            self.inner.index()
        }

        fn send(&mut self, command: &Command) -> Result<()> {
            self.stepping = matches!(command, Command::Step { .. });
            self.inner.send(command)
        }

        fn recv(&mut self) -> Result<Reply> {
            let reply = self.inner.recv()?;
            if self.stepping {
                return Ok(Reply::NumAgents(1));
            }
            Ok(reply)
        }

        fn join(&mut self) -> Result<()> {
            self.inner.join()
        }
    }

    fn counter_connection(index: usize) -> ThreadConnection {
        ThreadConnection::spawn(index, Box::new(SingleAgent::new(CounterEnv::discrete(5, 4)))).unwrap()
    }

    #[test]
    fn test_unexpected_step_reply_degrades_pool() {
        let workers: Vec<Box<dyn WorkerConnection>> = vec![
            Box::new(counter_connection(0)),
            Box::new(WrongStepReply {
                inner: counter_connection(1),
                stepping: false,
            }),
        ];
        let mut pool = VecEnvPool::from_connections(workers).unwrap();
        pool.reset(Some(0)).unwrap();
        pool.step_async(&actions(&[1.0, 1.0])).unwrap();
        assert!(matches!(pool.step_wait(), Err(PallasError::Protocol(_))));
        assert!(pool.is_degraded());
        assert!(matches!(pool.step_async(&actions(&[1.0, 1.0])), Err(PallasError::PoolDegraded)));
        assert!(matches!(pool.reset(None), Err(PallasError::PoolDegraded)));
        pool.close().unwrap();
    }

    #[test]
    fn test_wrong_action_batch() {
        let mut pool = thread_pool(vec![5, 5]);
        assert!(matches!(
            pool.step_async(&actions(&[1.0, 1.0, 1.0])),
            Err(PallasError::DimensionMismatch { .. })
        ));
    }
}
