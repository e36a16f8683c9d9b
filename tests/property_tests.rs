#[cfg(test)]
mod property_tests {
    use ndarray::{Array1, Array2};
    use pallas::experience::AgentData;
    use pallas::params::Params;
    use pallas::pipeline::{process_records, ExperienceTransform, ShapeRegime};
    use pallas::replay_buffer::{ExperienceBuffer, ReplayBuffer};
    use pallas::train_state::incremental_update;
    use pallas::types::{AgentMap, Tensor};
    use pallas::error::PallasError;
    use proptest::prelude::*;

    fn params(values: &[f32]) -> Params {
        let mut p = Params::new();
        p.insert("w", Array1::from(values.to_vec()).into_dyn());
        p
    }

    // Finite values of a fixed length
    fn values_strategy(len: usize) -> impl Strategy<Value = Vec<f32>> {
        prop::collection::vec(-10.0f32..10.0, len)
    }

    fn seeded_stage() -> ExperienceTransform<(), Tensor> {
        ExperienceTransform::from_fn((), |_, seed, e: Tensor| Ok(e + (seed % 7) as f32))
    }

    /// Per-step multi-agent records whose values encode `(t, agent, env)`
    fn agent_records(steps: usize, n_agents: usize, n_envs: usize, vectorized: bool) -> Vec<AgentData<Tensor>> {
        (0..steps)
            .map(|t| {
                let agents: AgentMap<Tensor> = (0..n_agents)
                    .map(|a| {
                        let value = |e: usize| (t * 100 + a * 10 + e) as f32;
                        let record = if vectorized {
                            Array1::from_shape_fn(n_envs, value).into_dyn()
                        } else {
                            ndarray::arr0(value(0)).into_dyn()
                        };
                        (format!("agent_{}", a), record)
                    })
                    .collect();
                AgentData::Parallel(agents)
            })
            .collect()
    }

    proptest! {
        #[test]
        fn test_ring_buffer_drops_oldest(capacity in 1usize..50, extra in 0usize..50) {
            let mut buffer = ReplayBuffer::new(capacity, 0);
            for i in 0..capacity + extra {
                buffer.add(i);
            }
            prop_assert_eq!(buffer.len(), capacity);
            let mut stored: Vec<usize> = buffer.iter().cloned().collect();
            stored.sort_unstable();
            prop_assert_eq!(stored, (extra..capacity + extra).collect::<Vec<_>>());
        }

        #[test]
        fn test_sampling_returns_stored_records(len in 1usize..40, batch in 1usize..40, seed in any::<u64>()) {
            let mut buffer = ReplayBuffer::new(64, seed);
            for i in 0..len {
                buffer.add(i);
            }
            match buffer.sample(batch) {
                Ok(sample) => {
                    prop_assert!(batch <= len);
                    prop_assert_eq!(sample.len(), batch);
                    prop_assert!(sample.iter().all(|&i| i < len));
                }
                Err(PallasError::BufferUnderrun { requested, available }) => {
                    prop_assert!(batch > len);
                    prop_assert_eq!((requested, available), (batch, len));
                }
                Err(other) => prop_assert!(false, "unexpected error {}", other),
            }
        }

        #[test]
        fn test_polyak_single_step(
            (live, target) in (1usize..8).prop_flat_map(|n| (values_strategy(n), values_strategy(n))),
            tau in 0.01f32..=1.0,
        ) {
            let updated = incremental_update(&params(&live), &params(&target), tau).unwrap();
            for ((u, l), t) in updated.get("w").unwrap().iter().zip(&live).zip(&target) {
                prop_assert!((u - (tau * l + (1.0 - tau) * t)).abs() < 1e-4);
            }
        }

        #[test]
        fn test_polyak_converges_to_live(values in values_strategy(4), tau in 0.2f32..=1.0) {
            let live = params(&values);
            let mut target = params(&[0.0; 4]);
            for _ in 0..200 {
                target = incremental_update(&live, &target, tau).unwrap();
            }
            for (t, l) in target.get("w").unwrap().iter().zip(&values) {
                prop_assert!((t - l).abs() < 1e-3);
            }
        }

        #[test]
        fn test_vectorized_pipeline_is_time_major(steps in 1usize..10, n_envs in 2usize..5, seed in any::<u64>()) {
            let records: Vec<AgentData<Tensor>> = (0..steps)
                .map(|t| AgentData::Single(Array1::from_shape_fn(n_envs, |e| (t * 100 + e) as f32).into_dyn()))
                .collect();
            let regime = ShapeRegime::new(true, false);
            let identity = ExperienceTransform::from_fn((), |_, _, e: Tensor| Ok(e));
            let out = process_records(&[identity], regime, seed, &records).unwrap();
            let expected = Array2::from_shape_fn((steps, n_envs), |(t, e)| (t * 100 + e) as f32);
            prop_assert_eq!(out.shape(), &[steps * n_envs]);
            prop_assert_eq!(out.iter().cloned().collect::<Vec<_>>(), expected.iter().cloned().collect::<Vec<_>>());
        }

        #[test]
        fn test_pipeline_is_deterministic(steps in 1usize..6, n_envs in 1usize..4, seed in any::<u64>()) {
            let records: Vec<AgentData<Tensor>> = (0..steps)
                .map(|_| AgentData::Single(Array1::<f32>::zeros(n_envs).into_dyn()))
                .collect();
            let regime = ShapeRegime::new(n_envs > 1, false);
            let first = process_records(&[seeded_stage()], regime, seed, &records).unwrap();
            let second = process_records(&[seeded_stage()], regime, seed, &records).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn test_parallel_pipeline_is_deterministic_and_agent_major(
            steps in 1usize..6,
            n_agents in 2usize..4,
            n_envs in 1usize..4,
            vectorized in any::<bool>(),
            seed in any::<u64>(),
        ) {
            let n_envs = if vectorized { n_envs } else { 1 };
            let records = agent_records(steps, n_agents, n_envs, vectorized);
            let regime = ShapeRegime::new(vectorized, true);

            let first = process_records(&[seeded_stage()], regime, seed, &records).unwrap();
            let second = process_records(&[seeded_stage()], regime, seed, &records).unwrap();
            prop_assert_eq!(&first, &second);

            let identity = ExperienceTransform::from_fn((), |_, _, e: Tensor| Ok(e));
            let out = process_records(&[identity], regime, seed, &records).unwrap();
            prop_assert_eq!(out.shape(), &[steps * n_agents * n_envs]);
            let mut expected = Vec::new();
            for t in 0..steps {
                for a in 0..n_agents {
                    expected.extend((0..n_envs).map(|e| (t * 100 + a * 10 + e) as f32));
                }
            }
            prop_assert_eq!(out.iter().cloned().collect::<Vec<_>>(), expected);
        }

        #[test]
        fn test_elementwise_stage_agrees_across_scalar_and_vectorized(
            steps in 1usize..6,
            n_envs in 2usize..5,
            values in prop::collection::vec(-10.0f32..10.0, 20),
            seed in any::<u64>(),
        ) {
            let records: Vec<AgentData<Tensor>> = (0..steps)
                .map(|t| AgentData::Single(Array1::from_shape_fn(n_envs, |e| values[t * n_envs + e]).into_dyn()))
                .collect();
            let affine = || ExperienceTransform::from_fn((), |_, _, e: Tensor| Ok(e * 2.0 + 1.0));

            let whole = process_records(&[affine()], ShapeRegime::scalar(), seed, &records).unwrap();
            let per_env = process_records(&[affine()], ShapeRegime::new(true, false), seed, &records).unwrap();
            prop_assert_eq!(whole.shape(), &[steps, n_envs]);
            prop_assert_eq!(per_env.shape(), &[steps * n_envs]);
            for ((w, p), v) in whole.iter().zip(per_env.iter()).zip(&values) {
                prop_assert_eq!(w, p);
                prop_assert_eq!(*w, v * 2.0 + 1.0);
            }
        }
    }
}
