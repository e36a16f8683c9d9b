/// Setters shared by every algorithm builder.
///
/// The builder must hold its configuration in a `config: AlgoConfig<P>` field.
///
/// ```ignore
/// pub struct DqnBuilder {
///     config: AlgoConfig<DqnParams>,
/// }
///
/// impl_common_setters!(DqnBuilder);
/// ```
macro_rules! impl_common_setters {
    ($builder:ty) => {
        impl $builder {
            pub fn seed(mut self, seed: u64) -> Self {
                self.config.seed = seed;
                self
            }

            pub fn hidden_sizes(mut self, sizes: Vec<usize>) -> Self {
                self.config.update_cfg.hidden_sizes = sizes;
                self
            }

            pub fn learning_rate(mut self, learning_rate: f32) -> Self {
                self.config.update_cfg.learning_rate = learning_rate;
                self
            }

            /// Decay the learning rate linearly to zero over `n_env_steps`
            pub fn learning_rate_annealing(mut self, enabled: bool) -> Self {
                self.config.update_cfg.learning_rate_annealing = enabled;
                self
            }

            pub fn max_grad_norm(mut self, max_norm: Option<f32>) -> Self {
                self.config.update_cfg.max_grad_norm = max_norm;
                self
            }

            pub fn batch_size(mut self, batch_size: usize) -> Self {
                self.config.update_cfg.batch_size = batch_size;
                self
            }

            pub fn buffer_size(mut self, size: usize) -> Self {
                self.config.update_cfg.max_buffer_size = size;
                self
            }

            pub fn n_epochs(mut self, n_epochs: usize) -> Self {
                self.config.update_cfg.n_epochs = n_epochs;
                self
            }

            pub fn n_env_steps(mut self, n_env_steps: usize) -> Self {
                self.config.train_cfg.n_env_steps = n_env_steps;
                self
            }

            /// Save every `frequency` environment steps; negative disables periodic saves
            pub fn save_frequency(mut self, frequency: i64) -> Self {
                self.config.train_cfg.save_frequency = frequency;
                self
            }

            pub fn update_config(mut self, update_cfg: $crate::config::UpdateConfig) -> Self {
                self.config.update_cfg = update_cfg;
                self
            }

            pub fn train_config(mut self, train_cfg: $crate::config::TrainConfig) -> Self {
                self.config.train_cfg = train_cfg;
                self
            }
        }
    };
}
