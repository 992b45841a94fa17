//! Adamax オプティマイザ
//!
//! Adam の二次モーメントを無限大ノルム（勾配絶対値の指数減衰最大値）に置き換えた変種です。

use burn::{
    config::Config,
    module::AutodiffModule,
    optim::{adaptor::OptimizerAdaptor, LearningRate, SimpleOptimizer},
    record::Record,
    tensor::{
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
};

/// Adamax 設定
#[derive(Config, Debug)]
pub struct AdamaxConfig {
    /// 一次モーメントの減衰率
    #[config(default = 0.9)]
    pub beta_1: f32,
    /// 無限大ノルムの減衰率
    #[config(default = 0.999)]
    pub beta_2: f32,
    /// 分母の安定化項
    #[config(default = 1e-7)]
    pub epsilon: f32,
}

impl AdamaxConfig {
    /// モジュール用オプティマイザを生成
    pub fn init<B: AutodiffBackend, M: AutodiffModule<B>>(&self) -> OptimizerAdaptor<Adamax, M, B> {
        OptimizerAdaptor::from(Adamax {
            beta_1: self.beta_1,
            beta_2: self.beta_2,
            epsilon: self.epsilon,
        })
    }
}

/// Adamax 本体
#[derive(Clone, Debug)]
pub struct Adamax {
    beta_1: f32,
    beta_2: f32,
    epsilon: f32,
}

/// パラメータごとの状態
#[derive(Record, Clone)]
pub struct AdamaxState<B: Backend, const D: usize> {
    pub moment: Tensor<B, D>,
    pub inf_norm: Tensor<B, D>,
    pub time: usize,
}

impl<B: Backend> SimpleOptimizer<B> for Adamax {
    type State<const D: usize> = AdamaxState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: LearningRate,
        tensor: Tensor<B, D>,
        grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        let (moment, inf_norm, time) = match state {
            Some(state) => (
                state
                    .moment
                    .mul_scalar(self.beta_1)
                    .add(grad.clone().mul_scalar(1.0 - self.beta_1)),
                state
                    .inf_norm
                    .mul_scalar(self.beta_2)
                    .max_pair(grad.abs()),
                state.time + 1,
            ),
            None => (grad.clone().mul_scalar(1.0 - self.beta_1), grad.abs(), 1),
        };

        let bias_correction = 1.0 - (self.beta_1 as f64).powi(time as i32);
        let step_size = lr / bias_correction;

        let delta = moment
            .clone()
            .div(inf_norm.clone().add_scalar(self.epsilon))
            .mul_scalar(step_size);

        let state = AdamaxState {
            moment,
            inf_norm,
            time,
        };

        (tensor - delta, Some(state))
    }

    fn to_device<const D: usize>(mut state: Self::State<D>, device: &B::Device) -> Self::State<D> {
        state.moment = state.moment.to_device(device);
        state.inf_norm = state.inf_norm.to_device(device);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn values(tensor: Tensor<TestBackend, 1>) -> Vec<f32> {
        tensor.into_data().iter::<f32>().collect()
    }

    #[test]
    fn test_first_step_moves_each_weight_by_learning_rate() {
        let device = Default::default();
        let optim = Adamax {
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-7,
        };
        let weights =
            Tensor::<TestBackend, 1>::from_data(TensorData::from([1.0f32, -2.0, 0.5]), &device);
        // 0.5 * x^2 の勾配は x
        let grad = weights.clone();

        let (updated, state) =
            SimpleOptimizer::<TestBackend>::step(&optim, 0.01, weights, grad, None);
        let updated = values(updated);

        for (new, old) in updated.iter().zip([1.0f32, -2.0, 0.5]) {
            assert!((old - new - 0.01 * old.signum()).abs() < 1e-5, "{old} -> {new}");
        }
        assert_eq!(state.map(|s| s.time), Some(1));
    }

    #[test]
    fn test_repeated_steps_decrease_quadratic() {
        let device = Default::default();
        let optim = Adamax {
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-7,
        };
        let mut weights =
            Tensor::<TestBackend, 1>::from_data(TensorData::from([3.0f32, -3.0]), &device);
        let mut state = None;
        for _ in 0..200 {
            let grad = weights.clone();
            let (next, next_state) =
                SimpleOptimizer::<TestBackend>::step(&optim, 0.05, weights, grad, state);
            weights = next;
            state = next_state;
        }
        assert!(values(weights).iter().all(|w| w.abs() < 1.0));
        assert_eq!(state.map(|s| s.time), Some(200));
    }
}
