use candle_core::backprop::GradStore;
use candle_nn::Optimizer;

/// Object-safe view of a [`candle_nn::Optimizer`] so a model can hold several of them.
pub trait DynOptimizer {
  fn step(&mut self, grads: &GradStore) -> Result<(), candle_core::Error>;

  fn learning_rate(&self) -> f64;

  fn set_learning_rate(&mut self, lr: f64);
}

impl<O: Optimizer> DynOptimizer for O {
  fn step(&mut self, grads: &GradStore) -> Result<(), candle_core::Error> {
    Optimizer::step(self, grads)
  }

  fn learning_rate(&self) -> f64 {
    Optimizer::learning_rate(self)
  }

  fn set_learning_rate(&mut self, lr: f64) {
    Optimizer::set_learning_rate(self, lr)
  }
}
