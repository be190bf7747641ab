//! Learning engine.
//!
//! A [`Network`] is a sequence of [`Layer`]s. Training alternates a cached
//! [`Network::forward`], a [`Loss`] producing the seed [`GradientSignal`],
//! [`Network::backward`] producing [`Gradients`], and an
//! [`Optimizer::step`] applying them in place.

pub mod activation;
pub mod cache;
pub mod gradient;
pub mod layer;
pub mod loss;
pub mod network;
pub mod optim;
pub mod regularizer;

pub use activation::{Activation, LeakyRelu, Linear, Relu, Sigmoid, Softmax, Tanh};
pub use cache::{Cache, NetworkCache};
pub use gradient::{GradientSignal, Gradients, LayerGradients};
pub use layer::Layer;
pub use loss::Loss;
pub use network::Network;
pub use optim::{
    AdaGrad, Adadelta, Adam, Coefficient, Component, Gd, Momentum, Nesterov, Optimizer, RmsProp,
    UpdateRule,
};
pub use regularizer::Regularizer;
