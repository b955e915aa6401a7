use super::hasher::FeatureHasher;
use crate::{Index, Value};

pub(crate) fn sigmoid(z: Value) -> Value {
    1. / (1. + (-z).exp())
}

/// One flat hashed weight array shared by every tree node, plus the dense
/// per-node state the online update rule needs: bias, visit counter, and the
/// lazily accumulated L2 scalar.
///
/// Regularization is applied through the scalar trick: instead of decaying
/// every touched weight at every step, each node keeps a multiplicative
/// accumulator and all reads/writes of that node's weights are scaled by its
/// inverse.
#[derive(Clone, Debug)]
pub(crate) struct ClassifierBank {
    pub weights: Vec<Value>,
    pub bias: Vec<Value>,
    pub visits: Vec<u64>,
    pub scalars: Vec<Value>,
    gamma: Value,
    lambda: Value,
    pub hasher: FeatureHasher,
}

impl ClassifierBank {
    pub fn new(
        hasher: FeatureHasher,
        hash_dim: usize,
        gamma: Value,
        lambda: Value,
        n_nodes: usize,
    ) -> Self {
        Self {
            weights: vec![0.; hash_dim],
            bias: vec![0.; n_nodes],
            visits: vec![1; n_nodes],
            scalars: vec![1.; n_nodes],
            gamma,
            lambda,
            hasher,
        }
    }

    pub fn n_nodes(&self) -> usize {
        self.bias.len()
    }

    /// Extend per-node arrays (and hasher parameters) for newly created
    /// nodes. Existing state is untouched.
    pub fn grow(&mut self, n_nodes: usize) {
        self.bias.resize(n_nodes, 0.);
        self.visits.resize(n_nodes, 1);
        self.scalars.resize(n_nodes, 1.);
        self.hasher.grow(n_nodes);
    }

    /// `sigmoid(x . w_node + bias_node)`, reading through the hasher and the
    /// node's regularization scalar.
    pub fn partial_posterior(&self, x: &[(Index, Value)], node: usize) -> Value {
        let inv_scalar = 1. / self.scalars[node];
        let mut z = 0.;
        for &(feature, value) in x {
            let slot = self.hasher.index(node, feature);
            let sign = self.hasher.sign(node, feature);
            z += value * sign * inv_scalar * self.weights[slot];
        }
        z += inv_scalar * self.bias[node];
        sigmoid(z)
    }

    /// One gradient step at the given node; `inc = -(target - posterior)`.
    pub fn update(&mut self, x: &[(Index, Value)], node: usize, inc: Value) {
        let learning_rate = self.gamma / (1. + self.gamma * self.lambda * self.visits[node] as Value);
        self.visits[node] += 1;
        self.scalars[node] *= 1. + learning_rate * self.lambda;
        let scalar = self.scalars[node];

        for &(feature, value) in x {
            let slot = self.hasher.index(node, feature);
            let sign = self.hasher.sign(node, feature);
            self.weights[slot] -= learning_rate * scalar * inc * sign * value;
        }
        self.bias[node] -= learning_rate * scalar * inc;
    }

    /// Fraction of weight slots that have ever been written.
    pub fn weight_density(&self) -> Value {
        let nonzero = self.weights.iter().filter(|&&w| w != 0.).count();
        nonzero as Value / self.weights.len() as Value
    }
}
