use candle_core::{Result, Tensor};
use candle_nn::{Activation, BatchNorm, Module, ModuleT};

/// build a stack of `M` layers, each optionally followed by an
/// activation `A` and a batch normalization
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
    norm_layers: Vec<Option<BatchNorm>>,
}

impl<M> ModuleT for StackLayers<M>
where
    M: Module,
{
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = input.clone();
        for ((module, activation), norm) in self
            .module_layers
            .iter()
            .zip(self.activation_layers.iter())
            .zip(self.norm_layers.iter())
        {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
            if let Some(norm) = norm {
                x = norm.forward_t(&x, train)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
            norm_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
        self.norm_layers.push(None);
    }

    /// Appends a layer followed by activation and batch normalization
    pub fn push_with_act_norm(&mut self, layer: M, activation: Activation, norm: BatchNorm) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
        self.norm_layers.push(Some(norm));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
        self.norm_layers.push(None);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

/// batch normalization setup shared by every network
pub fn default_batch_norm_config() -> candle_nn::BatchNormConfig {
    candle_nn::BatchNormConfig {
        eps: 1e-4,
        remove_mean: true,
        affine: true,
        momentum: 0.1,
    }
}

/// leaky rectifier used between layers
pub fn leaky_relu() -> Activation {
    Activation::LeakyRelu(0.2)
}
