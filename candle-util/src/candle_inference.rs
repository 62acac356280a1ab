use candle_core::{DType, Device};

/// Where and in which precision every tensor of a model lives; chosen
/// once and handed to constructors and inference calls
#[derive(Clone, Debug)]
pub struct ExecContext {
    pub device: Device,
    pub dtype: DType,
}

impl ExecContext {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    pub fn cpu() -> Self {
        Self::new(Device::Cpu, DType::F32)
    }
}

pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub checkpoint_interval: Option<usize>,
    /// fixes the minibatch order and the device generator
    pub seed: Option<u64>,
    pub show_progress: bool,
    pub verbose: bool,
}
