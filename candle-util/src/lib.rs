pub mod candle_aux_layers;
pub mod candle_conv_layers;
pub mod candle_distributions;
pub mod candle_inference;
pub mod candle_label_pooling;
pub mod candle_loss_functions;
pub mod candle_param_store;
pub mod candle_variational;

pub use candle_core;
pub use candle_nn;
