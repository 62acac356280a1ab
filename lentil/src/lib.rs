pub mod common_io;
pub mod count_model;
pub mod experiment;
pub mod factors;
pub mod fit_st;
pub mod gene_selection;
pub mod histonet;
pub mod slide_data;
pub mod training_state;
