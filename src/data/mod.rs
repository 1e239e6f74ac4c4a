pub mod hub;

pub use hub::{
    AutoProvider, HubProvider, LocalProvider, PretrainedFiles, PretrainedProvider, WeightsFormat,
};
