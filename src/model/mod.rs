pub mod attention;
pub mod encoders;
pub mod init;
pub mod params;
pub mod pretrained;
pub mod stack;

pub use encoders::{
    build_encoder, BertEncoder, Encoder, EncoderOutput, MBartEncoder, RecurrentEncoder,
    TransformerEncoder,
};
pub use params::{group_summary, FreezePolicy, ParamGroup, ParamStore, Parameter};
