pub mod bandwidth;
pub mod buffer;
pub mod codec;
pub mod demux;
pub mod egress;
pub mod error;
pub mod http;
pub mod ingress;
pub mod mux;
pub mod session;
pub mod settings;
pub mod transcode;
pub mod variant;
pub mod worker;
