//! Wire protocol: typed messages, framing and chunk reassembly.

pub mod assembler;
pub mod codec;
pub mod message;

pub use assembler::ChunkAssembler;
pub use codec::{Inbound, MessageCodec};
pub use message::{AudioFormat, Mode, TranslationConfig, WireMessage};
