pub mod backend;
pub mod gguf;

pub use backend::{Backend, BackendHandle};
pub use gguf::{read_meta, GgufContext, GgufLoader, GgufMetadata, GgufModel};
