pub mod sse;
pub mod translator;
pub mod upstream;

pub use sse::{ChunkEncoder, DONE_FRAME, KEEPALIVE_FRAME};
pub use translator::{collect_completion, sse_stream, TranslatorSettings};
pub use upstream::{parse_line, ParseStats, UpstreamDecoder, UpstreamLine};
