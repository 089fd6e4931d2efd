pub mod checkpoint;
pub mod config;
pub mod decode;
pub mod errors;
pub mod message;
pub mod pipeline;
pub mod processor;
pub mod sink;
pub mod source;
pub mod state;
pub mod supervisor;
pub mod telemetry;
pub mod validate;
pub mod window;

pub use checkpoint::{CheckpointCoordinator, CheckpointRecord, CheckpointStore};
pub use config::{PipelineConfig, load_config};
pub use decode::{OrderDecoder, ParsedOrder, XmlOrderDecoder};
pub use errors::{PipelineError, Result};
pub use message::{InboundMessage, MessageType};
pub use pipeline::Pipeline;
pub use processor::{BatchProcessor, BatchResult, WindowFunction};
pub use sink::OrderSink;
pub use source::{PolledBatch, Source, SourceOffsets};
pub use state::{StateBackend, open_backend};
pub use supervisor::{PipelineRunState, RestartPolicy, RestartSupervisor};
pub use telemetry::{IngestMetrics, init_tracing};
pub use validate::OrderValidator;
pub use window::{PendingWindows, WindowAssigner, WindowBucket};
