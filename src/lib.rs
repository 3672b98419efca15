//! Host-side control of a scanning-beam instrument over a byte stream.
//!
//! Commands are encoded by [`protocol`], sent over a [`transport::Stream`],
//! and streamed under a latency budget by [`streaming`]. [`FrameBuffer`]
//! turns the returned samples back into images.

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod frame_buffer;
pub mod logging;
pub mod protocol;
pub mod streaming;
pub mod transport;
pub mod types;

pub use crate::config::{AppConfig, LoggingConfig, load_config, load_config_or_default};
pub use connection::{Connection, ConnectionState};
pub use error::BeamError;
pub use frame::{Assembler, Frame, LineAssembler, RoiAssembler, display_chunk_pixels};
pub use frame_buffer::{DisplayConfig, FrameBuffer};
pub use logging::init_logging;
pub use protocol::{ArrayItems, CmdType, Command, decode_all, decode_one, sync_sentinel};
pub use streaming::{AbortHandle, ScanOptions, ScanPoint, StreamReport, stream_points};
pub use transport::{
    ByteSink, ByteSource, ConnectionConfig, Connector, MockConnector, MockDevice, MockOptions,
    SamplePattern, Stream, TcpConnector, TcpConnectorBuilder,
};
pub use types::{
    BeamType, DacCodeRange, DwellTime, OutputEnable, OutputMode, SyncMode, VectorPoint,
};
