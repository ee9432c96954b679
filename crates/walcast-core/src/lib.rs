pub mod decode;
pub mod error;
pub mod lifecycle;
pub mod lsn;
pub mod protocol;
pub mod session;
pub mod source;
pub mod types;

pub use decode::{ChangeDecoder, DecodeFormat, Wal2JsonV1Decoder, Wal2JsonV2Decoder};
pub use error::{Error, Result};
pub use lifecycle::{Backoff, ReplicationState};
pub use lsn::Lsn;
pub use protocol::{ClientMessage, ErrorCode, InfoCode, ServerMessage};
pub use session::{AuthPolicy, Reply, Session};
pub use source::{ChangeSource, SourceConnector};
pub use types::{ChangeBatch, ChangeEvent, ChangeKind};
