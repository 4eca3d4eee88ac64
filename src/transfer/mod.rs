//! Terminal file transfer.
//!
//! Messages travel as OSC 5113 escape codes over whatever byte channel the
//! terminal already has. The local party either pushes files with a
//! [`Sender`] or pulls them with a [`Requestor`]; the terminal party answers
//! both through a [`TerminalBroker`]. The state machines are synchronous; the
//! [`session`] drivers bind them to tokio streams.

pub mod broker;
pub mod compression;
pub mod dest;
pub mod envelope;
pub mod file;
pub mod outbound;
pub mod paths;
pub mod progress;
pub mod protocol;
pub mod requestor;
pub mod sender;
pub mod session;

pub use broker::{BrokerConfig, PermissionState, ReplyChannel, TerminalBroker, WriteOutcome};
pub use file::{DiscoveryOptions, File, FileState};
pub use progress::{BarObserver, NoopObserver, Progress, ProgressObserver};
pub use protocol::{Action, Compression, FileType, Message, TransmissionType};
pub use requestor::{RequestState, Requestor, RequestorConfig};
pub use sender::{CompressMode, SendState, Sender, SenderConfig};
pub use session::{run_broker, run_endpoint, FixedAnswer, PermissionPrompt};
