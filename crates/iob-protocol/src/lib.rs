//! iob Protocol - Wire protocol for host and client connections
//!
//! Every WebSocket text frame carries one [`Frame`]: a `call` (the
//! sender awaits a `response` with the same id), a fire-and-forget
//! `send`, or a `response`. The payload of calls and sends is one of
//! four closed message sets, one per direction:
//!
//! | Enum | Direction |
//! |---|---|
//! | [`HostRequest`] | host → broker |
//! | [`ClientRequest`] | client → broker |
//! | [`HostCommand`] | broker → host |
//! | [`ClientEvent`] | broker → client |

pub mod close;
pub mod error;
pub mod frame;
pub mod message;
pub mod render;
pub mod version;

pub use close::{CloseReason, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION, CLOSE_SERVICE_RESTART};
pub use error::ProtocolError;
pub use frame::{ErrorBody, ErrorCode, Frame};
pub use message::{
    ActionDefinition, ClientEvent, ClientRequest, ClosePageParams, CompleteParams, HostCommand,
    HostRequest, InitializeClientReply, InitializeHostParams, InitializeHostReply, IoResponseKind,
    IoResponseParams, LeavePageParams, LoadingParams, LogParams, NotifyParams, OpenPageParams,
    PageDefinition, RedirectParams, RenderPageParams, RenderParams, RequestPageParams,
    RequestPageReply, RespondParams, SdkAlert, SendIoCallParams, SendPageParams,
    StartTransactionParams, TransactionCompletedParams, TransactionRef,
};
pub use render::{RenderComponent, RenderInstruction};
pub use version::{SdkVersion, VersionError};
