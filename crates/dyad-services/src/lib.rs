//! dyad-services — the networked core of a Dyad peer: transport endpoints,
//! the control and gaze channels, and the stage coordinator that drives a
//! session over them.

pub mod control;
pub mod coordinator;
pub mod endpoint;
pub mod error;
pub mod gaze;
pub mod inbox;
pub mod link;
pub mod session;

pub use control::ControlChannel;
pub use coordinator::{
    Frame, GazeSource, LocalInput, RawGaze, Renderer, ResponseInput, SessionOutcome,
    SessionReport, StageCoordinator, StageState, Station, TrialSink,
};
pub use endpoint::Endpoint;
pub use error::{NetError, SessionError};
pub use gaze::GazeChannel;
pub use inbox::{Inbox, Message};
pub use link::PeerLink;
pub use session::{ChannelStats, LinkQuality, RemoteGaze, SessionContext, StatsSnapshot};
