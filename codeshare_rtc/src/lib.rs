pub mod connector;
pub mod link;
pub mod session;

pub use connector::RtcConnector;
pub use link::RtcLink;
pub use session::RtcSession;
