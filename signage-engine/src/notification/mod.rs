//! Change notifications from the backend.
//!
//! Two strategies, chosen by [`NotificationMode`](crate::config::NotificationMode):
//! a server-sent-event stream with bounded reconnects, or adaptive polling that follows
//! the server's recommended cadence. Only content updates and device commands reach
//! listeners.

mod channel;
mod dispatcher;
mod polling;
mod streaming;

pub use channel::{ChannelState, ChannelStatus, NotificationChannel};
pub use dispatcher::{ListenerSet, NotificationListener};
pub use polling::PollingSchedule;
