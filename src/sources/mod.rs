pub mod mock;
pub mod network;
pub mod scripted;

use std::time::Duration;

use crate::error::SourceError;
use crate::processing::events::Event;

pub use mock::{MockActuator, MockEventSource, MockRig, MockRigConfig};
pub use network::NetworkEventSource;
pub use scripted::ScriptedSource;

// EVENT SOURCE COMPONENT ------------------------------------------------------
pub trait EventSource: Send {
    /// Next buffered event, or `None` when nothing is pending right now.
    fn next_event(&mut self) -> Result<Option<Event>, SourceError>;

    /// Drains everything currently buffered.
    fn clear(&mut self) -> Result<Vec<Event>, SourceError>;

    fn close(&mut self) -> Result<(), SourceError>;

    /// How long to wait after an empty poll before asking again.
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(10)
    }

    fn name(&self) -> &str;
}
