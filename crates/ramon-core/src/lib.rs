pub mod clock;
pub mod duration;
pub mod error;
pub mod logging;
pub mod occurrence;
pub mod variables;

pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use duration::{parse_duration, parse_rate, parse_schedule, Rate};
pub use error::{RamonError, Result};
pub use occurrence::{EventKind, EventSpec, Occurrence};
pub use variables::{value_to_string, VariableStore, Variables};
