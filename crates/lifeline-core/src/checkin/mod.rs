//! Check-in entity and its lifecycle state machine.

mod code;
mod lifecycle;
mod model;

pub use code::{CodeFormatError, ConfirmationCode};
pub use lifecycle::{
    Action, CheckInEdit, CodeChoice, NewCheckIn, Transition, TransitionError, ValidationError,
    MAX_INTERVAL_MINUTES,
};
pub use model::{
    Channel, CheckIn, CheckInStatus, Companion, Contact, CustomContact, EscalationReason,
    Location, NotificationMethod, UnknownStatus,
};
