pub mod calculator;
pub mod cleaner;

pub use calculator::{session_expiration, ClientTimeouts, RealmTimeouts, SessionTimes};
pub use cleaner::start_expiration_cleaner;
