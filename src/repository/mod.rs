//! Entity repositories: CRUD over the forward tables plus the attribute
//! index maintenance each entity kind needs.
//!
//! Repositories write through immediately; only aggregate containers are
//! deferred to the end of the unit of work.

pub mod auth_sessions;
pub mod clients;
pub mod login_failures;
pub mod realms;
pub mod single_use;
pub mod user_sessions;
pub mod users;

pub use auth_sessions::AuthSessionRepository;
pub use clients::ClientRepository;
pub use login_failures::LoginFailureRepository;
pub use realms::RealmRepository;
pub use single_use::SingleUseObjectRepository;
pub use user_sessions::UserSessionRepository;
pub use users::UserRepository;

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
