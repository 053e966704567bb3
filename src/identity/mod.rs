//! Operator identity: credential records, bearer tokens and per-connection auth state.
//! Keep the public surface thin and split implementation across sub-modules.

mod credentials;
mod session;
mod token;
mod validate;

pub use credentials::{parse_records, CredentialError, CredentialRecord, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use session::{AuthSessionManager, AuthState, RegisterResult};
pub use token::{TokenClaims, TokenCodec, TokenError, CLOCK_SKEW_SECS};
pub use validate::{is_valid_password, is_valid_username, MIN_PASSWORD_LEN};
