//! QR login: payload parsing, the auth HTTP client, and the login state
//! machine.

pub mod api;
pub mod machine;
pub mod parse;

pub use api::{AuthClient, FetchedQr, QrStatus, SessionToken};
pub use machine::{Account, LoginFlow, LoginState, PollOutcome, SubmitOutcome};
pub use parse::extract_challenge;
