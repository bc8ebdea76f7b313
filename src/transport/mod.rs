//! Mi IO transport: token crypto, UDP socket and the session engine

mod config;
mod crypto;
mod listener;
mod session;
mod socket;
mod token;

pub use config::{SessionConfig, TokenDenylist};
pub use crypto::{
    BLOCK_LEN, CryptoError, KEY_LEN, TokenCipher, decrypt, derive_iv, derive_key, encrypt,
    unlock_vendor_token,
};
pub use listener::{Connectivity, SessionListener};
pub use session::{Session, ping};
pub use socket::{SocketBinding, SocketError};
pub use token::{Token, TokenError};
