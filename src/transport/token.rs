//! Device token: the 16-byte pre-shared secret.

use core::fmt;

use thiserror::Error;

use super::config::TokenDenylist;
use super::crypto::unlock_vendor_token;

/// Length of a raw token in bytes.
pub const TOKEN_LEN: usize = 16;

/// Reasons a configured token is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Not 16, 32 or 96 characters long.
    #[error("token must be 16, 32 or 96 characters, got {len}")]
    InvalidLength {
        /// Length of the supplied token
        len: usize,
    },
    /// Token is a known placeholder value.
    #[error("token is a known placeholder value")]
    Denylisted,
    /// Token contains non-hex characters.
    #[error("token is not valid hex")]
    InvalidHex,
    /// Vendor-obfuscated token could not be unwrapped.
    #[error("obfuscated token could not be unlocked")]
    UnlockFailed,
}

/// Shared secret used for the packet checksum and the payload cipher.
#[derive(Clone, PartialEq, Eq)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    /// Construct from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    /// Normalise a configured token.
    ///
    /// Accepted forms:
    /// - 16 characters: the raw secret
    /// - 32 hex characters: the hex-encoded secret, unless it is denylisted
    /// - 96 hex characters: a vendor-obfuscated secret, see [`unlock_vendor_token`]
    pub fn parse(input: &str, denylist: &TokenDenylist) -> Result<Self, TokenError> {
        let input = input.trim();
        match input.len() {
            TOKEN_LEN => {
                let mut bytes = [0u8; TOKEN_LEN];
                bytes.copy_from_slice(input.as_bytes());
                Ok(Self(bytes))
            }
            32 => Self::from_hex(input, denylist),
            96 => {
                let unlocked = unlock_vendor_token(input);
                if unlocked.len() != 32 {
                    return Err(TokenError::UnlockFailed);
                }
                Self::from_hex(&unlocked, denylist)
            }
            len => Err(TokenError::InvalidLength { len }),
        }
    }

    fn from_hex(input: &str, denylist: &TokenDenylist) -> Result<Self, TokenError> {
        if denylist.contains(input) {
            return Err(TokenError::Denylisted);
        }
        let mut bytes = [0u8; TOKEN_LEN];
        hex::decode_to_slice(input, &mut bytes).map_err(|_| TokenError::InvalidHex)?;
        Ok(Self(bytes))
    }

    /// Borrow as bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Lower-case hex rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN_HEX: &str = "0102030405060708090a0b0c0d0e0f10";

    #[test]
    fn test_parse_hex_token() {
        let token = Token::parse(TOKEN_HEX, &TokenDenylist::default()).unwrap();
        assert_eq!(token.as_bytes()[0], 0x01);
        assert_eq!(token.as_bytes()[15], 0x10);
        assert_eq!(token.to_hex(), TOKEN_HEX);
    }

    #[test]
    fn test_parse_raw_token() {
        let token = Token::parse("abcdefghijklmnop", &TokenDenylist::default()).unwrap();
        assert_eq!(token.as_bytes(), b"abcdefghijklmnop");
    }

    #[test]
    fn test_parse_vendor_token() {
        let locked = "1ba03644aad51ab94f64f9e8353ea9f3690dc76353c8dc6858b63186194f20b0\
                      0143db63ee66b0cdff9f69917680151e";
        let token = Token::parse(locked, &TokenDenylist::default()).unwrap();
        assert_eq!(token.to_hex(), TOKEN_HEX);
    }

    #[test]
    fn test_denylisted_tokens_rejected() {
        let denylist = TokenDenylist::default();
        assert_eq!(
            Token::parse("00000000000000000000000000000000", &denylist),
            Err(TokenError::Denylisted)
        );
        assert_eq!(
            Token::parse("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF", &denylist),
            Err(TokenError::Denylisted)
        );

        let custom = TokenDenylist::new([TOKEN_HEX]);
        assert_eq!(Token::parse(TOKEN_HEX, &custom), Err(TokenError::Denylisted));
        assert!(Token::parse("00000000000000000000000000000000", &custom).is_ok());
    }

    #[test]
    fn test_invalid_tokens_rejected() {
        let denylist = TokenDenylist::default();
        assert_eq!(
            Token::parse("", &denylist),
            Err(TokenError::InvalidLength { len: 0 })
        );
        assert_eq!(
            Token::parse("zz02030405060708090a0b0c0d0e0f10", &denylist),
            Err(TokenError::InvalidHex)
        );
        assert_eq!(
            Token::parse(&"0".repeat(96), &denylist),
            Err(TokenError::UnlockFailed)
        );
    }

    #[test]
    fn test_debug_hides_secret() {
        let token = Token::from_bytes([7; TOKEN_LEN]);
        assert_eq!(format!("{token:?}"), "Token(..)");
    }
}
