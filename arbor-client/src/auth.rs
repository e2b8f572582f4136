//! # Session Handshake
//!
//! The server opens every session with `mode(1) | nonce(8)`. In HMAC mode the
//! client must answer with `HMAC-SHA256(secret, nonce)` before any request
//! frame; the server has no success reply and simply closes the socket on a
//! bad token.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ClientError, ClientResult};

type HmacSha256 = Hmac<Sha256>;

/// Server accepts requests without authentication.
pub const MODE_OPEN: u8 = 0;
/// Server expects an HMAC token over the nonce.
pub const MODE_HMAC: u8 = 1;
pub const NONCE_LEN: usize = 8;
pub const TOKEN_LEN: usize = 32;

/// Outcome of a completed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Open,
    Hmac,
}

/// Computes the handshake token for `nonce`.
pub fn compute_token(secret: &[u8], nonce: &[u8; NONCE_LEN]) -> ClientResult<[u8; TOKEN_LEN]> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|err| ClientError::Auth(format!("invalid secret: {err}")))?;
    mac.update(nonce);
    let digest = mac.finalize().into_bytes();
    let mut token = [0u8; TOKEN_LEN];
    token.copy_from_slice(&digest);
    Ok(token)
}

/// Checks a token in constant time.
pub fn verify_token(secret: &[u8], nonce: &[u8; NONCE_LEN], token: &[u8]) -> bool {
    match HmacSha256::new_from_slice(secret) {
        Ok(mut mac) => {
            mac.update(nonce);
            mac.verify_slice(token).is_ok()
        }
        Err(_) => false,
    }
}

/// Runs the client side of the handshake on a freshly connected stream.
///
/// Every failure, including I/O while reading the greeting, is an `Auth`
/// error so the caller applies its connect back-off.
pub async fn handshake<S>(stream: &mut S, secret: Option<&str>) -> ClientResult<AuthMode>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = [0u8; 1 + NONCE_LEN];
    stream
        .read_exact(&mut hello)
        .await
        .map_err(|err| ClientError::Auth(format!("reading server greeting: {err}")))?;

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&hello[1..]);

    match hello[0] {
        MODE_OPEN => Ok(AuthMode::Open),
        MODE_HMAC => {
            let secret = secret.ok_or_else(|| {
                ClientError::Auth("server requires authentication but no secret is configured".into())
            })?;
            let token = compute_token(secret.as_bytes(), &nonce)?;
            stream
                .write_all(&token)
                .await
                .map_err(|err| ClientError::Auth(format!("sending token: {err}")))?;
            stream
                .flush()
                .await
                .map_err(|err| ClientError::Auth(format!("sending token: {err}")))?;
            Ok(AuthMode::Hmac)
        }
        other => Err(ClientError::Auth(format!("unknown auth mode {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    const NONCE: [u8; NONCE_LEN] = [1, 2, 3, 4, 5, 6, 7, 8];

    #[tokio::test]
    async fn open_mode_sends_nothing() {
        let (mut client, mut server) = duplex(64);
        server.write_all(&[MODE_OPEN]).await.unwrap();
        server.write_all(&NONCE).await.unwrap();

        let mode = handshake(&mut client, Some("ignored")).await.unwrap();
        assert_eq!(mode, AuthMode::Open);

        drop(client);
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn hmac_mode_writes_verifiable_token() {
        let (mut client, mut server) = duplex(64);
        server.write_all(&[MODE_HMAC]).await.unwrap();
        server.write_all(&NONCE).await.unwrap();

        let mode = handshake(&mut client, Some("s3cret")).await.unwrap();
        assert_eq!(mode, AuthMode::Hmac);

        let mut token = [0u8; TOKEN_LEN];
        server.read_exact(&mut token).await.unwrap();
        assert!(verify_token(b"s3cret", &NONCE, &token));
        assert!(!verify_token(b"other", &NONCE, &token));
    }

    #[tokio::test]
    async fn hmac_mode_without_secret_fails() {
        let (mut client, mut server) = duplex(64);
        server.write_all(&[MODE_HMAC]).await.unwrap();
        server.write_all(&NONCE).await.unwrap();

        let err = handshake(&mut client, None).await.unwrap_err();
        assert!(matches!(err, ClientError::Auth(_)));
    }

    #[tokio::test]
    async fn unknown_mode_and_short_greeting_fail() {
        let (mut client, mut server) = duplex(64);
        server.write_all(&[7]).await.unwrap();
        server.write_all(&NONCE).await.unwrap();
        assert!(matches!(
            handshake(&mut client, None).await,
            Err(ClientError::Auth(_))
        ));

        let (mut client, mut server) = duplex(64);
        server.write_all(&[MODE_OPEN, 1, 2]).await.unwrap();
        drop(server);
        assert!(matches!(
            handshake(&mut client, None).await,
            Err(ClientError::Auth(_))
        ));
    }
}
