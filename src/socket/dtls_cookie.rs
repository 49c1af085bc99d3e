//! DTLS cookie issuance/verification.
//!
//! A cookie is an HMAC-SHA256 over the peer's socket address keyed by a
//! 16-byte per-listener secret, truncated to 16 bytes. It lets the
//! listener answer a ClientHello with a HelloVerifyRequest before
//! allocating any per-peer state, defeating spoofed-source floods the
//! same way the stateless-cookie variant in `include/net/engine.hpp`
//! does.

use std::net::SocketAddr;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const COOKIE_LEN: usize = 16;
pub const SECRET_LEN: usize = 16;

/// Per-listener secret used to compute cookies. Regenerated whenever the
/// scheme (re)starts; never persisted.
#[derive(Clone)]
pub struct CookieSecret([u8; SECRET_LEN]);

impl CookieSecret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    /// Computes the cookie for `peer`, truncated to [`COOKIE_LEN`] bytes.
    pub fn cookie_for(&self, peer: &SocketAddr) -> [u8; COOKIE_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC accepts any key length");
        mac.update(addr_bytes(peer).as_slice());
        let full = mac.finalize().into_bytes();
        let mut cookie = [0u8; COOKIE_LEN];
        cookie.copy_from_slice(&full[..COOKIE_LEN]);
        cookie
    }

    /// Verifies `candidate` was issued for `peer` under this secret,
    /// using a constant-time comparison to avoid leaking timing signal
    /// about how many leading bytes matched.
    pub fn verify(&self, peer: &SocketAddr, candidate: &[u8]) -> bool {
        if candidate.len() != COOKIE_LEN {
            return false;
        }
        let expected = self.cookie_for(peer);
        constant_time_eq(&expected, candidate)
    }
}

fn addr_bytes(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut buf = v4.ip().octets().to_vec();
            buf.extend_from_slice(&v4.port().to_be_bytes());
            buf
        }
        SocketAddr::V6(v6) => {
            let mut buf = v6.ip().octets().to_vec();
            buf.extend_from_slice(&v6.port().to_be_bytes());
            buf
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn cookie_verifies_for_same_peer_and_secret() {
        let secret = CookieSecret::generate();
        let addr = peer(9000);
        let cookie = secret.cookie_for(&addr);
        assert!(secret.verify(&addr, &cookie));
    }

    #[test]
    fn cookie_rejects_wrong_peer() {
        let secret = CookieSecret::generate();
        let cookie = secret.cookie_for(&peer(9000));
        assert!(!secret.verify(&peer(9001), &cookie));
    }

    #[test]
    fn cookie_rejects_tampered_bytes() {
        let secret = CookieSecret::generate();
        let addr = peer(9000);
        let mut cookie = secret.cookie_for(&addr);
        cookie[0] ^= 0xff;
        assert!(!secret.verify(&addr, &cookie));
    }

    #[test]
    fn different_secrets_disagree() {
        let a = CookieSecret::generate();
        let b = CookieSecret::generate();
        let addr = peer(9000);
        assert_ne!(a.cookie_for(&addr), b.cookie_for(&addr));
    }
}
