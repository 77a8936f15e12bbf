//! get_peers write tokens (BEP 5): HMAC-SHA1 of the sender's IP under a
//! rotating secret. A token stays valid across one rotation, so its
//! lifetime is 5 to 10 minutes.

use std::net::IpAddr;

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngCore;
use sha1::Sha1;

pub const TOKEN_LEN: usize = 8;
const SECRET_LEN: usize = 20;

type HmacSha1 = Hmac<Sha1>;

struct Secrets {
    current: [u8; SECRET_LEN],
    previous: [u8; SECRET_LEN],
}

pub struct TokenManager {
    secrets: Mutex<Secrets>,
}

fn random_secret() -> [u8; SECRET_LEN] {
    let mut s = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut s);
    s
}

fn derive(secret: &[u8; SECRET_LEN], ip: &IpAddr) -> [u8; TOKEN_LEN] {
    let mut mac = HmacSha1::new_from_slice(secret).expect("hmac accepts any key length");
    match ip {
        IpAddr::V4(v4) => mac.update(&v4.octets()),
        IpAddr::V6(v6) => mac.update(&v6.octets()),
    }
    let digest = mac.finalize().into_bytes();
    let mut token = [0u8; TOKEN_LEN];
    token.copy_from_slice(&digest[..TOKEN_LEN]);
    token
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenManager {
    pub fn new() -> Self {
        TokenManager {
            secrets: Mutex::new(Secrets {
                current: random_secret(),
                previous: random_secret(),
            }),
        }
    }

    /// Token to hand out in a get_peers response to `ip`.
    pub fn issue(&self, ip: &IpAddr) -> [u8; TOKEN_LEN] {
        derive(&self.secrets.lock().current, ip)
    }

    /// Accepts a token from `ip` when it matches the current or the
    /// previous secret.
    pub fn verify(&self, ip: &IpAddr, token: &[u8]) -> bool {
        if token.len() != TOKEN_LEN {
            return false;
        }
        let secrets = self.secrets.lock();
        let current = derive(&secrets.current, ip);
        let previous = derive(&secrets.previous, ip);
        token == &current[..] || token == &previous[..]
    }

    /// Called every 5 minutes by the engine.
    pub fn rotate(&self) {
        let mut secrets = self.secrets.lock();
        secrets.previous = secrets.current;
        secrets.current = random_secret();
    }
}
