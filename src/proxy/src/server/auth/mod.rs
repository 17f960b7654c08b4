use crate::protocol::mysql::basic::HandshakeResponse;
use crate::protocol::mysql::constants::SCRAMBLE_SIZE;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::Packet;
use std::io::ErrorKind;

use async_trait::async_trait;
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha1::Digest;
use sha2::Sha256;

use rustls::server::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls;

// Only for test purpose.
pub fn default_salt() -> [u8; SCRAMBLE_SIZE] {
    let bs = ";X,po_k}>o6^Wz!/kM}N".as_bytes();
    let mut salt: [u8; SCRAMBLE_SIZE] = [0; SCRAMBLE_SIZE];
    for i in 0..SCRAMBLE_SIZE {
        salt[i] = bs[i];
        if salt[i] == b'\0' || salt[i] == b'$' {
            salt[i] += 1;
        }
    }
    salt
}

fn val(c: u8, idx: usize) -> Result<u8, std::io::Error> {
    match c {
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'0'..=b'9' => Ok(c - b'0'),
        _ => Err(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("Invalid hex character {}", idx),
        )),
    }
}

pub fn hex_string_decode<T: AsRef<[u8]>>(data: T) -> Result<Vec<u8>, std::io::Error> {
    let data_ref = data.as_ref();
    if data_ref.len() % 2 != 0 {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            "Input hex string's length needs to be even, as two digits correspond to one byte.",
        ));
    }

    data_ref
        .chunks(2)
        .enumerate()
        .map(|(i, pair)| {
            Ok::<u8, std::io::Error>(val(pair[0], 2 * i)? << 4 | val(pair[1], 2 * i + 1)?)
        })
        .try_collect()
}

/// Generate a random string user ASCII but avoid separator character.
/// https://github.com/mysql/mysql-server/blob/8.0/mysys/crypt_genhash_impl.cc#L427
#[inline]
pub fn gen_user_salt() -> [u8; SCRAMBLE_SIZE] {
    let mut salt: [u8; SCRAMBLE_SIZE] = [0; SCRAMBLE_SIZE];
    let mut r = StdRng::from_entropy();
    for salt_item in salt.iter_mut() {
        let salt_rand = r.gen_range(0..127) as u8;
        *salt_item = salt_rand;
        if *salt_item == b'\0' || *salt_item == b'$' {
            *salt_item += 1;
        }
    }
    salt
}

fn to_u8_32(bytes: impl AsRef<[u8]>) -> [u8; 32] {
    let mut out = [0; 32];
    (out[..]).copy_from_slice(bytes.as_ref());
    out
}

pub fn sha256_1(bytes: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::default();
    hasher.update(bytes.as_ref());
    to_u8_32(hasher.finalize())
}

pub fn sha256_2(bytes1: impl AsRef<[u8]>, bytes2: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::default();
    hasher.update(bytes1.as_ref());
    hasher.update(bytes2.as_ref());
    to_u8_32(hasher.finalize())
}

pub fn sha1_1(bytes: impl AsRef<[u8]>) -> [u8; 20] {
    sha1::Sha1::digest(bytes).into()
}

pub fn xor<T, U>(mut left: T, right: U) -> T
where
    T: AsMut<[u8]>,
    U: AsRef<[u8]>,
{
    left.as_mut()
        .iter_mut()
        .zip(right.as_ref().iter())
        .map(|(l, r)| *l ^= r)
        .last();
    left
}

pub fn sha1_2(bytes1: impl AsRef<[u8]>, bytes2: impl AsRef<[u8]>) -> [u8; 20] {
    let mut hasher = sha1::Sha1::new();
    hasher.update(bytes1.as_ref());
    hasher.update(bytes2.as_ref());
    hasher.finalize().into()
}

/// The Authenticator is an abstraction of the connection phase of the MySQL protocol:
///
/// 1. send the initial handshake and negotiate capabilities (setting up TLS if requested),
/// 2. check the client's credentials once its `HandshakeResponse` has been parsed.
///
/// Unlike a pooled-backend proxy, this Session owns its backend connection exclusively
/// for the binding's lifetime (`spec.md` §5), so there is exactly one, single-hop
/// client-facing authentication per session — no replay against a shared backend
/// connection is ever needed (`SPEC_FULL.md` §4.9).
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Writes the initial handshake and parses the client's `HandshakeResponse`.
    async fn initial_handshake<R, W>(
        &self,
        conn_id: u64,
        scramble: [u8; 20],
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
        #[cfg(feature = "tls")] tls_conf: &Option<std::sync::Arc<ServerConfig>>,
    ) -> Result<(u8, HandshakeResponse, Packet), std::io::Error>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin;

    /// Checks the client's credentials against the scramble issued in `initial_handshake`.
    /// Returns `true` when `auth_response` is the expected `mysql_native_password` token.
    fn authenticate(&self, username: &[u8], auth_response: &[u8], scramble: &[u8; 20]) -> bool;
}

/// `mysql_native_password` authentication against a single, statically configured
/// user/password pair (`server::cli_args`). Good enough for a proxy that hands every
/// session an already-authenticated backend connection from the Cluster Resolver —
/// the client only ever needs to prove it knows the proxy's own credential.
pub struct StaticAuthenticator {
    username: Vec<u8>,
    password: Vec<u8>,
}

impl StaticAuthenticator {
    pub fn new(username: impl Into<Vec<u8>>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn initial_handshake<R, W>(
        &self,
        conn_id: u64,
        scramble: [u8; 20],
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
        #[cfg(feature = "tls")] tls_conf: &Option<std::sync::Arc<ServerConfig>>,
    ) -> Result<(u8, HandshakeResponse, Packet), std::io::Error>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        use crate::protocol::mysql::basic::client_handshake_response;
        use crate::protocol::mysql::packet::writers::write_initial_handshake;
        use crate::server::DEFAULT_BACKEND_VERSION;

        client_writer.reset_seq();
        write_initial_handshake(
            client_writer,
            conn_id,
            scramble,
            DEFAULT_BACKEND_VERSION,
            #[cfg(feature = "tls")]
            tls_conf,
        )
        .await?;

        let (seq, packet) = client_reader.next_async().await?.ok_or_else(|| {
            std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "client disconnected during the handshake",
            )
        })?;
        let (_, handshake) = client_handshake_response(packet.as_ref(), false)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, format!("{e:?}")))?;
        Ok((seq, handshake, packet))
    }

    fn authenticate(&self, username: &[u8], auth_response: &[u8], scramble: &[u8; 20]) -> bool {
        if username != self.username.as_slice() {
            return false;
        }
        if self.password.is_empty() {
            return auth_response.is_empty();
        }
        let stage1 = sha1_1(&self.password);
        let stage2 = sha1_1(stage1);
        let expected = xor(sha1_2(scramble, stage2), stage1);
        auth_response == expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticates_known_credentials() {
        let auth = StaticAuthenticator::new(b"root".to_vec(), b"secret".to_vec());
        let scramble = default_salt();
        let stage1 = sha1_1(b"secret");
        let stage2 = sha1_1(stage1);
        let token = xor(sha1_2(scramble, stage2), stage1);
        assert!(auth.authenticate(b"root", &token, &scramble));
        assert!(!auth.authenticate(b"root", b"wrong-token-wrong-token-w", &scramble));
        assert!(!auth.authenticate(b"someone-else", &token, &scramble));
    }

    #[test]
    fn empty_password_requires_empty_response() {
        let auth = StaticAuthenticator::new(b"root".to_vec(), Vec::new());
        let scramble = default_salt();
        assert!(auth.authenticate(b"root", b"", &scramble));
        assert!(!auth.authenticate(b"root", b"anything", &scramble));
    }
}
