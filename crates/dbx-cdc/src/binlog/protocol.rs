//! MySQL replication wire protocol
//!
//! Implements the client side of the binlog replication handshake:
//! - packet framing (3-byte length + 1-byte sequence id)
//! - authentication with `mysql_native_password` and `caching_sha2_password`
//!   (fast path, and full auth via the server's RSA public key)
//! - `COM_QUERY` for session setup statements
//! - `COM_REGISTER_SLAVE` and `COM_BINLOG_DUMP`
//! - streaming of raw binlog event payloads
//!
//! ## Scramble algorithms
//!
//! `mysql_native_password`: `SHA1(pwd) XOR SHA1(salt + SHA1(SHA1(pwd)))`
//!
//! `caching_sha2_password`: `SHA256(pwd) XOR SHA256(SHA256(SHA256(pwd)) + salt)`;
//! when the server has no cached entry it demands the cleartext password,
//! which is XORed with the nonce and encrypted under the server's RSA key
//! (PKCS#1 v1.5).

use anyhow::{bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::OsRng;
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::io::Read;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Packet header: 3 length bytes + 1 sequence byte
const PACKET_HEADER_SIZE: usize = 4;
/// Largest payload a single packet can carry
const MAX_PACKET_SIZE: usize = 16_777_215;
/// TCP connect timeout
const CONNECT_TIMEOUT_SECS: u64 = 10;
/// Timeout for handshake and command round-trips. The event stream itself is
/// not bounded; idle periods between transactions are normal.
const COMMAND_TIMEOUT_SECS: u64 = 30;

/// Client capability bits used during the handshake.
mod capability {
    pub const LONG_PASSWORD: u32 = 0x0000_0001;
    pub const LONG_FLAG: u32 = 0x0000_0004;
    pub const PROTOCOL_41: u32 = 0x0000_0200;
    pub const SSL: u32 = 0x0000_0800;
    pub const TRANSACTIONS: u32 = 0x0000_2000;
    pub const SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const PLUGIN_AUTH: u32 = 0x0008_0000;
    pub const DEPRECATE_EOF: u32 = 0x0100_0000;
}

/// Initial greeting sent by the server.
#[derive(Debug)]
pub struct Handshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: u32,
    pub auth_plugin_name: String,
    salt: Vec<u8>,
}

impl Handshake {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        let mut byte = [0u8; 1];
        let mut word = [0u8; 2];
        let mut dword = [0u8; 4];

        Read::read_exact(&mut cursor, &mut byte)?;
        let protocol_version = byte[0];

        let mut server_version = Vec::new();
        loop {
            Read::read_exact(&mut cursor, &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            server_version.push(byte[0]);
        }
        let server_version = String::from_utf8_lossy(&server_version).into_owned();

        Read::read_exact(&mut cursor, &mut dword)?;
        let connection_id = u32::from_le_bytes(dword);

        let mut salt = vec![0u8; 8];
        Read::read_exact(&mut cursor, &mut salt)?;

        // filler
        Read::read_exact(&mut cursor, &mut byte)?;

        Read::read_exact(&mut cursor, &mut word)?;
        let cap_lower = u16::from_le_bytes(word) as u32;

        // character set + status flags
        Read::read_exact(&mut cursor, &mut byte)?;
        Read::read_exact(&mut cursor, &mut word)?;

        Read::read_exact(&mut cursor, &mut word)?;
        let cap_upper = u16::from_le_bytes(word) as u32;
        let capabilities = (cap_upper << 16) | cap_lower;

        Read::read_exact(&mut cursor, &mut byte)?;
        let auth_data_len = byte[0] as usize;

        let mut reserved = [0u8; 10];
        Read::read_exact(&mut cursor, &mut reserved)?;

        let tail_len = if auth_data_len > 8 { auth_data_len - 8 } else { 13 };
        let mut salt_tail = vec![0u8; tail_len];
        Read::read_exact(&mut cursor, &mut salt_tail)?;
        if let Some(nul) = salt_tail.iter().position(|&b| b == 0) {
            salt_tail.truncate(nul);
        }
        salt.extend_from_slice(&salt_tail);

        let mut auth_plugin_name = Vec::new();
        if capabilities & capability::PLUGIN_AUTH != 0 {
            loop {
                let n = Read::read(&mut cursor, &mut byte)?;
                if n == 0 || byte[0] == 0 {
                    break;
                }
                auth_plugin_name.push(byte[0]);
            }
        }
        let auth_plugin_name = String::from_utf8_lossy(&auth_plugin_name).into_owned();

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            capabilities,
            auth_plugin_name,
            salt,
        })
    }
}

/// Authenticated replication connection to a MySQL primary.
pub struct BinlogClient {
    stream: BufReader<TcpStream>,
    sequence_id: u8,
    server_version: String,
    connection_id: u32,
}

impl std::fmt::Debug for BinlogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinlogClient")
            .field("server_version", &self.server_version)
            .field("connection_id", &self.connection_id)
            .field("sequence_id", &self.sequence_id)
            .finish_non_exhaustive()
    }
}

impl BinlogClient {
    /// Connect and authenticate.
    pub async fn connect(addr: &str, user: &str, password: &str) -> Result<Self> {
        info!(addr, "connecting to primary");

        let tcp = match timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            TcpStream::connect(addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e).context("failed to connect to primary"),
            Err(_) => bail!("connect timeout after {}s", CONNECT_TIMEOUT_SECS),
        };

        let mut client = Self {
            stream: BufReader::new(tcp),
            sequence_id: 0,
            server_version: String::new(),
            connection_id: 0,
        };

        let greeting = client.read_packet().await?;
        let handshake = Handshake::parse(&greeting).context("failed to parse server handshake")?;
        client.server_version = handshake.server_version.clone();
        client.connection_id = handshake.connection_id;

        info!(
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            auth_plugin = %handshake.auth_plugin_name,
            "connected"
        );

        client.authenticate(user, password, &handshake).await?;
        Ok(client)
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        self.stream.read_exact(&mut header).await?;

        let len = (header[0] as usize) | ((header[1] as usize) << 8) | ((header[2] as usize) << 16);
        self.sequence_id = header[3].wrapping_add(1);

        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;
        Ok(payload)
    }

    async fn read_packet_timeout(&mut self) -> Result<Vec<u8>> {
        timeout(Duration::from_secs(COMMAND_TIMEOUT_SECS), self.read_packet())
            .await
            .map_err(|_| anyhow::anyhow!("read timed out after {}s", COMMAND_TIMEOUT_SECS))?
    }

    async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_PACKET_SIZE {
            bail!("packet too large: {} bytes", data.len());
        }

        let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + data.len());
        packet.push((data.len() & 0xFF) as u8);
        packet.push(((data.len() >> 8) & 0xFF) as u8);
        packet.push(((data.len() >> 16) & 0xFF) as u8);
        packet.push(self.sequence_id);
        packet.extend_from_slice(data);

        let stream = self.stream.get_mut();
        stream.write_all(&packet).await?;
        stream.flush().await?;
        self.sequence_id = self.sequence_id.wrapping_add(1);
        Ok(())
    }

    async fn authenticate(
        &mut self,
        user: &str,
        password: &str,
        handshake: &Handshake,
    ) -> Result<()> {
        let client_flags = capability::LONG_PASSWORD
            | capability::LONG_FLAG
            | capability::PROTOCOL_41
            | capability::TRANSACTIONS
            | capability::SECURE_CONNECTION
            | capability::PLUGIN_AUTH
            | capability::DEPRECATE_EOF;
        if handshake.capabilities & capability::SSL != 0 {
            debug!("server offers TLS; continuing on plain connection");
        }

        let scramble = match handshake.auth_plugin_name.as_str() {
            "caching_sha2_password" | "sha256_password" => {
                scramble_sha256(password, &handshake.salt)
            }
            "mysql_native_password" => scramble_sha1(password, &handshake.salt),
            other => {
                warn!(plugin = other, "unknown auth plugin, trying mysql_native_password");
                scramble_sha1(password, &handshake.salt)
            }
        };

        let mut response = BytesMut::with_capacity(128);
        response.put_u32_le(client_flags);
        response.put_u32_le(MAX_PACKET_SIZE as u32);
        response.put_u8(45); // utf8mb4
        response.put_slice(&[0u8; 23]);
        response.put_slice(user.as_bytes());
        response.put_u8(0);
        response.put_u8(scramble.len() as u8);
        response.put_slice(&scramble);
        response.put_slice(handshake.auth_plugin_name.as_bytes());
        response.put_u8(0);

        self.write_packet(&response).await?;

        let reply = self.read_packet_timeout().await?;
        match reply.first() {
            Some(0x00) => Ok(()),
            Some(0x01) => {
                self.finish_caching_sha2(&reply, &handshake.salt, password)
                    .await
            }
            Some(0xFE) => {
                // auth switch request
                let name_end = reply[1..].iter().position(|&b| b == 0).unwrap_or(reply.len() - 1);
                let plugin = String::from_utf8_lossy(&reply[1..1 + name_end]).into_owned();
                let salt = reply[2 + name_end..].to_vec();
                debug!(plugin = %plugin, "auth switch requested");
                self.auth_switch(&plugin, &salt, password).await
            }
            Some(0xFF) => bail!("authentication failed: {}", error_message(&reply)),
            other => bail!("unexpected auth response: {:?}", other),
        }
    }

    async fn auth_switch(&mut self, plugin: &str, salt: &[u8], password: &str) -> Result<()> {
        let scramble = match plugin {
            "mysql_native_password" => scramble_sha1(password, salt),
            "caching_sha2_password" | "sha256_password" => scramble_sha256(password, salt),
            other => bail!("unsupported auth plugin for switch: {}", other),
        };
        self.write_packet(&scramble).await?;

        let reply = self.read_packet_timeout().await?;
        match reply.first() {
            Some(0x00) => Ok(()),
            Some(0x01) => self.finish_caching_sha2(&reply, salt, password).await,
            Some(0xFF) => bail!("auth switch failed: {}", error_message(&reply)),
            other => bail!("unexpected auth switch response: {:?}", other),
        }
    }

    /// Handle the `caching_sha2_password` continuation packet.
    ///
    /// `0x01 0x03` is fast-auth success. `0x01 0x04` demands full auth: the
    /// password goes over the wire XORed with the nonce and RSA-encrypted
    /// with the server's public key.
    async fn finish_caching_sha2(
        &mut self,
        reply: &[u8],
        nonce: &[u8],
        password: &str,
    ) -> Result<()> {
        match reply.get(1) {
            Some(0x03) => return Ok(()),
            Some(0x04) => {}
            other => bail!("unknown caching_sha2_password state: {:?}", other),
        }

        // request the server's RSA public key
        self.write_packet(&[0x02]).await?;
        let key_reply = self.read_packet_timeout().await?;
        match key_reply.first() {
            Some(0x01) => {}
            Some(0xFF) => bail!("public key request failed: {}", error_message(&key_reply)),
            other => bail!("unexpected public key response: {:?}", other),
        }

        let pem = String::from_utf8_lossy(&key_reply[1..]);
        let encrypted = rsa_encrypt_password(password, nonce, &pem)
            .context("failed to encrypt password with server public key")?;
        self.write_packet(&encrypted).await?;

        let final_reply = self.read_packet_timeout().await?;
        match final_reply.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => bail!("full authentication failed: {}", error_message(&final_reply)),
            other => bail!("unexpected final auth response: {:?}", other),
        }
    }

    /// Execute a statement, ignoring any result set.
    pub async fn query(&mut self, sql: &str) -> Result<()> {
        self.sequence_id = 0;

        let mut packet = BytesMut::with_capacity(sql.len() + 1);
        packet.put_u8(0x03); // COM_QUERY
        packet.put_slice(sql.as_bytes());
        self.write_packet(&packet).await?;

        let reply = self.read_packet_timeout().await?;
        match reply.first() {
            Some(0xFF) => bail!("query failed: {}", error_message(&reply)),
            _ => Ok(()),
        }
    }

    /// Register this connection as a replica.
    pub async fn register_replica(&mut self, server_id: u32) -> Result<()> {
        self.sequence_id = 0;

        let mut packet = BytesMut::with_capacity(18);
        packet.put_u8(0x15); // COM_REGISTER_SLAVE
        packet.put_u32_le(server_id);
        packet.put_u8(0); // hostname length
        packet.put_u8(0); // user length
        packet.put_u8(0); // password length
        packet.put_u16_le(0); // port
        packet.put_u32_le(0); // replication rank
        packet.put_u32_le(0); // master id
        self.write_packet(&packet).await?;

        let reply = self.read_packet_timeout().await?;
        match reply.first() {
            Some(0x00) => {
                info!(server_id, "registered as replica");
                Ok(())
            }
            Some(0xFF) => bail!("failed to register as replica: {}", error_message(&reply)),
            other => bail!("unexpected register response: {:?}", other),
        }
    }

    /// Request the binlog stream starting at `file:pos`.
    ///
    /// An empty file name asks the server for its oldest available log.
    pub async fn binlog_dump(
        &mut self,
        server_id: u32,
        file: &str,
        pos: u32,
    ) -> Result<EventStream<'_>> {
        self.sequence_id = 0;

        let mut packet = BytesMut::with_capacity(file.len() + 11);
        packet.put_u8(0x12); // COM_BINLOG_DUMP
        packet.put_u32_le(pos.max(4));
        packet.put_u16_le(0); // flags
        packet.put_u32_le(server_id);
        packet.put_slice(file.as_bytes());
        self.write_packet(&packet).await?;

        info!(file, pos, "requested binlog dump");
        Ok(EventStream { client: self })
    }
}

/// Raw binlog event payloads as delivered by the server.
pub struct EventStream<'a> {
    client: &'a mut BinlogClient,
}

impl EventStream<'_> {
    /// Next event payload; `None` on a clean EOF from the server.
    pub async fn next_event(&mut self) -> Result<Option<Bytes>> {
        let packet = self.client.read_packet().await?;
        if packet.is_empty() {
            return Ok(None);
        }

        match packet[0] {
            0x00 => Ok(Some(Bytes::from(packet[1..].to_vec()))),
            0xFE => {
                debug!("binlog stream EOF");
                Ok(None)
            }
            0xFF => bail!("binlog stream error: {}", error_message(&packet)),
            _ => Ok(Some(Bytes::from(packet))),
        }
    }
}

fn error_message(packet: &[u8]) -> String {
    if packet.len() < 9 {
        return "truncated error packet".to_string();
    }
    let code = u16::from_le_bytes([packet[1], packet[2]]);
    let text = String::from_utf8_lossy(&packet[9..]);
    format!("{} {}", code, text)
}

/// `mysql_native_password` scramble.
fn scramble_sha1(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// `caching_sha2_password` scramble.
fn scramble_sha256(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    let hash1 = Sha256::digest(password.as_bytes());
    let hash2 = Sha256::digest(hash1);

    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(salt);
    let hash3 = hasher.finalize();

    hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Encrypt the nonce-XORed password under the server's RSA public key.
fn rsa_encrypt_password(password: &str, nonce: &[u8], pem: &str) -> Result<Vec<u8>> {
    let der = pem_to_der(pem)?;
    let (n, e) = parse_rsa_public_key(&der)?;

    let mut plaintext = password.as_bytes().to_vec();
    plaintext.push(0);
    for (i, byte) in plaintext.iter_mut().enumerate() {
        *byte ^= nonce[i % nonce.len()];
    }

    let key = RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
        .map_err(|e| anyhow::anyhow!("invalid RSA public key: {}", e))?;
    let mut rng = OsRng;
    key.encrypt(&mut rng, Pkcs1v15Encrypt, &plaintext)
        .map_err(|e| anyhow::anyhow!("RSA encryption failed: {}", e))
}

fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    const BEGIN: &str = "-----BEGIN PUBLIC KEY-----";
    const END: &str = "-----END PUBLIC KEY-----";

    let start = pem
        .find(BEGIN)
        .ok_or_else(|| anyhow::anyhow!("invalid PEM: missing BEGIN marker"))?
        + BEGIN.len();
    let end = pem
        .find(END)
        .ok_or_else(|| anyhow::anyhow!("invalid PEM: missing END marker"))?;

    let body: String = pem[start..end].chars().filter(|c| !c.is_whitespace()).collect();

    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(&body)
        .context("failed to decode public key body")
}

/// Extract `(modulus, exponent)` from a DER SubjectPublicKeyInfo blob.
fn parse_rsa_public_key(der: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut pos = 0;

    let expect = |der: &[u8], pos: usize, tag: u8, what: &str| -> Result<()> {
        match der.get(pos) {
            Some(&b) if b == tag => Ok(()),
            _ => bail!("invalid DER: expected {}", what),
        }
    };

    expect(der, pos, 0x30, "outer SEQUENCE")?;
    pos += 1;
    let (_, skip) = der_length(&der[pos..])?;
    pos += skip;

    expect(der, pos, 0x30, "algorithm SEQUENCE")?;
    pos += 1;
    let (algo_len, skip) = der_length(&der[pos..])?;
    pos += skip + algo_len;

    expect(der, pos, 0x03, "BIT STRING")?;
    pos += 1;
    let (_, skip) = der_length(&der[pos..])?;
    pos += skip + 1; // unused-bits byte

    expect(der, pos, 0x30, "RSAPublicKey SEQUENCE")?;
    pos += 1;
    let (_, skip) = der_length(&der[pos..])?;
    pos += skip;

    expect(der, pos, 0x02, "modulus INTEGER")?;
    pos += 1;
    let (n_len, skip) = der_length(&der[pos..])?;
    pos += skip;
    let mut n = der[pos..pos + n_len].to_vec();
    if n.first() == Some(&0) {
        n.remove(0);
    }
    pos += n_len;

    expect(der, pos, 0x02, "exponent INTEGER")?;
    pos += 1;
    let (e_len, skip) = der_length(&der[pos..])?;
    pos += skip;
    let mut e = der[pos..pos + e_len].to_vec();
    if e.first() == Some(&0) {
        e.remove(0);
    }

    Ok((n, e))
}

fn der_length(data: &[u8]) -> Result<(usize, usize)> {
    match data.first() {
        None => bail!("invalid DER: empty length"),
        Some(&b) if b < 0x80 => Ok((b as usize, 1)),
        Some(0x81) => match data.get(1) {
            Some(&b) => Ok((b as usize, 2)),
            None => bail!("invalid DER: truncated length"),
        },
        Some(0x82) => match (data.get(1), data.get(2)) {
            (Some(&hi), Some(&lo)) => Ok((((hi as usize) << 8) | lo as usize, 3)),
            _ => bail!("invalid DER: truncated length"),
        },
        Some(&b) => bail!("invalid DER: unsupported length encoding 0x{:02X}", b),
    }
}
