//! Standalone client for a single Redis endpoint: connection dialing (with
//! optional TLS), a handshake state machine that runs once per new
//! connection, and per-request pipelining with write/read retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;

use coro_core::error::{CoreError, ErrorKind};

use crate::resp::{encode_command, Parser, RedisValue};

/// Anything the client can read/write bytes over: a live TCP socket in
/// production, an in-memory duplex pipe in tests.
pub trait RedisConnection: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RedisConnection for T {}

#[derive(Clone)]
pub struct TlsConfig {
    pub client_config: Arc<rustls::ClientConfig>,
}

#[derive(Clone)]
pub struct ClientParams {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
    /// 2 or 3.
    pub protover: u8,
    pub db: Option<i64>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_name: Option<String>,
    pub lib_name: Option<String>,
    pub lib_ver: Option<String>,
    pub readonly: bool,
    pub tracking: bool,
    pub no_evict: bool,
    pub no_touch: bool,
    /// Extra caller-supplied commands run as the final handshake stage.
    pub extra_handshake_commands: Vec<Vec<Bytes>>,
    pub response_size_cap: usize,
    pub send_timeout: Duration,
    pub recv_timeout: Duration,
    pub default_watch_timeout: Duration,
    pub watch_extra_timeout: Duration,
    pub retry_max: u32,
    pub pipe_handshake: bool,
}

impl ClientParams {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
            protover: 2,
            db: None,
            username: None,
            password: None,
            client_name: None,
            lib_name: None,
            lib_ver: None,
            readonly: false,
            tracking: false,
            no_evict: false,
            no_touch: false,
            extra_handshake_commands: Vec::new(),
            response_size_cap: 512 * 1024 * 1024,
            send_timeout: Duration::from_secs(5),
            recv_timeout: Duration::from_secs(5),
            default_watch_timeout: Duration::from_secs(5),
            watch_extra_timeout: Duration::from_secs(1),
            retry_max: 1,
            pipe_handshake: true,
        }
    }

    /// A URL-encoded serialization of every handshake-relevant parameter,
    /// used to look up the process-wide connection-sharing info-id: two
    /// clients configured identically can share one physical connection.
    pub fn conn_sharing_key(&self) -> String {
        let mut parts = vec![
            format!("host={}", urlencode(&self.host)),
            format!("port={}", self.port),
            format!("protover={}", self.protover),
        ];
        if let Some(db) = self.db {
            parts.push(format!("db={db}"));
        }
        if let Some(user) = &self.username {
            parts.push(format!("user={}", urlencode(user)));
        }
        if self.password.is_some() {
            parts.push("auth=1".to_string());
        }
        if let Some(name) = &self.client_name {
            parts.push(format!("name={}", urlencode(name)));
        }
        if self.readonly {
            parts.push("readonly=1".to_string());
        }
        if self.tracking {
            parts.push("tracking=1".to_string());
        }
        if self.tls.is_some() {
            parts.push("tls=1".to_string());
        }
        parts.join("&")
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

struct ConnInfoManager {
    table: DashMap<String, u64>,
    next_id: AtomicU64,
}

impl ConnInfoManager {
    fn global() -> &'static ConnInfoManager {
        static INSTANCE: OnceLock<ConnInfoManager> = OnceLock::new();
        INSTANCE.get_or_init(|| ConnInfoManager {
            table: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    fn info_id_for(&self, key: &str) -> u64 {
        if let Some(existing) = self.table.get(key) {
            return *existing;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *self.table.entry(key.to_string()).or_insert(id)
    }
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy)]
enum HandshakeStage {
    Hello3,
    Hello3Auth,
    Auth,
    SetName,
    Select,
    Readonly,
    Tracking,
    LibName,
    LibVer,
    NoEvict,
    NoTouch,
    User(usize),
}

fn vec_bytes(parts: &[&str]) -> Vec<Bytes> {
    parts.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect()
}

struct ConnState {
    conn: Option<Box<dyn RedisConnection>>,
    parser: Parser,
    handshake_done: bool,
}

/// A client bound to one logical connection. `conn_id == 0` means the
/// connection may be shared with other `Client`s configured identically
/// (same [`ClientParams::conn_sharing_key`]); a nonzero id marks an
/// exclusive connection client, whose requests always pin to the same
/// socket.
pub struct Client {
    params: ClientParams,
    state: AsyncMutex<ConnState>,
    conn_id: u64,
    info_id: u64,
}

impl Client {
    pub fn new(params: ClientParams) -> Self {
        let info_id = ConnInfoManager::global().info_id_for(&params.conn_sharing_key());
        Self {
            params,
            state: AsyncMutex::new(ConnState {
                conn: None,
                parser: Parser::new(),
                handshake_done: false,
            }),
            conn_id: 0,
            info_id,
        }
    }

    pub fn new_exclusive(params: ClientParams) -> Self {
        let mut client = Self::new(params);
        client.conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        client
    }

    /// Builds a client around an already-open connection instead of
    /// dialing one, skipping straight to the handshake on first use.
    pub fn from_connection(params: ClientParams, conn: impl RedisConnection + 'static) -> Self {
        let info_id = ConnInfoManager::global().info_id_for(&params.conn_sharing_key());
        Self {
            params,
            state: AsyncMutex::new(ConnState {
                conn: Some(Box::new(conn)),
                parser: Parser::new(),
                handshake_done: false,
            }),
            conn_id: 0,
            info_id,
        }
    }

    pub fn info_id(&self) -> u64 {
        self.info_id
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn is_exclusive(&self) -> bool {
        self.conn_id != 0
    }

    async fn dial(&self) -> Result<Box<dyn RedisConnection>, CoreError> {
        let addr = format!("{}:{}", self.params.host, self.params.port);
        let tcp = timeout(self.params.send_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| CoreError::timeout())?
            .map_err(|e| CoreError::new(ErrorKind::SysError, "tcp connect failed").with_cause(e))?;
        let _ = tcp.set_nodelay(true);
        match &self.params.tls {
            None => Ok(Box::new(tcp)),
            Some(tls) => {
                let connector = tokio_rustls::TlsConnector::from(tls.client_config.clone());
                let server_name = ServerName::try_from(self.params.host.clone())
                    .map_err(|_| CoreError::invalid_input("invalid TLS server name"))?;
                let stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| CoreError::new(ErrorKind::SslError, "tls handshake failed").with_cause(e))?;
                Ok(Box::new(stream))
            }
        }
    }

    fn stage_sequence(&self) -> Vec<HandshakeStage> {
        use HandshakeStage::*;
        let mut stages = Vec::new();
        if self.params.protover == 3 && self.params.password.is_some() {
            stages.push(Hello3Auth);
        } else {
            if self.params.protover == 3 {
                stages.push(Hello3);
            }
            stages.push(Auth);
            stages.push(SetName);
        }
        stages.push(Select);
        stages.push(Readonly);
        stages.push(Tracking);
        stages.push(LibName);
        stages.push(LibVer);
        stages.push(NoEvict);
        stages.push(NoTouch);
        for i in 0..self.params.extra_handshake_commands.len() {
            stages.push(User(i));
        }
        stages
    }

    fn build_stage_command(&self, stage: HandshakeStage) -> Option<Vec<Bytes>> {
        use HandshakeStage::*;
        match stage {
            Hello3 => Some(vec_bytes(&["HELLO", "3"])),
            Hello3Auth => {
                let user = self.params.username.clone().unwrap_or_else(|| "default".to_string());
                let pwd = self.params.password.clone()?;
                let mut cmd = vec_bytes(&["HELLO", "3", "AUTH"]);
                cmd.push(Bytes::from(user));
                cmd.push(Bytes::from(pwd));
                if let Some(name) = &self.params.client_name {
                    cmd.push(Bytes::from_static(b"SETNAME"));
                    cmd.push(Bytes::from(name.clone()));
                }
                Some(cmd)
            }
            Auth => {
                let pwd = self.params.password.clone()?;
                let mut cmd = vec_bytes(&["AUTH"]);
                if let Some(user) = &self.params.username {
                    cmd.push(Bytes::from(user.clone()));
                }
                cmd.push(Bytes::from(pwd));
                Some(cmd)
            }
            SetName => self.params.client_name.clone().map(|n| {
                let mut cmd = vec_bytes(&["CLIENT", "SETNAME"]);
                cmd.push(Bytes::from(n));
                cmd
            }),
            Select => self.params.db.map(|db| {
                let mut cmd = vec_bytes(&["SELECT"]);
                cmd.push(Bytes::from(db.to_string()));
                cmd
            }),
            Readonly => self.params.readonly.then(|| vec_bytes(&["READONLY"])),
            Tracking => self.params.tracking.then(|| vec_bytes(&["CLIENT", "TRACKING", "ON"])),
            LibName => self.params.lib_name.clone().map(|n| {
                let mut cmd = vec_bytes(&["CLIENT", "SETINFO", "LIB-NAME"]);
                cmd.push(Bytes::from(n));
                cmd
            }),
            LibVer => self.params.lib_ver.clone().map(|v| {
                let mut cmd = vec_bytes(&["CLIENT", "SETINFO", "LIB-VER"]);
                cmd.push(Bytes::from(v));
                cmd
            }),
            NoEvict => self.params.no_evict.then(|| vec_bytes(&["CLIENT", "NO-EVICT", "ON"])),
            NoTouch => self.params.no_touch.then(|| vec_bytes(&["CLIENT", "NO-TOUCH", "ON"])),
            User(idx) => self.params.extra_handshake_commands.get(idx).cloned(),
        }
    }

    fn handshake_commands(&self) -> Vec<(HandshakeStage, Vec<Bytes>)> {
        self.stage_sequence()
            .into_iter()
            .filter_map(|stage| self.build_stage_command(stage).map(|cmd| (stage, cmd)))
            .collect()
    }

    async fn run_handshake(&self, state: &mut ConnState) -> Result<(), CoreError> {
        let commands = self.handshake_commands();
        if commands.is_empty() {
            return Ok(());
        }
        let conn = state.conn.as_mut().expect("connection established before handshake");
        if self.params.pipe_handshake {
            let mut payload = BytesMut::new();
            for (_, cmd) in &commands {
                payload.extend_from_slice(&encode_command(cmd));
            }
            write_all_timeout(conn, &payload, self.params.send_timeout).await?;
            let replies = read_n_replies(
                conn,
                &mut state.parser,
                commands.len(),
                self.params.response_size_cap,
                self.params.recv_timeout,
            )
            .await?;
            for ((stage, _), reply) in commands.iter().zip(replies.iter()) {
                check_handshake_reply(*stage, reply)?;
            }
        } else {
            for (stage, cmd) in &commands {
                let encoded = encode_command(cmd);
                write_all_timeout(conn, &encoded, self.params.send_timeout).await?;
                let replies =
                    read_n_replies(conn, &mut state.parser, 1, self.params.response_size_cap, self.params.recv_timeout)
                        .await?;
                check_handshake_reply(*stage, &replies[0])?;
            }
        }
        Ok(())
    }

    async fn ensure_connected(&self, state: &mut ConnState) -> Result<(), CoreError> {
        if state.conn.is_none() {
            state.conn = Some(self.dial().await?);
            state.parser = Parser::new();
            state.handshake_done = false;
        }
        if !state.handshake_done {
            self.run_handshake(state).await?;
            state.handshake_done = true;
        }
        Ok(())
    }

    async fn reset_connection(&self) {
        let mut state = self.state.lock().await;
        state.conn = None;
        state.handshake_done = false;
    }

    /// Sends a single command and returns its reply.
    pub async fn execute(&self, command: &[Bytes]) -> Result<RedisValue, CoreError> {
        let commands = vec![command.to_vec()];
        let mut replies = self.execute_pipeline(&commands).await?;
        Ok(replies.remove(0))
    }

    /// Sends `commands` as one pipeline and returns their replies in order,
    /// retrying up to `retry_max` times on a connection-level failure.
    pub async fn execute_pipeline(&self, commands: &[Vec<Bytes>]) -> Result<Vec<RedisValue>, CoreError> {
        self.execute_pipeline_with_timeout(commands, self.params.recv_timeout).await
    }

    /// Like [`execute`](Self::execute), but for a blocking command
    /// (`BLPOP` and friends): `block_ms == 0` waits `default_watch_timeout`;
    /// `block_ms > 0` waits `block_ms + watch_extra_timeout`.
    pub async fn execute_blocking(&self, command: &[Bytes], block_ms: u64) -> Result<RedisValue, CoreError> {
        let read_timeout = if block_ms == 0 {
            self.params.default_watch_timeout
        } else {
            Duration::from_millis(block_ms) + self.params.watch_extra_timeout
        };
        let commands = vec![command.to_vec()];
        let mut replies = self.execute_pipeline_with_timeout(&commands, read_timeout).await?;
        Ok(replies.remove(0))
    }

    async fn execute_pipeline_with_timeout(
        &self,
        commands: &[Vec<Bytes>],
        read_timeout: Duration,
    ) -> Result<Vec<RedisValue>, CoreError> {
        let mut attempt = 0;
        loop {
            match self.try_execute_pipeline(commands, read_timeout).await {
                Ok(values) => return Ok(values),
                Err(err) if attempt < self.params.retry_max && is_retryable(&err) => {
                    attempt += 1;
                    self.reset_connection().await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_execute_pipeline(
        &self,
        commands: &[Vec<Bytes>],
        read_timeout: Duration,
    ) -> Result<Vec<RedisValue>, CoreError> {
        let mut state = self.state.lock().await;
        self.ensure_connected(&mut state).await?;
        let conn = state.conn.as_mut().expect("connected");
        let mut payload = BytesMut::new();
        for cmd in commands {
            payload.extend_from_slice(&encode_command(cmd));
        }
        write_all_timeout(conn, &payload, self.params.send_timeout).await?;
        read_n_replies(conn, &mut state.parser, commands.len(), self.params.response_size_cap, read_timeout).await
    }

    /// Closes the underlying connection. A `disconnect` on an
    /// already-closed exclusive connection is not an error: the local-only
    /// not-connected condition is exactly what was asked for.
    pub async fn disconnect(&self) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if let Some(mut conn) = state.conn.take() {
            match conn.shutdown().await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {}
                Err(e) => return Err(CoreError::new(ErrorKind::SysError, "disconnect failed").with_cause(e)),
            }
        }
        state.handshake_done = false;
        Ok(())
    }
}

fn check_handshake_reply(stage: HandshakeStage, reply: &RedisValue) -> Result<(), CoreError> {
    if reply.is_error() {
        return Err(CoreError::new(
            ErrorKind::TaskError,
            format!("handshake stage {stage:?} failed: {}", reply.as_error_message().unwrap_or("error")),
        ));
    }
    Ok(())
}

fn is_retryable(err: &CoreError) -> bool {
    matches!(err.kind(), ErrorKind::SysError | ErrorKind::Timeout | ErrorKind::Closed)
}

async fn write_all_timeout(conn: &mut Box<dyn RedisConnection>, data: &[u8], dur: Duration) -> Result<(), CoreError> {
    timeout(dur, conn.write_all(data))
        .await
        .map_err(|_| CoreError::timeout())?
        .map_err(|e| CoreError::new(ErrorKind::SysError, "write failed").with_cause(e))
}

async fn read_n_replies(
    conn: &mut Box<dyn RedisConnection>,
    parser: &mut Parser,
    n: usize,
    cap: usize,
    dur: Duration,
) -> Result<Vec<RedisValue>, CoreError> {
    match timeout(dur, read_n_replies_inner(conn, parser, n, cap)).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::timeout()),
    }
}

async fn read_n_replies_inner(
    conn: &mut Box<dyn RedisConnection>,
    parser: &mut Parser,
    n: usize,
    cap: usize,
) -> Result<Vec<RedisValue>, CoreError> {
    let mut out = Vec::with_capacity(n);
    let mut buf = [0u8; 8192];
    loop {
        let mut parsed = parser.parse_all()?;
        out.append(&mut parsed);
        if out.len() >= n {
            return Ok(out);
        }
        let read = conn
            .read(&mut buf)
            .await
            .map_err(|e| CoreError::new(ErrorKind::SysError, "read failed").with_cause(e))?;
        if read == 0 {
            return Err(CoreError::new(ErrorKind::Closed, "connection closed by peer"));
        }
        if parser.buffered_len() + read > cap {
            return Err(CoreError::invalid_input("response exceeds size cap"));
        }
        parser.append(&buf[..read]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_sharing_key_reflects_identity_relevant_params() {
        let a = ClientParams::new("localhost", 6379);
        let mut b = ClientParams::new("localhost", 6379);
        b.db = Some(1);
        assert_ne!(a.conn_sharing_key(), b.conn_sharing_key());
        let c = ClientParams::new("localhost", 6379);
        assert_eq!(a.conn_sharing_key(), c.conn_sharing_key());
    }

    #[test]
    fn protover3_with_password_uses_the_hello_shortcut() {
        let mut params = ClientParams::new("localhost", 6379);
        params.protover = 3;
        params.password = Some("secret".into());
        params.client_name = Some("myapp".into());
        let client = Client::new(params);
        let commands = client.handshake_commands();
        assert!(matches!(commands[0].0, HandshakeStage::Hello3Auth));
        let args: Vec<&[u8]> = commands[0].1.iter().map(|b| b.as_ref()).collect();
        assert_eq!(args[0], b"HELLO");
        assert!(args.contains(&b"AUTH".as_slice()));
        assert!(args.contains(&b"SETNAME".as_slice()));
    }

    #[test]
    fn unconfigured_stages_are_skipped_entirely() {
        let client = Client::new(ClientParams::new("localhost", 6379));
        assert!(client.handshake_commands().is_empty());
    }

    #[tokio::test]
    async fn executes_a_command_over_a_mock_connection() {
        let (client_side, mut server_side) = tokio::io::duplex(4096);
        let client = Client::from_connection(ClientParams::new("localhost", 6379), client_side);

        let server = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let n = server_side.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*1\r\n$4\r\nPING\r\n");
            server_side.write_all(b"+PONG\r\n").await.unwrap();
        });

        let reply = client.execute(&[Bytes::from_static(b"PING")]).await.unwrap();
        assert_eq!(reply.as_bulk_str(), Some("PONG"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn pipelined_handshake_runs_before_the_first_command() {
        let (client_side, mut server_side) = tokio::io::duplex(8192);
        let mut params = ClientParams::new("localhost", 6379);
        params.client_name = Some("myapp".into());
        params.db = Some(2);
        let client = Client::from_connection(params, client_side);

        let server = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let n = server_side.read(&mut buf).await.unwrap();
            let sent = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(sent.contains("SETNAME"));
            assert!(sent.contains("SELECT"));
            // Two handshake commands, then reply +OK twice, then PING/+PONG.
            server_side.write_all(b"+OK\r\n+OK\r\n").await.unwrap();
            let n = server_side.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*1\r\n$4\r\nPING\r\n");
            server_side.write_all(b"+PONG\r\n").await.unwrap();
        });

        let reply = client.execute(&[Bytes::from_static(b"PING")]).await.unwrap();
        assert_eq!(reply.as_bulk_str(), Some("PONG"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_error_surfaces_as_task_error() {
        let (client_side, mut server_side) = tokio::io::duplex(4096);
        let mut params = ClientParams::new("localhost", 6379);
        params.password = Some("wrong".into());
        let client = Client::from_connection(params, client_side);

        let server = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = server_side.read(&mut buf).await.unwrap();
            server_side.write_all(b"-ERR invalid password\r\n").await.unwrap();
        });

        let err = client.execute(&[Bytes::from_static(b"PING")]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskError);
        server.await.unwrap();
    }
}
