//! In-process PostgreSQL server speaking just enough of the v3
//! protocol for the integration tests: trust/cleartext auth, a set of
//! canned simple queries, and an echoing extended-query flow.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};

use poolgres::Config;

pub struct MockServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    password: Option<String>,
}

struct Session {
    stream: BufStream<TcpStream>,
    pid: u32,
    /// Transaction status byte reported in ReadyForQuery.
    txn: u8,
    /// Parameters captured from the last Bind.
    bind_params: Vec<Option<Vec<u8>>>,
}

impl MockServer {
    pub async fn spawn() -> Self {
        Self::start(None).await
    }

    pub async fn spawn_with_password(password: &str) -> Self {
        Self::start(Some(password.to_string())).await
    }

    async fn start(password: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let pid_counter = Arc::new(AtomicU32::new(1000));

        let accepted_clone = Arc::clone(&accepted);
        let password_clone = password.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                accepted_clone.fetch_add(1, Ordering::SeqCst);
                let pid = pid_counter.fetch_add(1, Ordering::SeqCst);
                let password = password_clone.clone();
                tokio::spawn(async move {
                    let session = Session {
                        stream: BufStream::new(socket),
                        pid,
                        txn: b'I',
                        bind_params: Vec::new(),
                    };
                    let _ = session.run(password).await;
                });
            }
        });

        Self {
            addr,
            accepted,
            password,
        }
    }

    pub fn config(&self) -> Config {
        Config {
            host: "127.0.0.1".into(),
            port: self.addr.port(),
            user: "test".into(),
            password: self.password.clone(),
            database: Some("testdb".into()),
            ssl_mode: poolgres::SslMode::Disable,
            io_timeout: std::time::Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// Total connections accepted since the server started.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

// === frame helpers ===

fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 5);
    out.push(tag);
    out.extend_from_slice(&((payload.len() as i32 + 4).to_be_bytes()));
    out.extend_from_slice(payload);
    out
}

fn cstr(s: &str) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.push(0);
    out
}

fn auth_ok() -> Vec<u8> {
    frame(b'R', &0_i32.to_be_bytes())
}

fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut payload = cstr(name);
    payload.extend_from_slice(&cstr(value));
    frame(b'S', &payload)
}

fn backend_key_data(pid: u32, secret: u32) -> Vec<u8> {
    let mut payload = pid.to_be_bytes().to_vec();
    payload.extend_from_slice(&secret.to_be_bytes());
    frame(b'K', &payload)
}

fn ready_for_query(status: u8) -> Vec<u8> {
    frame(b'Z', &[status])
}

fn row_description(columns: &[(&str, u32)]) -> Vec<u8> {
    let mut payload = (columns.len() as u16).to_be_bytes().to_vec();
    for (name, type_oid) in columns {
        payload.extend_from_slice(&cstr(name));
        payload.extend_from_slice(&0_u32.to_be_bytes()); // table oid
        payload.extend_from_slice(&0_i16.to_be_bytes()); // column id
        payload.extend_from_slice(&type_oid.to_be_bytes());
        payload.extend_from_slice(&(-1_i16).to_be_bytes()); // type size
        payload.extend_from_slice(&(-1_i32).to_be_bytes()); // type modifier
        payload.extend_from_slice(&0_u16.to_be_bytes()); // text format
    }
    frame(b'T', &payload)
}

fn data_row(fields: &[Option<&[u8]>]) -> Vec<u8> {
    let mut payload = (fields.len() as u16).to_be_bytes().to_vec();
    for field in fields {
        match field {
            Some(bytes) => {
                payload.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                payload.extend_from_slice(bytes);
            }
            None => payload.extend_from_slice(&(-1_i32).to_be_bytes()),
        }
    }
    frame(b'D', &payload)
}

fn command_complete(tag: &str) -> Vec<u8> {
    frame(b'C', &cstr(tag))
}

fn error_response(severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(b'S');
    payload.extend_from_slice(&cstr(severity));
    payload.push(b'V');
    payload.extend_from_slice(&cstr(severity));
    payload.push(b'C');
    payload.extend_from_slice(&cstr(code));
    payload.push(b'M');
    payload.extend_from_slice(&cstr(message));
    payload.push(0);
    frame(b'E', &payload)
}

fn notification(pid: u32, channel: &str, payload_text: &str) -> Vec<u8> {
    let mut payload = pid.to_be_bytes().to_vec();
    payload.extend_from_slice(&cstr(channel));
    payload.extend_from_slice(&cstr(payload_text));
    frame(b'A', &payload)
}

const INT4: u32 = 23;
const INT4_ARRAY: u32 = 1007;

impl Session {
    async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush().await
    }

    async fn read_startup(&mut self) -> std::io::Result<Vec<u8>> {
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len).await?;
        let len = i32::from_be_bytes(len) as usize;
        let mut payload = vec![0u8; len - 4];
        self.stream.read_exact(&mut payload).await?;
        Ok(payload)
    }

    async fn read_frame(&mut self) -> std::io::Result<(u8, Vec<u8>)> {
        let tag = self.stream.read_u8().await?;
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len).await?;
        let len = i32::from_be_bytes(len) as usize;
        let mut payload = vec![0u8; len - 4];
        self.stream.read_exact(&mut payload).await?;
        Ok((tag, payload))
    }

    async fn run(mut self, password: Option<String>) -> std::io::Result<()> {
        let startup = self.read_startup().await?;
        let code = i32::from_be_bytes([startup[0], startup[1], startup[2], startup[3]]);
        if code == 80877102 {
            // CancelRequest: pid + secret follow; the server just
            // closes the side channel.
            return Ok(());
        }
        assert_eq!(code, 196608, "unexpected protocol version");

        if let Some(expected) = password {
            // AuthenticationCleartextPassword
            self.send(&frame(b'R', &3_i32.to_be_bytes())).await?;
            self.flush().await?;

            let (tag, payload) = self.read_frame().await?;
            let supplied = payload.split(|b| *b == 0).next().unwrap_or_default();
            if tag != b'p' || supplied != expected.as_bytes() {
                self.send(&error_response(
                    "FATAL",
                    "28P01",
                    "password authentication failed",
                ))
                .await?;
                self.flush().await?;
                return Ok(());
            }
        }

        self.send(&auth_ok()).await?;
        self.send(&parameter_status("server_version", "17.0")).await?;
        self.send(&parameter_status("server_encoding", "UTF8")).await?;
        self.send(&backend_key_data(self.pid, 0xCAFE)).await?;
        self.send(&ready_for_query(b'I')).await?;
        self.flush().await?;

        loop {
            let (tag, payload) = match self.read_frame().await {
                Ok(message) => message,
                Err(_) => return Ok(()), // client went away
            };

            match tag {
                b'Q' => {
                    let sql = String::from_utf8_lossy(
                        payload.split(|b| *b == 0).next().unwrap_or_default(),
                    )
                    .into_owned();
                    if !self.simple_query(&sql).await? {
                        return Ok(());
                    }
                }
                b'P' => {
                    self.send(&frame(b'1', &[])).await?;
                }
                b'B' => {
                    self.bind_params = parse_bind_params(&payload);
                    self.send(&frame(b'2', &[])).await?;
                }
                b'D' => match payload.first().copied() {
                    Some(b'S') => {
                        // ParameterDescription: one int4 parameter.
                        let mut desc = 1_i16.to_be_bytes().to_vec();
                        desc.extend_from_slice(&INT4.to_be_bytes());
                        self.send(&frame(b't', &desc)).await?;
                        self.send(&row_description(&[("echo", INT4)])).await?;
                    }
                    _ => {
                        self.send(&row_description(&[("echo", INT4)])).await?;
                    }
                },
                b'E' => {
                    // Echo the first Bind parameter (binary int4) as text.
                    let rendered = self.bind_params.first().cloned().flatten().map(|bytes| {
                        if bytes.len() == 4 {
                            i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
                                .to_string()
                        } else {
                            String::from_utf8_lossy(&bytes).into_owned()
                        }
                    });
                    match rendered {
                        Some(text) => {
                            self.send(&data_row(&[Some(text.as_bytes())])).await?;
                        }
                        None if self.bind_params.is_empty() => {
                            self.send(&data_row(&[Some(b"1")])).await?;
                        }
                        None => {
                            self.send(&data_row(&[None])).await?;
                        }
                    }
                    self.send(&command_complete("SELECT 1")).await?;
                }
                b'C' => {
                    self.send(&frame(b'3', &[])).await?;
                }
                b'S' => {
                    self.send(&ready_for_query(self.txn)).await?;
                    self.flush().await?;
                }
                b'X' => return Ok(()),
                other => {
                    self.send(&error_response(
                        "ERROR",
                        "0A000",
                        &format!("unsupported frontend message '{}'", other as char),
                    ))
                    .await?;
                    self.send(&ready_for_query(self.txn)).await?;
                    self.flush().await?;
                }
            }
        }
    }

    /// Handle one canned simple query. Returns false to drop the
    /// connection abruptly.
    async fn simple_query(&mut self, sql: &str) -> std::io::Result<bool> {
        match sql {
            "" => {
                self.send(&frame(b'I', &[])).await?;
            }
            "SELECT pg_backend_pid()" => {
                let pid = self.pid.to_string();
                self.send(&row_description(&[("pg_backend_pid", INT4)]))
                    .await?;
                self.send(&data_row(&[Some(pid.as_bytes())])).await?;
                self.send(&command_complete("SELECT 1")).await?;
            }
            "SELECT pg_terminate_backend(pg_backend_pid())" => {
                // Kill the backend: drop the socket without ceremony.
                return Ok(false);
            }
            "SELECT 1" => {
                self.send(&row_description(&[("?column?", INT4)])).await?;
                self.send(&data_row(&[Some(b"1")])).await?;
                self.send(&command_complete("SELECT 1")).await?;
            }
            "BEGIN" => {
                self.txn = b'T';
                self.send(&command_complete("BEGIN")).await?;
            }
            "COMMIT" => {
                self.txn = b'I';
                self.send(&command_complete("COMMIT")).await?;
            }
            "ROLLBACK" => {
                self.txn = b'I';
                self.send(&command_complete("ROLLBACK")).await?;
            }
            "SELECT disconnect_after" => {
                // Answer normally, then drop the socket once the
                // client believes the connection is healthy.
                self.send(&row_description(&[("?column?", INT4)])).await?;
                self.send(&data_row(&[Some(b"1")])).await?;
                self.send(&command_complete("SELECT 1")).await?;
                self.send(&ready_for_query(self.txn)).await?;
                self.flush().await?;
                return Ok(false);
            }
            "SELECT fail_me" => {
                self.send(&error_response("ERROR", "42703", "column does not exist"))
                    .await?;
            }
            "NOTIFY events" => {
                self.send(&notification(self.pid, "events", "hello")).await?;
                self.send(&command_complete("NOTIFY")).await?;
            }
            literal if literal.starts_with("SELECT '") && literal.ends_with("'::int4[]") => {
                let inner = &literal["SELECT '".len()..literal.len() - "'::int4[]".len()];
                self.send(&row_description(&[("arr", INT4_ARRAY)])).await?;
                self.send(&data_row(&[Some(inner.as_bytes())])).await?;
                self.send(&command_complete("SELECT 1")).await?;
            }
            _ => {
                self.send(&error_response("ERROR", "42601", "syntax error"))
                    .await?;
            }
        }

        self.send(&ready_for_query(self.txn)).await?;
        self.flush().await?;
        Ok(true)
    }
}

/// Extract the parameter values from a Bind message payload.
fn parse_bind_params(payload: &[u8]) -> Vec<Option<Vec<u8>>> {
    let mut pos = 0;

    // portal and statement names
    for _ in 0..2 {
        while payload[pos] != 0 {
            pos += 1;
        }
        pos += 1;
    }

    // parameter format codes
    let nfmt = i16::from_be_bytes([payload[pos], payload[pos + 1]]) as usize;
    pos += 2 + nfmt * 2;

    // parameter values
    let nparams = i16::from_be_bytes([payload[pos], payload[pos + 1]]) as usize;
    pos += 2;

    let mut params = Vec::with_capacity(nparams);
    for _ in 0..nparams {
        let len = i32::from_be_bytes([
            payload[pos],
            payload[pos + 1],
            payload[pos + 2],
            payload[pos + 3],
        ]);
        pos += 4;
        if len == -1 {
            params.push(None);
        } else {
            let len = len as usize;
            params.push(Some(payload[pos..pos + len].to_vec()));
            pos += len;
        }
    }
    params
}
