//! Passive-mode FTP session over tokio sockets.
//!
//! Only the handful of commands the mirror needs: login, `TYPE I`, `CWD`,
//! `PASV`, `NLST`, `LIST`, `RETR` and `QUIT`.

use crate::config::RemoteConfig;
use crate::connection::{Connector, RemoteSession};
use crate::error::{RemoteError, RemoteResult};
use async_trait::async_trait;
use regex::Regex;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, trace};

/// Regex for the `h1,h2,h3,h4,p1,p2` tuple of a 227 reply
static PASV_REGEX: OnceLock<Regex> = OnceLock::new();

fn pasv_regex() -> &'static Regex {
    PASV_REGEX.get_or_init(|| {
        Regex::new(r"(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})")
            .expect("Invalid PASV regex")
    })
}

/// Final reply of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }
}

/// Split a reply line into code, continuation flag and text
pub fn parse_reply_line(line: &str) -> Option<(u16, bool, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.len() < 3 || !line.is_char_boundary(3) {
        return None;
    }
    let code: u16 = line[..3].parse().ok()?;
    match line[3..].chars().next() {
        None => Some((code, false, "")),
        Some(' ') => Some((code, false, &line[4..])),
        Some('-') => Some((code, true, &line[4..])),
        Some(_) => None,
    }
}

/// Data port announced by a 227 reply
pub fn parse_pasv_port(text: &str) -> Option<u16> {
    let caps = pasv_regex().captures(text)?;
    let high: u16 = caps.get(5)?.as_str().parse().ok()?;
    let low: u16 = caps.get(6)?.as_str().parse().ok()?;
    if high > 255 || low > 255 {
        return None;
    }
    Some(high * 256 + low)
}

/// Listing failures that only mean "this directory is empty"
fn is_empty_listing(reply: &Reply) -> bool {
    matches!(reply.code, 450 | 550) && reply.text.to_lowercase().contains("no files")
}

async fn within<T, F>(timeout: Duration, target: &str, operation: F) -> RemoteResult<T>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(RemoteError::Connection {
            target: target.to_string(),
            source,
        }),
        Err(_) => Err(RemoteError::Timeout {
            target: target.to_string(),
            seconds: timeout.as_secs(),
        }),
    }
}

/// Opens anonymous (or configured) FTP sessions
#[derive(Debug, Clone)]
pub struct FtpConnector {
    host: String,
    port: u16,
    user: String,
    password: String,
    timeout: Duration,
}

impl FtpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: "anonymous".to_string(),
            password: "anonymous@".to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_config(config: &RemoteConfig) -> Self {
        Self::new(config.host.clone(), config.port)
            .with_credentials(config.user.clone(), config.password.clone())
            .with_timeout(Duration::from_secs(config.timeout_seconds))
    }
}

#[async_trait]
impl Connector for FtpConnector {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn open(&self) -> RemoteResult<Box<dyn RemoteSession>> {
        let session = FtpSession::connect(
            &self.host,
            self.port,
            &self.user,
            &self.password,
            self.timeout,
        )
        .await?;
        Ok(Box::new(session))
    }
}

/// A logged-in control connection
pub struct FtpSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: IpAddr,
    timeout: Duration,
    cwd: String,
}

impl FtpSession {
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> RemoteResult<Self> {
        let endpoint = format!("{}:{}", host, port);
        let stream = within(timeout, &endpoint, TcpStream::connect(&endpoint)).await?;
        let peer = stream
            .peer_addr()
            .map_err(|source| RemoteError::Connection {
                target: endpoint.clone(),
                source,
            })?
            .ip();
        let (read_half, write_half) = stream.into_split();

        let mut session = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer,
            timeout,
            cwd: "/".to_string(),
        };

        let mut greeting = session.read_reply(&endpoint).await?;
        while greeting.is_preliminary() {
            greeting = session.read_reply(&endpoint).await?;
        }
        session.expect_completion(&endpoint, greeting)?;

        let reply = session.command(&format!("USER {}", user), &endpoint).await?;
        if reply.is_intermediate() {
            let reply = session
                .command(&format!("PASS {}", password), &endpoint)
                .await?;
            session.expect_completion(&endpoint, reply)?;
        } else {
            session.expect_completion(&endpoint, reply)?;
        }

        let reply = session.command("TYPE I", &endpoint).await?;
        session.expect_completion(&endpoint, reply)?;

        debug!(target = %endpoint, "ftp login complete");
        Ok(session)
    }

    fn target_for(&self, name: &str) -> String {
        if self.cwd.ends_with('/') {
            format!("{}{}", self.cwd, name)
        } else {
            format!("{}/{}", self.cwd, name)
        }
    }

    async fn read_reply(&mut self, target: &str) -> RemoteResult<Reply> {
        let timeout = self.timeout;
        let mut text = Vec::new();
        let mut code = None;

        loop {
            let mut line = String::new();
            let read = within(timeout, target, self.reader.read_line(&mut line)).await?;
            if read == 0 {
                return Err(RemoteError::Connection {
                    target: target.to_string(),
                    source: io::Error::new(io::ErrorKind::UnexpectedEof, "control connection closed"),
                });
            }
            trace!(target = %target, line = %line.trim_end(), "ftp <");

            match (parse_reply_line(&line), code) {
                (Some((line_code, continues, line_text)), None) => {
                    text.push(line_text.to_string());
                    if !continues {
                        return Ok(Reply {
                            code: line_code,
                            text: text.join("\n"),
                        });
                    }
                    code = Some(line_code);
                }
                (Some((line_code, false, line_text)), Some(first)) if line_code == first => {
                    text.push(line_text.to_string());
                    return Ok(Reply {
                        code: first,
                        text: text.join("\n"),
                    });
                }
                (_, Some(_)) => text.push(line.trim_end().to_string()),
                (None, None) => {
                    return Err(RemoteError::Protocol {
                        target: target.to_string(),
                        details: format!("malformed reply: {}", line.trim_end()),
                    });
                }
            }
        }
    }

    async fn send(&mut self, command: &str, target: &str) -> RemoteResult<()> {
        let timeout = self.timeout;
        let visible = if command.starts_with("PASS ") { "PASS ****" } else { command };
        trace!(target = %target, command = %visible, "ftp >");
        let line = format!("{}\r\n", command);
        within(timeout, target, async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.flush().await
        })
        .await
    }

    async fn command(&mut self, command: &str, target: &str) -> RemoteResult<Reply> {
        self.send(command, target).await?;
        self.read_reply(target).await
    }

    fn expect_completion(&self, target: &str, reply: Reply) -> RemoteResult<Reply> {
        if reply.is_completion() {
            Ok(reply)
        } else {
            Err(RemoteError::Reply {
                target: target.to_string(),
                code: reply.code,
                message: reply.text,
            })
        }
    }

    /// Enter passive mode and connect the data channel.
    ///
    /// The announced host is ignored in favour of the control connection's peer,
    /// which also works behind NAT.
    async fn open_data(&mut self, target: &str) -> RemoteResult<TcpStream> {
        let reply = self.command("PASV", target).await?;
        let reply = self.expect_completion(target, reply)?;
        let port = parse_pasv_port(&reply.text).ok_or_else(|| RemoteError::Protocol {
            target: target.to_string(),
            details: format!("unparseable PASV reply: {}", reply.text),
        })?;
        let address = SocketAddr::new(self.peer, port);
        within(self.timeout, target, TcpStream::connect(address)).await
    }

    /// Run a data-channel command, copying everything received into `sink`
    async fn transfer(
        &mut self,
        command: &str,
        target: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> RemoteResult<u64> {
        let timeout = self.timeout;
        let mut data = self.open_data(target).await?;
        let reply = self.command(command, target).await?;
        if !reply.is_preliminary() {
            if reply.is_completion() {
                // Some servers complete empty transfers without a 150
                return Ok(0);
            }
            return Err(RemoteError::Reply {
                target: target.to_string(),
                code: reply.code,
                message: reply.text,
            });
        }

        let local_error = |source| RemoteError::LocalIo {
            path: target.into(),
            source,
        };
        let mut total = 0u64;
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let read = within(timeout, target, data.read(&mut buffer)).await?;
            if read == 0 {
                break;
            }
            sink.write_all(&buffer[..read]).await.map_err(local_error)?;
            total += read as u64;
        }
        drop(data);
        sink.flush().await.map_err(local_error)?;

        let reply = self.read_reply(target).await?;
        self.expect_completion(target, reply)?;
        Ok(total)
    }

    async fn listing(&mut self, command: &str) -> RemoteResult<Vec<String>> {
        let target = self.cwd.clone();
        let mut raw: Vec<u8> = Vec::new();

        match self.transfer(command, &target, &mut raw).await {
            Ok(_) => Ok(String::from_utf8_lossy(&raw)
                .lines()
                .map(|line| line.trim_end_matches('\r'))
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()),
            Err(RemoteError::Reply { code, message, .. })
                if is_empty_listing(&Reply {
                    code,
                    text: message.clone(),
                }) =>
            {
                Err(RemoteError::NoEntries { target })
            }
            Err(error) => Err(error),
        }
    }
}

#[async_trait]
impl RemoteSession for FtpSession {
    async fn change_dir(&mut self, path: &str) -> RemoteResult<()> {
        let reply = self.command(&format!("CWD {}", path), path).await?;
        self.expect_completion(path, reply)?;
        self.cwd = path.to_string();
        Ok(())
    }

    async fn list_names(&mut self) -> RemoteResult<Vec<String>> {
        self.listing("NLST").await
    }

    async fn list_detailed(&mut self) -> RemoteResult<Vec<String>> {
        self.listing("LIST").await
    }

    async fn retrieve(
        &mut self,
        file: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> RemoteResult<u64> {
        let target = self.target_for(file);
        self.transfer(&format!("RETR {}", file), &target, sink).await
    }

    async fn close(&mut self) {
        let quit = tokio::time::timeout(Duration::from_secs(5), async {
            let _ = self.writer.write_all(b"QUIT\r\n").await;
            let _ = self.writer.flush().await;
            let mut line = String::new();
            let _ = self.reader.read_line(&mut line).await;
        });
        let _ = quit.await;
        let _ = self.writer.shutdown().await;
    }
}
