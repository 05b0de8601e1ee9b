use crate::config::duration_secs;
use crate::message::EnvelopeAddress;
use crate::virtual_mta::VirtualMta;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpSocket;
use tokio::time::timeout;

/// What the failed callback tells a transaction step to do next.
/// The callback is invoked synchronously with the verbatim peer reply
/// whenever the reply is not a success code; answering Abort terminates
/// the transaction without attempting later steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDisposition {
    Continue,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Complete,
    Aborted,
}

pub type FailedCallback<'a> = &'a mut (dyn FnMut(&str) -> StepDisposition + Send);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("i/o error during SMTP conversation: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for the peer")]
    TimedOut,
    #[error("malformed reply from peer: {0:?}")]
    Malformed(String),
}

/// The client-side operations a delivery transaction drives, in order:
/// HELO-or-RSET, MAIL FROM, RCPT TO, DATA. Implementations speak to one
/// peer over one connection; transport-level trouble surfaces as Err,
/// while unhappy peer replies go through the failed callback.
#[async_trait]
pub trait SmtpDelivery: Send {
    async fn exec_helo_or_rset(
        &mut self,
        failed: FailedCallback<'_>,
    ) -> Result<StepStatus, TransportError>;

    async fn exec_mail_from(
        &mut self,
        sender: &EnvelopeAddress,
        failed: FailedCallback<'_>,
    ) -> Result<StepStatus, TransportError>;

    async fn exec_rcpt_to(
        &mut self,
        recipient: &EnvelopeAddress,
        failed: FailedCallback<'_>,
    ) -> Result<StepStatus, TransportError>;

    async fn exec_data(
        &mut self,
        data: &[u8],
        failed: FailedCallback<'_>,
    ) -> Result<StepStatus, TransportError>;
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SmtpClientTimeouts {
    #[serde(
        default = "SmtpClientTimeouts::default_connect_timeout",
        with = "duration_secs"
    )]
    pub connect_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_greeting_timeout",
        with = "duration_secs"
    )]
    pub greeting_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_helo_timeout",
        with = "duration_secs"
    )]
    pub helo_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_mail_from_timeout",
        with = "duration_secs"
    )]
    pub mail_from_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_rcpt_to_timeout",
        with = "duration_secs"
    )]
    pub rcpt_to_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_data_timeout",
        with = "duration_secs"
    )]
    pub data_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_rset_timeout",
        with = "duration_secs"
    )]
    pub rset_timeout: Duration,
}

impl SmtpClientTimeouts {
    fn default_connect_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_greeting_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_helo_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_mail_from_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_rcpt_to_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_data_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_rset_timeout() -> Duration {
        Duration::from_secs(5)
    }
}

impl Default for SmtpClientTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: Self::default_connect_timeout(),
            greeting_timeout: Self::default_greeting_timeout(),
            helo_timeout: Self::default_helo_timeout(),
            mail_from_timeout: Self::default_mail_from_timeout(),
            rcpt_to_timeout: Self::default_rcpt_to_timeout(),
            data_timeout: Self::default_data_timeout(),
            rset_timeout: Self::default_rset_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    /// The reply as the peer sent it, CRLF stripped, continuation
    /// lines joined with newlines. Always begins with the code digits.
    pub text: String,
}

impl SmtpReply {
    pub fn is_success(&self) -> bool {
        self.code / 100 == 2
    }
}

/// A small SMTP speaker sufficient to drive the four transaction steps.
/// Generic over the stream so tests can run it over an in-memory duplex.
pub struct SmtpClient<S> {
    stream: BufStream<S>,
    timeouts: SmtpClientTimeouts,
    ehlo_hostname: String,
    greeted: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> SmtpClient<S> {
    pub fn with_stream(stream: S, ehlo_hostname: &str, timeouts: SmtpClientTimeouts) -> Self {
        Self {
            stream: BufStream::new(stream),
            timeouts,
            ehlo_hostname: ehlo_hostname.to_string(),
            greeted: false,
        }
    }

    /// Read the banner the peer sends on connect
    pub async fn read_greeting(&mut self) -> Result<SmtpReply, TransportError> {
        self.read_reply(self.timeouts.greeting_timeout).await
    }

    async fn read_reply(&mut self, duration: Duration) -> Result<SmtpReply, TransportError> {
        let mut text = String::new();
        loop {
            let mut line = String::new();
            let n = timeout(duration, self.stream.read_line(&mut line))
                .await
                .map_err(|_| TransportError::TimedOut)??;
            if n == 0 {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed the connection mid-reply",
                )));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.len() < 3 || !line.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
                return Err(TransportError::Malformed(line.to_string()));
            }
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(line);
            // "250-..." marks a continuation; "250 ..." or bare "250" ends it
            if line.as_bytes().get(3) != Some(&b'-') {
                break;
            }
        }
        let code = text[..3].parse::<u16>().map_err(|_| {
            // unreachable given the digit check above, but no panics here
            TransportError::Malformed(text.clone())
        })?;
        Ok(SmtpReply { code, text })
    }

    async fn send_command(
        &mut self,
        line: &str,
        duration: Duration,
    ) -> Result<SmtpReply, TransportError> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        self.read_reply(duration).await
    }

    /// Transmit the payload dot-stuffed, normalized to CRLF line
    /// endings, followed by the end-of-data marker.
    async fn write_data_payload(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut segments = data.split(|&b| b == b'\n').peekable();
        while let Some(segment) = segments.next() {
            let line = match segment.last() {
                Some(b'\r') => &segment[..segment.len() - 1],
                _ => segment,
            };
            if line.is_empty() && segments.peek().is_none() {
                // the payload ended with a newline; don't emit a stray blank line
                break;
            }
            if line.first() == Some(&b'.') {
                self.stream.write_all(b".").await?;
            }
            self.stream.write_all(line).await?;
            self.stream.write_all(b"\r\n").await?;
        }
        self.stream.write_all(b".\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    fn settle(reply: SmtpReply, failed: FailedCallback<'_>) -> StepStatus {
        if reply.is_success() {
            StepStatus::Complete
        } else {
            match failed(&reply.text) {
                StepDisposition::Continue => StepStatus::Complete,
                StepDisposition::Abort => StepStatus::Aborted,
            }
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> SmtpDelivery for SmtpClient<S> {
    /// HELO on a fresh connection, RSET when the connection is being
    /// reused for a subsequent message
    async fn exec_helo_or_rset(
        &mut self,
        failed: FailedCallback<'_>,
    ) -> Result<StepStatus, TransportError> {
        let reply = if self.greeted {
            self.send_command("RSET", self.timeouts.rset_timeout).await?
        } else {
            let command = format!("HELO {}", self.ehlo_hostname);
            let reply = self.send_command(&command, self.timeouts.helo_timeout).await?;
            if reply.is_success() {
                self.greeted = true;
            }
            reply
        };
        Ok(Self::settle(reply, failed))
    }

    async fn exec_mail_from(
        &mut self,
        sender: &EnvelopeAddress,
        failed: FailedCallback<'_>,
    ) -> Result<StepStatus, TransportError> {
        let command = format!("MAIL FROM:<{sender}>");
        let reply = self
            .send_command(&command, self.timeouts.mail_from_timeout)
            .await?;
        Ok(Self::settle(reply, failed))
    }

    async fn exec_rcpt_to(
        &mut self,
        recipient: &EnvelopeAddress,
        failed: FailedCallback<'_>,
    ) -> Result<StepStatus, TransportError> {
        let command = format!("RCPT TO:<{recipient}>");
        let reply = self
            .send_command(&command, self.timeouts.rcpt_to_timeout)
            .await?;
        Ok(Self::settle(reply, failed))
    }

    async fn exec_data(
        &mut self,
        data: &[u8],
        failed: FailedCallback<'_>,
    ) -> Result<StepStatus, TransportError> {
        let go_ahead = self.send_command("DATA", self.timeouts.data_timeout).await?;
        if go_ahead.code != 354 {
            return Ok(match failed(&go_ahead.text) {
                StepDisposition::Continue => StepStatus::Complete,
                StepDisposition::Abort => StepStatus::Aborted,
            });
        }
        self.write_data_payload(data).await?;
        let reply = self.read_reply(self.timeouts.data_timeout).await?;
        Ok(Self::settle(reply, failed))
    }
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("failed to connect: {0:#}")]
    Connect(#[source] anyhow::Error),
    /// The peer's banner told us to go away with a 421
    #[error("peer is unavailable: {0}")]
    Unavailable(String),
}

/// Produces connected, banner-checked clients for the pool
#[async_trait]
pub trait SmtpConnector: Send + Sync {
    async fn connect(
        &self,
        mta: &VirtualMta,
        mx_host: &str,
    ) -> Result<Box<dyn SmtpDelivery>, ConnectError>;
}

pub struct TcpConnector {
    timeouts: SmtpClientTimeouts,
    smtp_port: u16,
}

impl TcpConnector {
    pub fn new(timeouts: SmtpClientTimeouts, smtp_port: u16) -> Self {
        Self {
            timeouts,
            smtp_port,
        }
    }

    async fn connect_stream(
        &self,
        mta: &VirtualMta,
        mx_host: &str,
    ) -> anyhow::Result<tokio::net::TcpStream> {
        let port = mta.remote_port.unwrap_or(self.smtp_port);
        let addr = tokio::net::lookup_host((mx_host, port))
            .await
            .with_context(|| format!("resolving {mx_host}"))?
            .find(|addr| addr.is_ipv4() == mta.source_address.is_ipv4())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "{mx_host} has no address in the same family as source {}",
                    mta.source_address
                )
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .with_context(|| format!("make socket to connect to {addr:?}"))?;

        // No need for Nagle with SMTP request/response
        socket.set_nodelay(true)?;

        socket
            .bind(SocketAddr::new(mta.source_address, 0))
            .with_context(|| {
                format!(
                    "bind source address {} for virtual MTA {}",
                    mta.source_address, mta.name
                )
            })?;

        timeout(self.timeouts.connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| anyhow::anyhow!("timed out connecting to {addr:?}"))?
            .with_context(|| format!("connect to {addr:?}"))
    }
}

#[async_trait]
impl SmtpConnector for TcpConnector {
    async fn connect(
        &self,
        mta: &VirtualMta,
        mx_host: &str,
    ) -> Result<Box<dyn SmtpDelivery>, ConnectError> {
        let stream = self
            .connect_stream(mta, mx_host)
            .await
            .map_err(ConnectError::Connect)?;

        let mut client = SmtpClient::with_stream(stream, &mta.ehlo_hostname, self.timeouts);
        let banner = client
            .read_greeting()
            .await
            .map_err(|err| ConnectError::Connect(err.into()))?;
        if banner.code == 421 {
            return Err(ConnectError::Unavailable(banner.text));
        }
        if banner.code != 220 {
            return Err(ConnectError::Connect(anyhow::anyhow!(
                "unexpected banner from {mx_host}: {}",
                banner.text
            )));
        }
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::DuplexStream;

    /// Reads client commands line by line and answers with the scripted
    /// replies in order. Consumes a DATA payload (through the lone-dot
    /// terminator) before answering the post-payload reply.
    async fn scripted_server(stream: DuplexStream, replies: Vec<&'static str>) -> Vec<String> {
        let mut stream = BufStream::new(stream);
        let mut received = Vec::new();
        stream.write_all(b"220 mx.example.com ready\r\n").await.unwrap();
        stream.flush().await.unwrap();

        for reply in replies {
            let mut line = String::new();
            if stream.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let line = line.trim_end().to_string();
            if line == "DATA" {
                received.push(line);
                stream.write_all(b"354 go ahead\r\n").await.unwrap();
                stream.flush().await.unwrap();
                loop {
                    let mut payload_line = String::new();
                    stream.read_line(&mut payload_line).await.unwrap();
                    let trimmed = payload_line.trim_end().to_string();
                    received.push(format!("> {trimmed}"));
                    if trimmed == "." {
                        break;
                    }
                }
            } else {
                received.push(line);
            }
            stream.write_all(reply.as_bytes()).await.unwrap();
            stream.write_all(b"\r\n").await.unwrap();
            stream.flush().await.unwrap();
        }
        received
    }

    fn client(stream: DuplexStream) -> SmtpClient<DuplexStream> {
        SmtpClient::with_stream(stream, "relay.example.com", SmtpClientTimeouts::default())
    }

    fn never_failed(reply: &str) -> StepDisposition {
        panic!("failed callback invoked unexpectedly with {reply:?}");
    }

    #[tokio::test]
    async fn full_transaction_then_rset_on_reuse() {
        let (near, far) = tokio::io::duplex(4096);
        let server = tokio::spawn(scripted_server(
            far,
            vec![
                "250 hello",
                "250 sender ok",
                "250 recipient ok",
                "250 queued",
                "250 flushed",
            ],
        ));

        let mut client = client(near);
        client.read_greeting().await.unwrap();

        let sender = EnvelopeAddress::parse("from@here.com").unwrap();
        let recipient = EnvelopeAddress::parse("to@there.com").unwrap();

        let mut failed = never_failed;
        assert_eq!(
            client.exec_helo_or_rset(&mut failed).await.unwrap(),
            StepStatus::Complete
        );
        assert_eq!(
            client.exec_mail_from(&sender, &mut failed).await.unwrap(),
            StepStatus::Complete
        );
        assert_eq!(
            client.exec_rcpt_to(&recipient, &mut failed).await.unwrap(),
            StepStatus::Complete
        );
        assert_eq!(
            client
                .exec_data(b"Subject: hi\r\n\r\nbody\r\n", &mut failed)
                .await
                .unwrap(),
            StepStatus::Complete
        );
        // a second transaction on the same connection resets instead
        assert_eq!(
            client.exec_helo_or_rset(&mut failed).await.unwrap(),
            StepStatus::Complete
        );
        drop(client);

        let received = server.await.unwrap();
        assert_eq!(received[0], "HELO relay.example.com");
        assert_eq!(received[1], "MAIL FROM:<from@here.com>");
        assert_eq!(received[2], "RCPT TO:<to@there.com>");
        assert_eq!(received[3], "DATA");
        assert_eq!(received.last().unwrap(), "RSET");
    }

    #[tokio::test]
    async fn unhappy_reply_reaches_the_callback_verbatim() {
        let (near, far) = tokio::io::duplex(4096);
        tokio::spawn(scripted_server(far, vec!["250 hello", "550 no such user"]));

        let mut client = client(near);
        client.read_greeting().await.unwrap();

        let mut seen = None;
        let mut failed = |reply: &str| {
            seen = Some(reply.to_string());
            StepDisposition::Abort
        };
        let mut ok = never_failed;
        assert_eq!(
            client.exec_helo_or_rset(&mut ok).await.unwrap(),
            StepStatus::Complete
        );
        let sender = EnvelopeAddress::parse("from@here.com").unwrap();
        assert_eq!(
            client.exec_mail_from(&sender, &mut failed).await.unwrap(),
            StepStatus::Aborted
        );
        assert_eq!(seen.as_deref(), Some("550 no such user"));
    }

    #[tokio::test]
    async fn multiline_replies_fold_into_one() {
        let (near, mut far) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            far.write_all(b"250-mx.example.com greets you\r\n250-SIZE 1000000\r\n250 HELP\r\n")
                .await
                .unwrap();
        });

        let mut client = client(near);
        let reply = client.read_greeting().await.unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(
            reply.text,
            "250-mx.example.com greets you\n250-SIZE 1000000\n250 HELP"
        );
    }

    #[tokio::test]
    async fn data_payload_is_dot_stuffed() {
        let (near, far) = tokio::io::duplex(4096);
        let server = tokio::spawn(scripted_server(far, vec!["250 queued"]));

        let mut client = client(near);
        client.read_greeting().await.unwrap();
        // skip HELO so the only scripted exchange is DATA
        client.greeted = true;

        let mut failed = never_failed;
        assert_eq!(
            client
                .exec_data(b"first\n.\n..already\nlast", &mut failed)
                .await
                .unwrap(),
            StepStatus::Complete
        );
        drop(client);

        let received = server.await.unwrap();
        assert_eq!(
            received,
            vec![
                "DATA",
                "> first",
                "> ..",
                "> ...already",
                "> last",
                "> .",
            ]
        );
    }

    #[tokio::test]
    async fn peer_disconnect_is_a_transport_error() {
        let (near, far) = tokio::io::duplex(4096);
        drop(far);

        let mut client = client(near);
        let err = client.read_greeting().await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
