//! Client for the remote approximate-membership service.
//!
//! Wire format, one command per connection, newline terminated:
//!
//! | Command        | Success                  | Failure          |
//! |----------------|--------------------------|------------------|
//! | `POST <url>`   | `201 Created`            | `409 Conflict`   |
//! | `DELETE <url>` | `204 No Content`         | `404 Not Found`  |
//! | `GET <url>`    | `200 Ok` + flag line     | `404 Not Found`  |
//!
//! The flag line holds one or more `true`/`false` tokens (the service reports
//! the approximate filter first and the exact check second). A URL counts as
//! blacklisted only when every token is `true`.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, warn};

use super::{AddOutcome, BlacklistOracle, RemoveOutcome, validate_url};
use crate::error::{MailError, MailResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
    Delete,
}

impl Verb {
    fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    Created,
    NoContent,
    NotFound,
    Conflict,
    Other(String),
}

pub fn encode_command(verb: Verb, url: &str) -> String {
    format!("{verb} {url}\n")
}

pub fn parse_status(line: &str) -> Status {
    let line = line.trim();
    let code = line.split_whitespace().next().unwrap_or_default();
    match code {
        "200" => Status::Ok,
        "201" => Status::Created,
        "204" => Status::NoContent,
        "404" => Status::NotFound,
        "409" => Status::Conflict,
        _ => Status::Other(line.to_string()),
    }
}

/// Parses the flag line that follows `200 Ok`. `None` when the line is not a
/// sequence of boolean tokens.
pub fn parse_membership(line: &str) -> Option<bool> {
    let mut tokens = line.split_whitespace().peekable();
    tokens.peek()?;

    let mut all_true = true;
    for token in tokens {
        match token {
            "true" => {}
            "false" => all_true = false,
            _ => return None,
        }
    }
    Some(all_true)
}

#[derive(Debug)]
struct Reply {
    status: Status,
    member: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct RemoteOracle {
    address: String,
    timeout: Duration,
}

impl RemoteOracle {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn exchange(&self, verb: Verb, url: &str) -> MailResult<Reply> {
        let command = encode_command(verb, url);
        let address = self.address.as_str();

        let reply = time::timeout(self.timeout, async {
            let stream = TcpStream::connect(address).await?;
            let (read_half, mut write_half) = stream.into_split();
            write_half.write_all(command.as_bytes()).await?;
            write_half.flush().await?;

            let mut reader = BufReader::new(read_half);
            let status_line = read_line(&mut reader).await?;
            let status = parse_status(&status_line);

            let member = if verb == Verb::Get && status == Status::Ok {
                let flags = read_non_blank_line(&mut reader).await?;
                Some(parse_membership(&flags).ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("malformed membership line `{}`", flags.trim()),
                    )
                })?)
            } else {
                None
            };

            Ok::<_, std::io::Error>(Reply { status, member })
        })
        .await;

        match reply {
            Ok(Ok(reply)) => {
                debug!(%verb, url, status = ?reply.status, "oracle reply");
                Ok(reply)
            }
            Ok(Err(err)) => {
                warn!(%verb, url, address, error = %err, "oracle exchange failed");
                Err(MailError::OracleUnavailable(format!("{address}: {err}")))
            }
            Err(_) => {
                warn!(%verb, url, address, timeout_ms = self.timeout.as_millis() as u64, "oracle timed out");
                Err(MailError::OracleUnavailable(format!(
                    "{address}: no reply within {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

async fn read_line<R>(reader: &mut R) -> std::io::Result<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before a reply",
        ));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn read_non_blank_line<R>(reader: &mut R) -> std::io::Result<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        let line = read_line(reader).await?;
        if !line.trim().is_empty() {
            return Ok(line);
        }
    }
}

fn unexpected(verb: Verb, url: &str, status: Status) -> MailError {
    MailError::OracleUnavailable(format!("unexpected reply to {verb} {url}: {status:?}"))
}

#[async_trait]
impl BlacklistOracle for RemoteOracle {
    async fn is_blacklisted(&self, url: &str) -> MailResult<bool> {
        let url = validate_url(url)?;
        let reply = self.exchange(Verb::Get, url).await?;
        match (reply.status, reply.member) {
            (Status::Ok, Some(member)) => Ok(member),
            (Status::NotFound, _) => Ok(false),
            (status, _) => Err(unexpected(Verb::Get, url, status)),
        }
    }

    async fn add(&self, url: &str) -> MailResult<AddOutcome> {
        let url = validate_url(url)?;
        match self.exchange(Verb::Post, url).await?.status {
            Status::Created => Ok(AddOutcome::Added),
            Status::Conflict => Ok(AddOutcome::AlreadyPresent),
            status => Err(unexpected(Verb::Post, url, status)),
        }
    }

    async fn remove(&self, url: &str) -> MailResult<RemoveOutcome> {
        let url = validate_url(url)?;
        match self.exchange(Verb::Delete, url).await?.status {
            Status::NoContent => Ok(RemoveOutcome::Removed),
            Status::NotFound => Ok(RemoveOutcome::NotFound),
            status => Err(unexpected(Verb::Delete, url, status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encodes_commands() {
        assert_eq!(encode_command(Verb::Post, "http://a.test"), "POST http://a.test\n");
        assert_eq!(encode_command(Verb::Delete, "x"), "DELETE x\n");
        assert_eq!(encode_command(Verb::Get, "x"), "GET x\n");
    }

    #[test]
    fn test_parses_status_lines() {
        assert_eq!(parse_status("200 Ok"), Status::Ok);
        assert_eq!(parse_status("201 Created\r"), Status::Created);
        assert_eq!(parse_status("204 No Content"), Status::NoContent);
        assert_eq!(parse_status("404 Not Found"), Status::NotFound);
        assert_eq!(parse_status("409 Conflict"), Status::Conflict);
        assert_eq!(
            parse_status("400 Bad Request"),
            Status::Other("400 Bad Request".to_string())
        );
        assert_eq!(parse_status(""), Status::Other(String::new()));
    }

    #[test]
    fn test_membership_requires_every_flag() {
        assert_eq!(parse_membership("true"), Some(true));
        assert_eq!(parse_membership("true true"), Some(true));
        assert_eq!(parse_membership("true false"), Some(false));
        assert_eq!(parse_membership("false "), Some(false));
        assert_eq!(parse_membership(""), None);
        assert_eq!(parse_membership("maybe"), None);
    }
}
