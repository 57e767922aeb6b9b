//! Non-blocking socket used by [`RawConn`](super::RawConn).
//!
//! Only readiness events and `try_*` calls are used, never the
//! `AsyncRead`/`AsyncWrite` adapters.

use std::io;

use tokio::net::{TcpStream, UnixStream};

use crate::error::{Error, Result};
use crate::opts::Opts;

pub enum Socket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// Where a socket connects to. Kept for out-of-band cancel requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Tcp { host: String, port: u16 },
    Unix(String),
}

impl Target {
    pub fn from_opts(opts: &Opts) -> Result<Self> {
        match &opts.socket {
            Some(path) => Ok(Target::Unix(path.clone())),
            None if opts.host.is_empty() => Err(Error::Connection("host is empty".into())),
            None => Ok(Target::Tcp {
                host: opts.host.clone(),
                port: opts.port,
            }),
        }
    }
}

impl Socket {
    pub async fn connect(target: &Target) -> Result<Self> {
        match target {
            Target::Tcp { host, port } => {
                let tcp = TcpStream::connect((host.as_str(), *port)).await?;
                tcp.set_nodelay(true)?;
                Ok(Socket::Tcp(tcp))
            }
            Target::Unix(path) => Ok(Socket::Unix(UnixStream::connect(path).await?)),
        }
    }

    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.try_read(buf),
            Socket::Unix(s) => s.try_read(buf),
        }
    }

    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.try_write(buf),
            Socket::Unix(s) => s.try_write(buf),
        }
    }

    pub async fn readable(&self) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.readable().await,
            Socket::Unix(s) => s.readable().await,
        }
    }

    pub async fn writable(&self) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.writable().await,
            Socket::Unix(s) => s.writable().await,
        }
    }
}
