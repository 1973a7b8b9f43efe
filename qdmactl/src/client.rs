//! Control protocol client
//!
//! Resolves the family id once through the controller, then sends one
//! request per call and waits for the matching reply.

use core::fmt;
use std::env;
use std::fs;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use log::{debug, trace};
use qdma_nl::ctrl::Family;
use qdma_nl::{Attrs, Frame, Message, Op};

pub const RUN_DIR_DEFAULT: &str = "/run/qdma";

/// Reply buffer for the family lookup.
const CTRL_REPLY_BUFLEN: usize = 256;
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum ClientError {
    Io(io::Error),
    /// Reply did not decode
    Protocol(qdma_nl::Error),
    /// The driver refused the request
    Remote { errno: i32, message: Option<String> },
    /// Reply decoded but answers something else
    UnexpectedReply,
}

impl ClientError {
    pub fn errno(&self) -> Option<i32> {
        match self {
            ClientError::Remote { errno, .. } => Some(*errno),
            ClientError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Io(e) => write!(f, "{}", e),
            ClientError::Protocol(e) => write!(f, "bad reply: {}", e),
            ClientError::Remote {
                errno,
                message: Some(message),
            } => write!(f, "{} ({})", message, io::Error::from_raw_os_error(*errno)),
            ClientError::Remote {
                errno,
                message: None,
            } => write!(f, "{}", io::Error::from_raw_os_error(*errno)),
            ClientError::UnexpectedReply => write!(f, "unexpected reply"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Io(e) => Some(e),
            ClientError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

impl From<qdma_nl::Error> for ClientError {
    fn from(e: qdma_nl::Error) -> Self {
        ClientError::Protocol(e)
    }
}

pub type Result<T, E = ClientError> = core::result::Result<T, E>;

/// Request/reply transport to one driver instance.
pub trait Channel {
    /// Send `req` and return a reply of at most `reply_len` bytes.
    fn transact(&mut self, req: &[u8], reply_len: usize) -> io::Result<Vec<u8>>;
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn transact(&mut self, req: &[u8], reply_len: usize) -> io::Result<Vec<u8>> {
        (**self).transact(req, reply_len)
    }
}

/// Datagram socket to a running `qdmad`.
pub struct SocketChannel {
    socket: UnixDatagram,
    local: PathBuf,
    peer: PathBuf,
}

impl SocketChannel {
    /// Directory holding the driver sockets, `QDMA_RUN_DIR` if set.
    pub fn run_dir() -> PathBuf {
        env::var_os("QDMA_RUN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(RUN_DIR_DEFAULT))
    }

    /// Connect to the PF or VF driver under `run_dir`.
    pub fn connect(run_dir: &Path, vf: bool) -> io::Result<Self> {
        let peer = run_dir.join(format!("{}.sock", qdma_nl::family_name(vf)));
        let local = run_dir.join(format!("qdmactl.{}.sock", process::id()));
        let _ = fs::remove_file(&local);
        let socket = UnixDatagram::bind(&local)?;
        socket.set_read_timeout(Some(REPLY_TIMEOUT))?;
        if let Err(e) = socket.connect(&peer) {
            let _ = fs::remove_file(&local);
            return Err(io::Error::new(
                e.kind(),
                format!("{}: {}", peer.display(), e),
            ));
        }
        debug!("{} -> {}", local.display(), peer.display());
        Ok(SocketChannel {
            socket,
            local,
            peer,
        })
    }

    pub fn peer(&self) -> &Path {
        &self.peer
    }
}

impl Channel for SocketChannel {
    fn transact(&mut self, req: &[u8], reply_len: usize) -> io::Result<Vec<u8>> {
        self.socket.send(req)?;
        let mut buf = vec![0u8; reply_len];
        let n = self.socket.recv(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.local);
    }
}

/// One session with a driver family.
pub struct Client<C> {
    chan: C,
    family: u16,
    seq: u32,
    pid: u32,
}

impl<C: Channel> Client<C> {
    /// Resolve the PF or VF family over `chan`.
    pub fn connect(mut chan: C, vf: bool) -> Result<Self> {
        let name = qdma_nl::family_name(vf);
        let mut lookup = Family::lookup(name);
        let pid = process::id();
        lookup.pid = pid;
        let reply = chan.transact(&lookup.encode(), CTRL_REPLY_BUFLEN)?;
        let family = match Frame::decode(&reply)? {
            Frame::Control(Family { id: Some(id), .. }) => id,
            Frame::Error(e) => {
                return Err(ClientError::Remote {
                    errno: e.errno,
                    message: Some(format!("family {} not found", name)),
                })
            }
            _ => return Err(ClientError::UnexpectedReply),
        };
        debug!("family {} = {:#x}", name, family);
        Ok(Client {
            chan,
            family,
            seq: 0,
            pid,
        })
    }

    pub fn family(&self) -> u16 {
        self.family
    }

    /// Send `op` with `attrs`; the reply's attributes on success.
    pub fn call(&mut self, op: Op, attrs: Attrs) -> Result<Attrs> {
        self.seq = self.seq.wrapping_add(1);
        let mut req = Message::request(self.family, op, attrs);
        req.seq = self.seq;
        req.pid = self.pid;
        trace!("{} seq {}", op.name(), req.seq);

        let reply = self.chan.transact(&req.encode(), op.response_buflen())?;
        match Frame::decode(&reply)? {
            frame if frame.seq() != self.seq => {
                debug!("reply seq {} for request {}", frame.seq(), self.seq);
                Err(ClientError::UnexpectedReply)
            }
            Frame::Message(m) if m.op == op => Ok(m.attrs),
            Frame::Error(e) => Err(ClientError::Remote {
                errno: e.errno,
                message: e.message,
            }),
            _ => Err(ClientError::UnexpectedReply),
        }
    }
}
