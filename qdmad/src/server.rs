//! Control channel
//!
//! One datagram in, one datagram out. The reply goes back to the address the
//! request came from, so clients must bind their own socket.

use std::fs;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, info, trace, warn};
use qdma_core::ControlServer;

/// Largest request accepted; anything longer is cut off and fails to decode.
const REQUEST_BUFLEN: usize = 4096;

pub struct ControlSocket {
    socket: UnixDatagram,
    path: PathBuf,
}

impl ControlSocket {
    /// Bind `path`, replacing a stale socket left behind by a previous run.
    pub fn bind(path: &Path) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        match fs::remove_file(path) {
            Ok(()) => debug!("removed stale {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
        let socket = UnixDatagram::bind(path)
            .with_context(|| format!("failed to bind {}", path.display()))?;
        info!("listening on {}", path.display());
        Ok(ControlSocket {
            socket,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Receive one request and answer it.
    pub fn serve_one(&self, server: &ControlServer) -> io::Result<()> {
        let mut buf = [0u8; REQUEST_BUFLEN];
        let (len, peer) = self.socket.recv_from(&mut buf)?;
        trace!("request of {} bytes", len);

        let reply = server.handle(&buf[..len]);
        match peer.as_pathname() {
            Some(peer) => {
                self.socket.send_to(&reply, peer)?;
            }
            None => warn!("request from an unbound socket, no reply sent"),
        }
        Ok(())
    }

    pub fn serve(&self, server: &ControlServer) -> ! {
        loop {
            if let Err(e) = self.serve_one(server) {
                warn!("{}: {}", self.path.display(), e);
            }
        }
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use qdma_core::{DeviceConfig, DriverRegistry, HostPages, SoftEngine};
    use qdma_nl::ctrl::Family;
    use qdma_nl::{Attrs, Frame, Message, Op};

    #[test]
    fn test_round_trip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(DriverRegistry::init(
            Arc::new(SoftEngine::new()),
            Arc::new(HostPages::new()),
            false,
        ));
        registry.attach(&DeviceConfig::default()).unwrap();
        let server = ControlServer::new(registry);

        let control = ControlSocket::bind(&dir.path().join("run/xnl_pf.sock")).unwrap();
        let client = UnixDatagram::bind(dir.path().join("client.sock")).unwrap();
        let mut buf = [0u8; 1024];

        client
            .send_to(&Family::lookup("xnl_pf").encode(), control.path())
            .unwrap();
        control.serve_one(&server).unwrap();
        let n = client.recv(&mut buf).unwrap();
        let id = match Frame::decode(&buf[..n]).unwrap() {
            Frame::Control(family) => family.id.unwrap(),
            other => panic!("unexpected {:?}", other),
        };

        let mut req = Message::request(id, Op::DevList, Attrs::new());
        req.seq = 7;
        client.send_to(&req.encode(), control.path()).unwrap();
        control.serve_one(&server).unwrap();
        let n = client.recv(&mut buf).unwrap();
        match Frame::decode(&buf[..n]).unwrap() {
            Frame::Message(m) => {
                assert_eq!(m.seq, 7);
                assert!(m.attrs.str(qdma_nl::AttrType::GenMsg).unwrap().starts_with("qdma0\t"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stale_socket_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xnl_pf.sock");
        fs::write(&path, b"").unwrap();
        let control = ControlSocket::bind(&path).unwrap();
        drop(control);
        assert!(!path.exists());
    }
}
