//! Command dispatch
//!
//! [`ControlServer::handle`] takes one request datagram and produces exactly
//! one reply datagram: the family id for a controller lookup, the command's
//! reply attributes, or an error reply. Requests that do not decode get an
//! error reply without attributes; failures after decoding carry a short
//! diagnostic in `GENMSG`.

use std::sync::Arc;

use log::{debug, info, trace};
use qdma_nl::ctrl::{self, Family, CTRL_CMD_GETFAMILY};
use qdma_nl::msg::{Header, RawMessage};
use qdma_nl::{
    family_name, AttrType, Attrs, ErrorReply, Message, Op, QueueFlags, WrbDescSize,
    XNL_ERR_BUFLEN,
};

use crate::engine::QueueConfig;
use crate::error::{Error, Result};
use crate::registry::{Device, DriverRegistry};
use crate::request::Direction;

/// Family id handed out for the PF family; the VF family gets the next one.
pub const XNL_FAMILY_ID_BASE: u16 = ctrl::GENL_ID_CTRL + 1;

/// Serves the control protocol for one registry.
pub struct ControlServer {
    registry: Arc<DriverRegistry>,
    family_name: &'static str,
    family_id: u16,
}

impl ControlServer {
    pub fn new(registry: Arc<DriverRegistry>) -> Self {
        let vf = registry.is_vf();
        ControlServer {
            registry,
            family_name: family_name(vf),
            family_id: XNL_FAMILY_ID_BASE + u16::from(vf),
        }
    }

    pub fn family_name(&self) -> &'static str {
        self.family_name
    }

    pub fn family_id(&self) -> u16 {
        self.family_id
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    /// Answer one request.
    pub fn handle(&self, request: &[u8]) -> Vec<u8> {
        let header = match Header::parse(request) {
            Ok(header) => header,
            Err(e) => {
                info!("bad request: {}", e);
                return ErrorReply::new(0, 0, e.errno()).encode();
            }
        };

        match header.msg_type {
            ctrl::GENL_ID_CTRL => self.handle_ctrl(header, request),
            ty if ty == self.family_id => self.handle_xnl(header, request),
            ty => {
                info!("request for unknown family {:#x}", ty);
                ErrorReply::new(header.seq, header.pid, libc::ENOENT).encode()
            }
        }
    }

    fn handle_ctrl(&self, header: Header, request: &[u8]) -> Vec<u8> {
        let lookup = match Family::decode(request) {
            Ok(lookup) => lookup,
            Err(e) => {
                info!("bad controller request: {}", e);
                return ErrorReply::new(header.seq, header.pid, e.errno()).encode();
            }
        };
        if lookup.cmd != CTRL_CMD_GETFAMILY {
            return ErrorReply::new(header.seq, header.pid, libc::EOPNOTSUPP).encode();
        }
        if lookup.name.as_deref() != Some(self.family_name) {
            debug!("family {:?} not served here", lookup.name);
            return ErrorReply::new(header.seq, header.pid, libc::ENOENT).encode();
        }
        lookup.reply(self.family_id).encode()
    }

    fn handle_xnl(&self, header: Header, request: &[u8]) -> Vec<u8> {
        let msg = match RawMessage::parse(request).and_then(|raw| Message::from_raw(&raw)) {
            Ok(msg) => msg,
            Err(e) => {
                info!("bad request, seq {}: {}", header.seq, e);
                return ErrorReply::new(header.seq, header.pid, e.errno()).encode();
            }
        };
        trace!(
            "recv {} seq {} pid {}, {} attrs",
            msg.op.name(),
            msg.seq,
            msg.pid,
            msg.attrs.len()
        );

        match self.dispatch(msg.op, &msg.attrs) {
            Ok(attrs) => {
                let mut reply = msg.reply(attrs);
                reply.fit_to(msg.op.response_buflen());
                reply.encode()
            }
            Err(e) => {
                info!("{} failed: {}", msg.op.name(), e);
                let mut text = e.to_string();
                truncate(&mut text, XNL_ERR_BUFLEN - 1);
                ErrorReply::new(msg.seq, msg.pid, e.errno())
                    .with_message(msg.op as u8, text)
                    .encode()
            }
        }
    }

    /// Run one decoded command against the registry.
    pub fn dispatch(&self, op: Op, attrs: &Attrs) -> Result<Attrs> {
        for ty in op.required_attrs() {
            if !attrs.contains(*ty) {
                return Err(Error::MissingAttribute(*ty));
            }
        }

        match op {
            Op::DevList => Ok(Attrs::new().with_str(AttrType::GenMsg, self.registry.list())),
            _ => {
                let device = self.registry.get(attrs.require_u32(AttrType::DevIdx)?)?;
                dispatch_device(op, &device, attrs)
            }
        }
    }
}

fn dispatch_device(op: Op, device: &Device, attrs: &Attrs) -> Result<Attrs> {
    match op {
        Op::DevList => Err(Error::NotSupported),
        Op::DevInfo => Ok(device_info(device)),
        Op::RegDump => Ok(Attrs::new().with_str(AttrType::GenMsg, device.register_dump()?)),
        Op::RegRead => {
            let (bar, addr) = reg_target(device, attrs)?;
            let val = device.register_read(bar, addr)?;
            Ok(reg_reply(bar, addr, val))
        }
        Op::RegWrite => {
            let (bar, addr) = reg_target(device, attrs)?;
            device.register_write(bar, addr, attrs.require_u32(AttrType::RegVal)?)?;
            let val = device.register_read(bar, addr)?;
            Ok(reg_reply(bar, addr, val))
        }
        Op::QList => Ok(Attrs::new().with_str(AttrType::GenMsg, device.list_queues())),
        Op::QAdd => {
            let conf = queue_config(attrs)?;
            let slot = device.add(&conf)?;
            let text = format!(
                "{} added{}.\n",
                conf.name(device.name()),
                slot.node
                    .map(|n| format!(", cdev {}", n))
                    .unwrap_or_default()
            );
            Ok(Attrs::new().with_str(AttrType::GenMsg, text))
        }
        Op::QStart | Op::QStop | Op::QDel => {
            let (qidx, dir) = queue_target(attrs)?;
            let verb = match op {
                Op::QStart => {
                    device.start(qidx, dir)?;
                    "started"
                }
                Op::QStop => {
                    device.stop(qidx, dir)?;
                    "stopped"
                }
                _ => {
                    device.remove(qidx, dir)?;
                    "deleted"
                }
            };
            let text = format!("{} QID {} {} {}.\n", device.name(), qidx, dir, verb);
            Ok(Attrs::new().with_str(AttrType::GenMsg, text))
        }
        Op::QDump => {
            let (qidx, dir) = queue_target(attrs)?;
            Ok(Attrs::new().with_str(AttrType::GenMsg, device.dump(qidx, dir)?))
        }
        Op::QDesc | Op::QWrb => {
            let (qidx, dir) = queue_target(attrs)?;
            let start = attrs.require_u32(AttrType::RangeStart)?;
            let end = attrs.require_u32(AttrType::RangeEnd)?;
            let text = if op == Op::QDesc {
                device.dump_desc(qidx, dir, start, end)?
            } else {
                device.dump_wrb(qidx, dir, start, end)?
            };
            Ok(Attrs::new().with_str(AttrType::GenMsg, text))
        }
    }
}

fn truncate(text: &mut String, max: usize) {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
}

fn device_info(device: &Device) -> Attrs {
    let conf = device.config();
    Attrs::new()
        .with_u32(AttrType::PciBus, conf.pci_bus.into())
        .with_u32(AttrType::PciDev, conf.pci_dev.into())
        .with_u32(AttrType::PciFunc, conf.pci_func.into())
        .with_u32(AttrType::DevCfgBar, conf.config_bar.into())
        .with_u32(AttrType::DevUsrBar, conf.user_bar.into())
        .with_u32(AttrType::DevQsetMax, device.qmax())
}

fn reg_target(device: &Device, attrs: &Attrs) -> Result<(u8, u32)> {
    let bar = match attrs.u32(AttrType::RegBarNum) {
        Some(bar) => u8::try_from(bar).map_err(|_| Error::invalid(format!("bar {}", bar)))?,
        None => device.config().config_bar,
    };
    Ok((bar, attrs.require_u32(AttrType::RegAddr)?))
}

fn reg_reply(bar: u8, addr: u32, val: u32) -> Attrs {
    Attrs::new()
        .with_u32(AttrType::RegBarNum, bar.into())
        .with_u32(AttrType::RegAddr, addr)
        .with_u32(AttrType::RegVal, val)
}

fn queue_flags(attrs: &Attrs) -> Result<QueueFlags> {
    let bits = attrs.require_u32(AttrType::QFlag)?;
    QueueFlags::from_bits(bits).ok_or_else(|| Error::invalid(format!("qflag {:#x}", bits)))
}

fn queue_target(attrs: &Attrs) -> Result<(u32, Direction)> {
    let qidx = attrs.require_u32(AttrType::QIdx)?;
    let conf = QueueConfig::from_flags(qidx, queue_flags(attrs)?)?;
    Ok((qidx, conf.dir))
}

fn queue_config(attrs: &Attrs) -> Result<QueueConfig> {
    let qidx = attrs.require_u32(AttrType::QIdx)?;
    let mut conf = QueueConfig::from_flags(qidx, queue_flags(attrs)?)?;
    if let Some(ring_size) = attrs.u32(AttrType::QRngSz) {
        conf.ring_size = ring_size;
    }
    if let Some(buf_size) = attrs.u32(AttrType::QBufSz) {
        conf.buf_size = buf_size;
    }
    if let Some(sz) = attrs.u32(AttrType::WrbDescSize) {
        conf.wrb_desc_size = Some(
            WrbDescSize::from_u32(sz).ok_or_else(|| Error::invalid(format!("wrbsz {}", sz)))?,
        );
    }
    Ok(conf)
}
