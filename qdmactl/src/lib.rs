//! QDMA administration
//!
//! ```text
//!  argv ─► cmd::parse ─► Command ─► Session::execute
//!                                      │
//!                   ┌──────────────────┴──────────────────┐
//!                   ▼                                     ▼
//!          client::Client (queues, info)         bar::BarMap (registers)
//!                   │                                     │
//!            qdmad control socket              sysfs resource<N> files
//! ```

pub mod bar;
pub mod client;
pub mod cmd;

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Context};
use log::{debug, warn};
use qdma_core::regs::{self, CONFIG_REGS, USER_REGS};
use qdma_nl::{AttrType, Attrs, Op};

use bar::{BarMap, PciAddr};
use client::{Channel, Client};
use cmd::{Command, RegCmd, Target};

/// Device parameters from a `DEV_INFO` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevInfo {
    pub pci: PciAddr,
    pub config_bar: u8,
    pub user_bar: u8,
    pub qsets_max: u32,
}

impl DevInfo {
    pub fn from_attrs(attrs: &Attrs) -> anyhow::Result<Self> {
        let byte = |ty: AttrType| -> anyhow::Result<u8> {
            let v = attrs
                .u32(ty)
                .with_context(|| format!("DEV_INFO reply lacks {}", ty.name()))?;
            u8::try_from(v).with_context(|| format!("{} {} out of range", ty.name(), v))
        };
        Ok(DevInfo {
            pci: PciAddr {
                bus: byte(AttrType::PciBus)?,
                dev: byte(AttrType::PciDev)?,
                func: byte(AttrType::PciFunc)?,
            },
            config_bar: byte(AttrType::DevCfgBar)?,
            user_bar: byte(AttrType::DevUsrBar)?,
            qsets_max: attrs.u32(AttrType::DevQsetMax).unwrap_or(0),
        })
    }

    fn bdf(&self) -> String {
        format!(
            "{:02x}:{:02x}.{:02x}",
            self.pci.bus, self.pci.dev, self.pci.func
        )
    }
}

/// Opens a channel to the PF (`false`) or VF (`true`) driver.
pub type Connector<'a> = dyn FnMut(bool) -> io::Result<Box<dyn Channel>> + 'a;

/// Executes parsed commands.
pub struct Session<'a> {
    connect: Box<Connector<'a>>,
    sysfs_root: PathBuf,
}

impl<'a> Session<'a> {
    pub fn new(
        connect: impl FnMut(bool) -> io::Result<Box<dyn Channel>> + 'a,
        sysfs_root: PathBuf,
    ) -> Self {
        Session {
            connect: Box::new(connect),
            sysfs_root,
        }
    }

    fn client(&mut self, vf: bool) -> anyhow::Result<Client<Box<dyn Channel>>> {
        let name = qdma_nl::family_name(vf);
        let chan = (self.connect)(vf).with_context(|| format!("{}: driver not reachable", name))?;
        Client::connect(chan, vf).with_context(|| format!("{}: family lookup failed", name))
    }

    pub fn execute(&mut self, cmd: &Command, out: &mut dyn Write) -> anyhow::Result<()> {
        match cmd {
            Command::Help => out.write_all(cmd::USAGE.as_bytes())?,
            Command::Version => writeln!(out, "qdmactl {}", env!("CARGO_PKG_VERSION"))?,
            Command::DevList => self.dev_list(out)?,
            Command::DevInfo(target) => {
                let mut client = self.client(target.vf)?;
                dev_info(&mut client, *target, out)?;
            }
            Command::Reg(target, reg) => {
                let mut client = self.client(target.vf)?;
                let info = dev_info(&mut client, *target, out)?;
                self.reg(*target, &info, *reg, out)?;
            }
            Command::Queue { target, op, params } => {
                let mut client = self.client(target.vf)?;
                dev_info(&mut client, *target, out)?;
                let reply = client
                    .call(*op, params.attrs(*op, target.idx))
                    .with_context(|| format!("{} {}", target, op.name()))?;
                print_genmsg(&reply, out)?;
            }
        }
        Ok(())
    }

    /// Listing from the PF driver, then the VF driver. Either may be absent.
    fn dev_list(&mut self, out: &mut dyn Write) -> anyhow::Result<()> {
        let mut reached = 0;
        for vf in [false, true] {
            let mut client = match self.client(vf) {
                Ok(client) => client,
                Err(e) => {
                    debug!("{:#}", e);
                    continue;
                }
            };
            reached += 1;
            match client.call(Op::DevList, Attrs::new()) {
                Ok(reply) => print_genmsg(&reply, out)?,
                Err(e) => warn!("{}: {}", qdma_nl::family_name(vf), e),
            }
        }
        if reached == 0 {
            bail!("no qdma driver reachable");
        }
        Ok(())
    }

    fn reg(
        &self,
        target: Target,
        info: &DevInfo,
        reg: RegCmd,
        out: &mut dyn Write,
    ) -> anyhow::Result<()> {
        match reg {
            RegCmd::Dump => {
                let user = self.map(info, info.user_bar, regs::span(USER_REGS))?;
                let config = self.map(info, info.config_bar, regs::span(CONFIG_REGS))?;
                let title = format!("{}, pci {}", target, info.bdf());
                let text =
                    regs::dump_device(&title, info.user_bar, &user, info.config_bar, &config)?;
                out.write_all(text.as_bytes())?;
            }
            RegCmd::Read { bar, addr } => {
                let bar = bar.unwrap_or(info.config_bar);
                let val = self.map(info, bar, map_len(addr)?)?.read(addr)?;
                writeln!(
                    out,
                    "{}, {}, bar#{}, {:#x} = {:#x}.",
                    target,
                    info.bdf(),
                    bar,
                    addr,
                    val
                )?;
            }
            RegCmd::Write { bar, addr, val } => {
                let bar = bar.unwrap_or(info.config_bar);
                let map = self.map(info, bar, map_len(addr)?)?;
                map.write(addr, val)?;
                let back = map.read(addr)?;
                writeln!(
                    out,
                    "{}, {}, bar#{}, reg {:#x} -> {:#x}, read back {:#x}.",
                    target,
                    info.bdf(),
                    bar,
                    addr,
                    val,
                    back
                )?;
            }
        }
        Ok(())
    }

    fn map(&self, info: &DevInfo, bar: u8, len: u32) -> anyhow::Result<BarMap> {
        let path = info.pci.resource_path(&self.sysfs_root, bar);
        BarMap::open(&path, len as usize).with_context(|| format!("bar {} not accessible", bar))
    }
}

fn map_len(addr: u32) -> anyhow::Result<u32> {
    addr.checked_add(4)
        .with_context(|| format!("register {:#x} out of range", addr))
}

fn dev_info(
    client: &mut Client<Box<dyn Channel>>,
    target: Target,
    out: &mut dyn Write,
) -> anyhow::Result<DevInfo> {
    let reply = client
        .call(
            Op::DevInfo,
            Attrs::new().with_u32(AttrType::DevIdx, target.idx),
        )
        .with_context(|| target.to_string())?;
    let info = DevInfo::from_attrs(&reply)?;
    writeln!(
        out,
        "{}:\t{}\tconfig bar: {}, user bar: {}, max #. QP: {}",
        target,
        info.bdf(),
        info.config_bar,
        info.user_bar,
        info.qsets_max
    )?;
    Ok(info)
}

fn print_genmsg(reply: &Attrs, out: &mut dyn Write) -> io::Result<()> {
    match reply.str(AttrType::GenMsg) {
        Some(text) => writeln!(out, "\n{}", text),
        None => Ok(()),
    }
}
