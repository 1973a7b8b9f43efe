//! Register map and dump
//!
//! Static description of the registers worth showing in a dump, for the
//! config BAR and the user BAR. An entry with `repeat` expands to that many
//! registers `step` bytes apart; an entry with `len` is a bit field of the
//! register at `addr` and prints indented under it.

use std::fmt::Write;

use crate::error::Result;

/// One register, register array, or bit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegInfo {
    pub name: &'static str,
    pub addr: u32,
    pub repeat: u32,
    /// Stride of a repeated register; 0 means 4
    pub step: u32,
    pub shift: u8,
    /// Bit-field width; 0 for a whole register
    pub len: u8,
}

const fn reg(name: &'static str, addr: u32) -> RegInfo {
    RegInfo {
        name,
        addr,
        repeat: 0,
        step: 0,
        shift: 0,
        len: 0,
    }
}

const fn array(name: &'static str, addr: u32, repeat: u32, step: u32) -> RegInfo {
    RegInfo {
        name,
        addr,
        repeat,
        step,
        shift: 0,
        len: 0,
    }
}

/// Extent of the config BAR covered by [`CONFIG_REGS`].
pub const CONFIG_BAR_MAX_ADDR: u32 = 0xB400;

pub static CONFIG_REGS: &[RegInfo] = &[
    reg("CFG_BLK_IDENTIFIER", 0x0),
    array("GLBL_RNGSZ", 0x204, 16, 0),
    reg("GLBL_SCRATCH", 0x244),
    reg("GLBL_ERR_STAT", 0x248),
    reg("GLBL_ERR_MASK", 0x24C),
    reg("GLBL_WB_ACC", 0x250),
    reg("GLBL_DSC_ERR_STS", 0x254),
    reg("GLBL_DSC_ERR_MSK", 0x258),
    reg("GLBL_DSC_ERR_LOG", 0x25C),
    reg("GLBL_TRQ_ERR_STS", 0x260),
    reg("GLBL_TRQ_ERR_MSK", 0x264),
    reg("GLBL_TRQ_ERR_LOG", 0x268),
    // 256 on hardware; the first two are enough for a dump
    array("TRQ_SEL_FMAP", 0x400, 2, 0),
    array("IND_CTXT_DATA", 0x804, 4, 0),
    array("IND_CTXT_MASK", 0x814, 4, 0),
    reg("IND_CTXT_CMD", 0x824),
    reg("IND_CAUSE", 0x828),
    reg("IND_ENABLE", 0x82C),
    array("C2H_TIMER_CNT", 0xA00, 16, 0),
    array("C2H_CNT_THRESH", 0xA40, 16, 0),
    reg("C2H_QID2VEC_MAP_QID", 0xA80),
    reg("C2H_QID2VEC_MAP", 0xA84),
    reg("C2H_STAT_S_AXIS_C2H_ACCEPTED", 0xA88),
    reg("C2H_STAT_S_AXIS_WRB_ACCEPTED", 0xA8C),
    reg("C2H_STAT_DESC_RSP_PKT_ACCEPTED", 0xA90),
    reg("C2H_STAT_AXIS_PKG_CMP", 0xA94),
    reg("C2H_STAT_DESC_RSP_ACCEPTED", 0xA98),
    reg("C2H_STAT_DESC_RSP_CMP", 0xA9C),
    reg("C2H_STAT_WRQ_OUT", 0xAA0),
    reg("C2H_STAT_WPL_REN_ACCEPTED", 0xAA4),
    reg("C2H_STAT_TOTAL_WRQ_LEN", 0xAA8),
    reg("C2H_STAT_TOTAL_WPL_LEN", 0xAAC),
    array("C2H_BUF_SZ", 0xAB0, 16, 0),
    reg("C2H_ERR_STAT", 0xAF0),
    reg("C2H_ERR_MASK", 0xAF4),
    reg("C2H_FATAL_ERR_STAT", 0xAF8),
    reg("C2H_FATAL_ERR_MASK", 0xAFC),
    reg("C2H_FATAL_ERR_ENABLE", 0xB00),
    reg("C2H_ERR_INT", 0xB04),
    reg("C2H_PFCH_CFG", 0xB08),
    reg("C2H_INT_TIMER_TICK", 0xB0C),
    reg("C2H_STAT_DESC_RSP_DROP_ACCEPTED", 0xB10),
    reg("C2H_STAT_DESC_RSP_ERR_ACCEPTED", 0xB14),
    reg("C2H_STAT_DESC_REQ", 0xB18),
    reg("C2H_STAT_DEBUG_DMA_ENG_0", 0xB1C),
    reg("C2H_STAT_DEBUG_DMA_ENG_1", 0xB20),
    reg("C2H_STAT_DEBUG_DMA_ENG_2", 0xB24),
    reg("C2H_STAT_DEBUG_DMA_ENG_3", 0xB28),
    reg("C2H_DBG_PFCH_ERR_CTXT", 0xB2C),
    reg("C2H_FIRST_ERR_QID", 0xB30),
    reg("C2H_MM0_CONTROL", 0x1004),
    reg("C2H_MM1_CONTROL", 0x1104),
    reg("H2C_MM0_CONTROL", 0x1204),
    reg("H2C_MM1_CONTROL", 0x1304),
    // 2K on hardware
    array("DMAP_SEL_INT_CIDX", 0x6400, 64, 0x10),
    array("DMAP_SEL_H2C_DSC_PIDX", 0x6404, 64, 0x10),
    array("DMAP_SEL_C2H_DSC_PIDX", 0x6408, 64, 0x10),
    array("DMAP_SEL_WRB_CIDX", 0x640C, 64, 0x10),
];

pub static USER_REGS: &[RegInfo] = &[
    reg("ST_C2H_QID", 0x0),
    reg("ST_C2H_PKTLEN", 0x4),
    // [1] start C2H, [2] immediate data, [3] restart data per packet,
    // [31] user reset
    reg("ST_C2H_CONTROL", 0x8),
    // [0] clear match
    reg("ST_H2C_CONTROL", 0xC),
    reg("ST_H2C_QID_MATCH", 0x10),
    reg("ST_H2C_XFER_CNT", 0x14),
    reg("ST_C2H_PKT_CNT", 0x20),
    array("ST_C2H_WRB_DATA", 0x30, 8, 0),
    reg("ST_C2H_WRB_TYPE", 0x50),
    array("ST_SCRATCH_PAD", 0x60, 2, 0),
];

/// Bytes of BAR a dump of `regs` touches.
pub fn span(regs: &[RegInfo]) -> u32 {
    regs.iter()
        .map(|r| {
            let step = if r.step == 0 { 4 } else { r.step };
            r.addr + r.repeat.saturating_sub(1) * step + 4
        })
        .max()
        .unwrap_or(0)
}

/// Anything 32-bit registers can be read from.
pub trait RegisterSpace {
    fn read32(&self, addr: u32) -> Result<u32>;
}

fn line(out: &mut String, addr: u32, name: &str, val: u32) {
    let _ = writeln!(out, "[{:#7x}] {:<47} {:<#10x} {}", addr, name, val, val);
}

/// Append a dump of `regs` read from `space` to `out`.
pub fn dump(space: &dyn RegisterSpace, regs: &[RegInfo], out: &mut String) -> Result<()> {
    for r in regs {
        if r.len > 0 {
            let val = space.read32(r.addr)?;
            let mask = if r.len >= 32 {
                u32::MAX
            } else {
                (1u32 << r.len) - 1
            };
            let v = (val >> r.shift) & mask;
            let hi = u32::from(r.shift) + u32::from(r.len) - 1;
            let width = if r.shift < 10 { 3 } else { 2 };
            let _ = writeln!(
                out,
                "    {:>width$}:{} {:<47} {:<#10x} {}",
                hi,
                r.shift,
                r.name,
                v,
                v,
                width = width
            );
        } else if r.repeat > 0 {
            let step = if r.step == 0 { 4 } else { r.step };
            for i in 0..r.repeat {
                let addr = r.addr + i * step;
                line(out, addr, &format!("{}_{}", r.name, i), space.read32(addr)?);
            }
        } else {
            line(out, r.addr, r.name, space.read32(r.addr)?);
        }
    }
    Ok(())
}

/// Full two-BAR dump with its banner.
pub fn dump_device(
    title: &str,
    user_bar: u8,
    user: &dyn RegisterSpace,
    config_bar: u8,
    config: &dyn RegisterSpace,
) -> Result<String> {
    let sep = "#".repeat(80);
    let mut out = String::new();
    let _ = writeln!(out, "{}\n###\t\t{}, reg dump\n{}", sep, title, sep);
    let _ = writeln!(out, "\nUSER BAR #{}", user_bar);
    dump(user, USER_REGS, &mut out)?;
    let _ = writeln!(out, "\nCONFIG BAR #{}", config_bar);
    dump(config, CONFIG_REGS, &mut out)?;
    Ok(out)
}
