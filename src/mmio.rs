//! Central dispatcher for the 0x04000000–0x040003FF I/O window.
//!
//! `Bus` (§4.3) only decodes the fixed memory regions; per the "Cyclic
//! ownership" design note, no subsystem holds a reference to another, so the
//! register window — which must reach `IoRegs`, `DmaController`, `Timers`
//! and `Apu` depending on the offset — is dispatched here instead, called by
//! the CPU core for every load/store and by `Engine` for anything issued
//! outside instruction execution (the KEY message handler, resets).

use crate::apu::Apu;
use crate::bus::Bus;
use crate::dma::DmaController;
use crate::io_regs::{offset, IoRegs};
use crate::timer::Timers;
use crate::scheduler::Scheduler;

pub const IO_BASE: u32 = 0x0400_0000;
pub const IO_END: u32 = 0x0400_0400;

pub fn in_window(addr: u32) -> bool {
    (IO_BASE..IO_END).contains(&addr)
}

fn is_dma_reg(off: usize) -> bool {
    (0x0B0..0x0E0).contains(&off)
}

fn is_timer_reg(off: usize) -> bool {
    (0x100..0x110).contains(&off)
}

fn is_fifo_reg(off: usize) -> bool {
    (0x0A0..0x0A8).contains(&off)
}

fn is_wave_ram(off: usize) -> bool {
    (offset::WAVE_RAM0..offset::WAVE_RAM0 + 0x10).contains(&off)
}

pub struct MmioRefs<'a> {
    pub io: &'a mut IoRegs,
    pub dma: &'a mut DmaController,
    pub timers: &'a mut Timers,
    pub apu: &'a mut Apu,
    pub sched: &'a mut Scheduler,
}

pub fn read8(bus: &mut Bus, r: &mut MmioRefs, addr: u32) -> u8 {
    let off = (addr & 0x3FF) as usize;
    if is_dma_reg(off) {
        (r.dma.read_reg(off, 1) & 0xFF) as u8
    } else if is_timer_reg(off) {
        timer_read16(r, off) as u8
    } else if is_fifo_reg(off) {
        0
    } else if is_wave_ram(off) {
        r.apu.read_wave_ram(off - offset::WAVE_RAM0)
    } else {
        let _ = bus;
        r.io.read8_raw(off)
    }
}

pub fn write8(bus: &mut Bus, r: &mut MmioRefs, addr: u32, val: u8) {
    let off = (addr & 0x3FF) as usize;
    if is_dma_reg(off) {
        r.dma.write_reg(off, 1, val as u32, r.sched);
    } else if is_timer_reg(off) {
        timer_write8(r, off, val);
    } else if is_fifo_reg(off) {
        push_fifo_byte(r, off, val as i8);
    } else if is_wave_ram(off) {
        r.apu.write_wave_ram(off - offset::WAVE_RAM0, val);
    } else {
        write_named8(bus, r, off, val);
    }
}

pub fn read16(bus: &mut Bus, r: &mut MmioRefs, addr: u32) -> u16 {
    let off = (addr & 0x3FF) as usize & !1;
    if is_dma_reg(off) {
        (r.dma.read_reg(off, 2) & 0xFFFF) as u16
    } else if is_timer_reg(off) {
        timer_read16(r, off)
    } else if is_fifo_reg(off) {
        0
    } else if is_wave_ram(off) {
        let lo = r.apu.read_wave_ram(off - offset::WAVE_RAM0);
        let hi = r.apu.read_wave_ram(off - offset::WAVE_RAM0 + 1);
        u16::from_le_bytes([lo, hi])
    } else {
        let _ = bus;
        r.io.read16_raw(off)
    }
}

pub fn write16(bus: &mut Bus, r: &mut MmioRefs, addr: u32, val: u16) {
    let off = (addr & 0x3FF) as usize & !1;
    if is_dma_reg(off) {
        r.dma.write_reg(off, 2, val as u32, r.sched);
    } else if is_timer_reg(off) {
        timer_write16(r, off, val);
    } else if is_fifo_reg(off) {
        let b = val.to_le_bytes();
        push_fifo_byte(r, off, b[0] as i8);
        push_fifo_byte(r, off + 1, b[1] as i8);
    } else if is_wave_ram(off) {
        let b = val.to_le_bytes();
        r.apu.write_wave_ram(off - offset::WAVE_RAM0, b[0]);
        r.apu.write_wave_ram(off - offset::WAVE_RAM0 + 1, b[1]);
    } else {
        write_named16(bus, r, off, val);
    }
}

pub fn read32(bus: &mut Bus, r: &mut MmioRefs, addr: u32) -> u32 {
    let off = (addr & 0x3FF) as usize & !3;
    if is_dma_reg(off) {
        r.dma.read_reg(off, 4)
    } else if is_timer_reg(off) {
        let lo = timer_read16(r, off) as u32;
        let hi = timer_read16(r, off + 2) as u32;
        lo | (hi << 16)
    } else if is_fifo_reg(off) {
        0
    } else {
        let lo = read16(bus, r, off as u32) as u32;
        let hi = read16(bus, r, (off + 2) as u32) as u32;
        lo | (hi << 16)
    }
}

pub fn write32(bus: &mut Bus, r: &mut MmioRefs, addr: u32, val: u32) {
    let off = (addr & 0x3FF) as usize & !3;
    if is_dma_reg(off) {
        r.dma.write_reg(off, 4, val, r.sched);
    } else if is_fifo_reg(off) {
        for (i, b) in val.to_le_bytes().iter().enumerate() {
            push_fifo_byte(r, off + i, *b as i8);
        }
    } else {
        let b = val.to_le_bytes();
        write16(bus, r, off as u32, u16::from_le_bytes([b[0], b[1]]));
        write16(bus, r, (off + 2) as u32, u16::from_le_bytes([b[2], b[3]]));
    }
}

fn push_fifo_byte(r: &mut MmioRefs, off: usize, byte: i8) {
    if off < offset::FIFO_B_L {
        r.apu.push_fifo_a(byte);
    } else {
        r.apu.push_fifo_b(byte);
    }
}

fn timer_read16(r: &MmioRefs, off: usize) -> u16 {
    let idx = (off - 0x100) / 4;
    let reg = (off - 0x100) % 4;
    if reg < 2 {
        r.timers.read_counter(idx, r.sched)
    } else {
        r.timers.control(idx)
    }
}

fn timer_write8(r: &mut MmioRefs, off: usize, val: u8) {
    let idx = (off - 0x100) / 4;
    let reg = (off - 0x100) % 4;
    match reg {
        0 => {
            let hi = r.timers.reload(idx) & 0xFF00;
            r.timers.write_reload(idx, hi | val as u16);
        }
        1 => {
            let lo = r.timers.reload(idx) & 0x00FF;
            r.timers.write_reload(idx, lo | ((val as u16) << 8));
        }
        2 => {
            let hi = r.timers.control(idx) & 0xFF00;
            r.timers.write_control(idx, hi | val as u16, r.sched);
        }
        _ => {}
    }
}

fn timer_write16(r: &mut MmioRefs, off: usize, val: u16) {
    let idx = (off - 0x100) / 4;
    let reg = (off - 0x100) % 4;
    match reg {
        0 => r.timers.write_reload(idx, val),
        2 => r.timers.write_control(idx, val, r.sched),
        _ => {}
    }
}

fn write_named8(bus: &mut Bus, r: &mut MmioRefs, off: usize, val: u8) {
    // Byte writes to 16-bit registers read-modify-write the containing
    // half-word so the named setters (which mask/validate at 16-bit
    // granularity) stay the single source of truth.
    let aligned = off & !1;
    let cur = r.io.read16_raw(aligned);
    let merged = if off & 1 == 0 { (cur & 0xFF00) | val as u16 } else { (cur & 0x00FF) | ((val as u16) << 8) };
    write_named16(bus, r, aligned, merged);
}

fn write_named16(bus: &mut Bus, r: &mut MmioRefs, off: usize, val: u16) {
    match off {
        offset::DISPSTAT => r.io.write_dispstat(val),
        offset::VCOUNT => {} // read-only
        offset::KEYINPUT => {} // read-only, set only by the engine's KEY handler
        offset::IE => r.io.write_ie(val),
        offset::IF => r.io.write_iflag_clear(val),
        offset::IME => r.io.write_ime(val),
        offset::WAITCNT => {
            r.io.write_waitcnt(val);
            bus.set_prefetch_enabled(r.io.waitcnt().prefetch_enabled());
            bus.invalidate_prefetch();
        }
        offset::BG0CNT => r.io.write_bgcnt(0, val),
        offset::BG1CNT => r.io.write_bgcnt(1, val),
        offset::BG2CNT => r.io.write_bgcnt(2, val),
        offset::BG3CNT => r.io.write_bgcnt(3, val),
        offset::BG0HOFS => r.io.write_bg_hofs(0, val),
        offset::BG0VOFS => r.io.write_bg_vofs(0, val),
        offset::BG1HOFS => r.io.write_bg_hofs(1, val),
        offset::BG1VOFS => r.io.write_bg_vofs(1, val),
        offset::BG2HOFS => r.io.write_bg_hofs(2, val),
        offset::BG2VOFS => r.io.write_bg_vofs(2, val),
        offset::BG3HOFS => r.io.write_bg_hofs(3, val),
        offset::BG3VOFS => r.io.write_bg_vofs(3, val),
        offset::KEYCNT => r.io.write_keycnt(val),
        0x300 => {
            // POSTFLG (low byte) + HALTCNT (high byte) share a 16-bit slot.
            r.io.write_postflg(val as u8);
            r.io.request_halt((val >> 8) as u8);
        }
        _ => r.io.write16_raw(off, val),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::backup::BackupKind;

    fn refs<'a>(io: &'a mut IoRegs, dma: &'a mut DmaController, timers: &'a mut Timers, apu: &'a mut Apu, sched: &'a mut Scheduler) -> MmioRefs<'a> {
        MmioRefs { io, dma, timers, apu, sched }
    }

    #[test]
    fn fifo_write32_pushes_four_bytes() {
        let mut bus = Bus::new(BackupKind::None, false);
        let mut io = IoRegs::new();
        let mut dma = DmaController::new();
        let mut timers = Timers::new();
        let mut apu = Apu::new();
        let mut sched = Scheduler::new();
        let mut r = refs(&mut io, &mut dma, &mut timers, &mut apu, &mut sched);
        write32(&mut bus, &mut r, IO_BASE + offset::FIFO_A_L as u32, 0x04030201);
        // Just verifying it doesn't panic and routes through the FIFO path,
        // not the generic IoRegs window (observed indirectly elsewhere).
    }

    #[test]
    fn dma_register_write_reaches_dma_controller() {
        let mut bus = Bus::new(BackupKind::None, false);
        let mut io = IoRegs::new();
        let mut dma = DmaController::new();
        let mut timers = Timers::new();
        let mut apu = Apu::new();
        let mut sched = Scheduler::new();
        let mut r = refs(&mut io, &mut dma, &mut timers, &mut apu, &mut sched);
        write32(&mut bus, &mut r, IO_BASE + 0xB0, 0x0200_0000);
        assert_eq!(dma.channel(0).src(), 0x0200_0000);
    }

    #[test]
    fn waitcnt_write_toggles_prefetch_and_flushes() {
        let mut bus = Bus::new(BackupKind::None, false);
        let mut io = IoRegs::new();
        let mut dma = DmaController::new();
        let mut timers = Timers::new();
        let mut apu = Apu::new();
        let mut sched = Scheduler::new();
        let mut r = refs(&mut io, &mut dma, &mut timers, &mut apu, &mut sched);
        write16(&mut bus, &mut r, IO_BASE + offset::WAITCNT as u32, 0x4000);
        assert!(io.waitcnt().prefetch_enabled());
    }

    #[test]
    fn haltcnt_write_is_recorded_for_cpu_to_consume() {
        let mut bus = Bus::new(BackupKind::None, false);
        let mut io = IoRegs::new();
        let mut dma = DmaController::new();
        let mut timers = Timers::new();
        let mut apu = Apu::new();
        let mut sched = Scheduler::new();
        let mut r = refs(&mut io, &mut dma, &mut timers, &mut apu, &mut sched);
        write8(&mut bus, &mut r, IO_BASE + offset::HALTCNT as u32, 0x00);
        assert_eq!(io.take_halt_request(), Some(0x00));
    }
}
