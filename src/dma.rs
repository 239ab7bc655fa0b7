//! Four-channel DMA engine, armed via I/O writes and executed against the
//! bus inside the CPU's idle loop. Grounded directly on the reference
//! `dma.c`: the `0->1`/`1->0` enable-transition bookkeeping in
//! `mem_io_dma_ctl_write8`, the channel-scan-and-break loop in
//! `mem_dma_do_all_pending_transfers`, and the `src_mask`/`dst_mask`/
//! `count_mask` tables, carried over verbatim since they are architectural
//! constants rather than an implementation choice.

use crate::apu::Apu;
use crate::bus::{AccessType, Bus, EWRAM_START};
use crate::interrupt::Irq;
use crate::io_regs::{IoRegs, WaitCnt};
use crate::scheduler::{EventArgs, EventHandle, EventKind, Scheduler};

const SRC_MASK: [u32; 4] = [0x07FF_FFFF, 0x0FFF_FFFF, 0x0FFF_FFFF, 0x0FFF_FFFF];
const DST_MASK: [u32; 4] = [0x07FF_FFFF, 0x07FF_FFFF, 0x07FF_FFFF, 0x0FFF_FFFF];
const COUNT_MASK: [u32; 4] = [0x3FFF, 0x3FFF, 0x3FFF, 0xFFFF];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaTiming {
    Immediate,
    VBlank,
    HBlank,
    Special,
}

fn decode_timing(bits: u16) -> DmaTiming {
    match bits & 0x3 {
        0 => DmaTiming::Immediate,
        1 => DmaTiming::VBlank,
        2 => DmaTiming::HBlank,
        _ => DmaTiming::Special,
    }
}

pub struct DmaChannel {
    index: usize,
    raw: [u8; 12],
    internal_src: u32,
    internal_dst: u32,
    internal_count: u32,
    bus_latch: u32,
    is_fifo: bool,
    is_video: bool,
    enable_event_handle: EventHandle,
}

impl DmaChannel {
    fn new(index: usize) -> Self {
        DmaChannel {
            index,
            raw: [0; 12],
            internal_src: 0,
            internal_dst: 0,
            internal_count: 0,
            bus_latch: 0,
            is_fifo: false,
            is_video: false,
            enable_event_handle: EventHandle::INVALID,
        }
    }

    pub fn src(&self) -> u32 {
        u32::from_le_bytes(self.raw[0..4].try_into().unwrap())
    }
    pub fn dst(&self) -> u32 {
        u32::from_le_bytes(self.raw[4..8].try_into().unwrap())
    }
    pub fn count_reg(&self) -> u16 {
        u16::from_le_bytes(self.raw[8..10].try_into().unwrap())
    }
    pub fn control(&self) -> u16 {
        u16::from_le_bytes(self.raw[10..12].try_into().unwrap())
    }
    fn set_control(&mut self, v: u16) {
        self.raw[10..12].copy_from_slice(&v.to_le_bytes());
    }

    pub fn enabled(&self) -> bool {
        (self.control() >> 15) & 1 != 0
    }
    pub fn repeat(&self) -> bool {
        (self.control() >> 9) & 1 != 0
    }
    pub fn unit_size_32(&self) -> bool {
        (self.control() >> 10) & 1 != 0
    }
    pub fn src_ctl(&self) -> u8 {
        ((self.control() >> 7) & 0x3) as u8
    }
    pub fn dst_ctl(&self) -> u8 {
        ((self.control() >> 5) & 0x3) as u8
    }
    pub fn timing(&self) -> DmaTiming {
        decode_timing(self.control() >> 12)
    }
    pub fn irq_end(&self) -> bool {
        (self.control() >> 14) & 1 != 0
    }

    fn unit_mask(&self) -> u32 {
        if self.unit_size_32() {
            !3
        } else {
            !1
        }
    }

    fn reg_write(&mut self, offset: usize, width: u32, val: u32) {
        match width {
            1 => self.raw[offset] = val as u8,
            2 => self.raw[offset..offset + 2].copy_from_slice(&(val as u16).to_le_bytes()),
            4 => self.raw[offset..offset + 4].copy_from_slice(&val.to_le_bytes()),
            _ => unreachable!(),
        }
    }
}

pub struct DmaController {
    channels: [DmaChannel; 4],
    pending: u8,
    is_running: bool,
    reenter: bool,
}

impl DmaController {
    pub fn new() -> Self {
        DmaController {
            channels: [DmaChannel::new(0), DmaChannel::new(1), DmaChannel::new(2), DmaChannel::new(3)],
            pending: 0,
            is_running: false,
            reenter: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn pending_any(&self) -> bool {
        self.pending != 0
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    pub fn channel(&self, idx: usize) -> &DmaChannel {
        &self.channels[idx]
    }

    /// Handles an MMIO write into one of the 4 * 12-byte channel register
    /// blocks starting at offset 0xB0. `width` is 1/2/4 bytes.
    pub fn write_reg(&mut self, offset: usize, width: u32, val: u32, sched: &mut Scheduler) {
        debug_assert!(offset >= 0xB0);
        let rel = offset - 0xB0;
        let ch = rel / 12;
        if ch >= 4 {
            return;
        }
        let local = rel % 12;
        let touches_control = local + width as usize > 10;
        let old_control = self.channels[ch].control();
        self.channels[ch].reg_write(local, width, val);
        if touches_control {
            self.handle_control_write(ch, old_control, sched);
        }
    }

    pub fn read_reg(&self, offset: usize, width: u32) -> u32 {
        let rel = offset.wrapping_sub(0xB0);
        let ch = rel / 12;
        if ch >= 4 {
            return 0;
        }
        let local = rel % 12;
        // SAD/DAD/CNT_L are write-only on real hardware; only CNT_H is readable.
        if local < 10 {
            return 0;
        }
        let ctl = self.channels[ch].control() as u32;
        match width {
            1 => {
                if local == 10 {
                    ctl & 0xFF
                } else {
                    (ctl >> 8) & 0xFF
                }
            }
            2 => ctl,
            _ => ctl,
        }
    }

    fn handle_control_write(&mut self, ch: usize, old_control: u16, sched: &mut Scheduler) {
        let old_enable = (old_control >> 15) & 1 != 0;
        let new_enable = self.channels[ch].enabled();

        if !old_enable && new_enable {
            let channel = &mut self.channels[ch];
            channel.is_fifo = (1..=2).contains(&ch) && channel.timing() == DmaTiming::Special;
            channel.is_video = ch == 3 && channel.timing() == DmaTiming::Special;

            channel.internal_count = if channel.is_fifo {
                4
            } else {
                let mut c = (channel.count_reg() as u32) & COUNT_MASK[ch];
                if c == 0 {
                    c = COUNT_MASK[ch] + 1;
                }
                c
            };
            let mask = channel.unit_mask();
            channel.internal_src = channel.src() & mask & SRC_MASK[ch];
            channel.internal_dst = channel.dst() & mask & DST_MASK[ch];

            if channel.timing() == DmaTiming::Immediate {
                self.schedule_for(ch, DmaTiming::Immediate, sched);
            }
        } else if old_enable && !new_enable {
            let channel = &mut self.channels[ch];
            if channel.enable_event_handle.is_valid() {
                sched.cancel(channel.enable_event_handle);
                channel.enable_event_handle = EventHandle::INVALID;
            }
            self.pending &= !(1 << ch);
            if self.is_running {
                self.reenter = true;
            }
        }
    }

    /// Arms every enabled channel whose timing matches, 2 cycles in the
    /// future, called by the PPU's HBlank/VBlank callbacks.
    pub fn schedule_for(&mut self, ch: usize, timing: DmaTiming, sched: &mut Scheduler) {
        let channel = &mut self.channels[ch];
        if channel.enabled() && channel.timing() == timing {
            channel.enable_event_handle =
                sched.add(sched.cycles() + 2, false, 0, EventKind::DmaArm, EventArgs::single(ch as u32));
        }
    }

    pub fn schedule_all(&mut self, timing: DmaTiming, sched: &mut Scheduler) {
        for ch in 0..4 {
            self.schedule_for(ch, timing, sched);
        }
    }

    /// Re-arms whichever channel feeds the named FIFO, called by the APU
    /// after it drains a byte and finds the queue running low.
    pub fn schedule_fifo_refill(&mut self, fifo_a: bool, sched: &mut Scheduler) {
        for ch in 1..=2 {
            if self.feeds_fifo(ch, fifo_a) {
                self.schedule_for(ch, DmaTiming::Special, sched);
            }
        }
    }

    /// Handler for a fired `EventKind::DmaArm` event.
    pub fn on_arm_fired(&mut self, ch: usize) {
        self.channels[ch].enable_event_handle = EventHandle::INVALID;
        self.pending |= 1 << ch;
        if self.is_running {
            self.reenter = true;
        }
    }

    /// Runs every pending channel to completion, called from the CPU's idle
    /// loop when `pending != 0 && !is_running`.
    pub fn run_pending(&mut self, bus: &mut Bus, io: &mut IoRegs, apu: &mut Apu, waitcnt: WaitCnt, vcount: u16) {
        if self.pending == 0 {
            return;
        }
        self.is_running = true;

        loop {
            self.reenter = false;
            let mut ran_any = false;
            for ch in 0..4 {
                if self.pending & (1 << ch) == 0 {
                    continue;
                }
                self.run_channel(ch, bus, io, apu, waitcnt, vcount);
                ran_any = true;
                break;
            }
            if !ran_any || self.pending == 0 {
                break;
            }
        }

        self.is_running = false;
    }

    fn run_channel(&mut self, ch: usize, bus: &mut Bus, io: &mut IoRegs, apu: &mut Apu, waitcnt: WaitCnt, vcount: u16) {
        let unit_size: u32 = if self.channels[ch].unit_size_32() { 4 } else { 2 };

        // FIFO-feeding DMA never advances the destination and never touches
        // the bus on the write side: each 32-bit source word is pushed
        // straight into the APU's FIFO a byte at a time.
        if self.channels[ch].is_fifo {
            self.run_fifo_channel(ch, bus, apu, waitcnt);
            self.pending &= !(1 << ch);
            if self.channels[ch].irq_end() {
                io.raise_irq(Irq::dma(ch));
            }
            self.channels[ch].internal_count = 4;
            return;
        }

        let dst_step: i32 = match self.channels[ch].dst_ctl() {
            0b00 => unit_size as i32,
            0b01 => -(unit_size as i32),
            0b10 => 0,
            _ => unit_size as i32,
        };
        let src_step: i32 = match self.channels[ch].src_ctl() {
            0b00 => unit_size as i32,
            0b01 => -(unit_size as i32),
            _ => 0,
        };

        let mut access = AccessType::NonSequential;
        while self.channels[ch].internal_count > 0 && !self.reenter {
            let src = self.channels[ch].internal_src;
            let dst = self.channels[ch].internal_dst;

            if unit_size == 4 {
                if src >= EWRAM_START {
                    let (v, _c) = bus.read32(src, access, waitcnt);
                    self.channels[ch].bus_latch = v;
                }
                bus.write32(dst, self.channels[ch].bus_latch, waitcnt);
            } else {
                if src >= EWRAM_START {
                    let (v, _c) = bus.read16(src, access, waitcnt);
                    self.channels[ch].bus_latch = (self.channels[ch].bus_latch << 16) | v as u32;
                }
                bus.write16(dst, self.channels[ch].bus_latch as u16, waitcnt);
            }

            self.channels[ch].internal_src = (self.channels[ch].internal_src as i64 + src_step as i64) as u32;
            self.channels[ch].internal_dst = (self.channels[ch].internal_dst as i64 + dst_step as i64) as u32;
            self.channels[ch].internal_count -= 1;
            access = AccessType::Sequential;
        }

        if self.reenter {
            return;
        }

        self.pending &= !(1 << ch);
        if self.channels[ch].irq_end() {
            io.raise_irq(Irq::dma(ch));
        }

        if self.channels[ch].repeat() {
            if self.channels[ch].is_video {
                if (vcount as u32) < crate::SCREEN_HEIGHT as u32 + 1 {
                    self.reload_count_and_maybe_dst(ch);
                } else {
                    self.channels[ch].set_control(self.channels[ch].control() & !(1 << 15));
                }
            } else {
                self.reload_count_and_maybe_dst(ch);
            }
        } else {
            self.channels[ch].set_control(self.channels[ch].control() & !(1 << 15));
        }
    }

    /// FIFO-feeding channels always move exactly 4 words (16 bytes) per
    /// re-arm regardless of the programmed count, straight from the bus
    /// into the APU's FIFO — the destination address never advances and is
    /// never actually written through the bus.
    fn run_fifo_channel(&mut self, ch: usize, bus: &mut Bus, apu: &mut Apu, waitcnt: WaitCnt) {
        let fifo_a = (self.channels[ch].dst() & 0xFFF) as usize == crate::io_regs::offset::FIFO_A_L;
        let mut access = AccessType::NonSequential;
        for _ in 0..4 {
            let src = self.channels[ch].internal_src;
            let (word, _c) = bus.read32(src, access, waitcnt);
            for b in word.to_le_bytes() {
                if fifo_a {
                    apu.push_fifo_a(b as i8);
                } else {
                    apu.push_fifo_b(b as i8);
                }
            }
            self.channels[ch].internal_src = self.channels[ch].internal_src.wrapping_add(4);
            access = AccessType::Sequential;
        }
    }

    fn reload_count_and_maybe_dst(&mut self, ch: usize) {
        let mut c = (self.channels[ch].count_reg() as u32) & COUNT_MASK[ch];
        if c == 0 {
            c = COUNT_MASK[ch] + 1;
        }
        self.channels[ch].internal_count = c;
        if self.channels[ch].dst_ctl() == 0b11 {
            let mask = self.channels[ch].unit_mask();
            self.channels[ch].internal_dst = self.channels[ch].dst() & mask & DST_MASK[ch];
        }
    }

    /// True if `dma_channel_idx` is currently wired to feed FIFO `fifo_idx`
    /// (0 = FIFO A, 1 = FIFO B), used by the APU to decide which DMA
    /// channel to re-arm after draining a FIFO.
    pub fn feeds_fifo(&self, dma_channel_idx: usize, fifo_a: bool) -> bool {
        let channel = &self.channels[dma_channel_idx];
        let target = if fifo_a {
            crate::io_regs::offset::FIFO_A_L as u32
        } else {
            crate::io_regs::offset::FIFO_B_L as u32
        };
        channel.enabled() && channel.timing() == DmaTiming::Special && (channel.dst() & 0xFFF) == target
    }

    /// Extends the "I/O block" quicksave section with per-channel internal
    /// DMA state not visible through SAD/DAD/CNT alone. `enable_event_handle`
    /// is saved as its raw table index; it is only meaningful once the
    /// scheduler's event table has been restored from the same snapshot.
    pub fn write_state(&self, w: &mut crate::quicksave::Writer) {
        w.bool(self.is_running);
        w.bool(self.reenter);
        w.u8(self.pending);
        for ch in &self.channels {
            w.bytes(&ch.raw);
            w.u32(ch.internal_src);
            w.u32(ch.internal_dst);
            w.u32(ch.internal_count);
            w.u32(ch.bus_latch);
            w.bool(ch.is_fifo);
            w.bool(ch.is_video);
            w.u32(ch.enable_event_handle.raw_index());
        }
    }

    pub fn read_state(&mut self, r: &mut crate::quicksave::Reader) -> crate::error::EngineResult<()> {
        self.is_running = r.bool()?;
        self.reenter = r.bool()?;
        self.pending = r.u8()?;
        for ch in self.channels.iter_mut() {
            let mut raw = [0u8; 12];
            r.bytes_into(&mut raw)?;
            ch.raw = raw;
            ch.internal_src = r.u32()?;
            ch.internal_dst = r.u32()?;
            ch.internal_count = r.u32()?;
            ch.bus_latch = r.u32()?;
            ch.is_fifo = r.bool()?;
            ch.is_video = r.bool()?;
            ch.enable_event_handle = EventHandle::from_raw_index(r.u32()?);
        }
        Ok(())
    }
}

impl Default for DmaController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::backup::BackupKind;
    use crate::scheduler::Scheduler;

    fn waitcnt() -> WaitCnt {
        WaitCnt(0)
    }

    #[test]
    fn count_zero_is_treated_as_max_length() {
        let mut dma = DmaController::new();
        let mut sched = Scheduler::new();
        dma.write_reg(0xB0, 4, 0x0200_0100, &mut sched); // SAD
        dma.write_reg(0xB4, 4, 0x0600_0000, &mut sched); // DAD
        dma.write_reg(0xB8, 2, 0, &mut sched); // count = 0
        dma.write_reg(0xBA, 2, 0x8000, &mut sched); // enable, timing=immediate
        assert_eq!(dma.channels[0].internal_count, COUNT_MASK[0] + 1);
    }

    #[test]
    fn disabling_clears_pending_bit() {
        let mut dma = DmaController::new();
        let mut sched = Scheduler::new();
        dma.write_reg(0xB0, 4, 0x0200_0100, &mut sched);
        dma.write_reg(0xB4, 4, 0x0600_0000, &mut sched);
        dma.write_reg(0xB8, 2, 4, &mut sched);
        dma.write_reg(0xBA, 2, 0x8000, &mut sched);
        dma.on_arm_fired(0);
        assert!(dma.pending_any());
        dma.write_reg(0xBA, 2, 0x0000, &mut sched);
        assert!(!dma.pending_any());
    }

    #[test]
    fn immediate_dma_copies_bytes_end_to_end() {
        let mut dma = DmaController::new();
        let mut sched = Scheduler::new();
        let mut bus = Bus::new(BackupKind::None, false);
        let mut io = IoRegs::new();
        let mut apu = Apu::new();
        bus.write32(0x0200_0000, 0xCAFEBABE, waitcnt());

        dma.write_reg(0xB0, 4, 0x0200_0000, &mut sched);
        dma.write_reg(0xB4, 4, 0x0600_0000, &mut sched);
        dma.write_reg(0xB8, 2, 1, &mut sched);
        dma.write_reg(0xBA, 2, 0b1000_0100_0000_0000, &mut sched); // enable, 32-bit unit, immediate

        dma.on_arm_fired(0);
        dma.run_pending(&mut bus, &mut io, &mut apu, waitcnt(), 0);

        let (v, _) = bus.read32(0x0600_0000, AccessType::Sequential, waitcnt());
        assert_eq!(v, 0xCAFEBABE);
        assert!(!dma.channels[0].enabled());
    }
}
